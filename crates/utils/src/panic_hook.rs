use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

fn payload<'a>(panic_info: &'a PanicHookInfo<'_>) -> Option<&'a str> {
    let payload = panic_info.payload();
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Reports panics through tracing, falling back to stderr when no subscriber listens.
pub fn tracing_panic_hook(panic_info: &PanicHookInfo) {
    let payload = payload(panic_info);
    let location = panic_info.location().map(ToString::to_string);
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let backtrace = Backtrace::capture();
    let backtrace = (backtrace.status() == BacktraceStatus::Captured)
        .then(|| format!("\n{backtrace}"))
        .unwrap_or_default();
    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            panic.payload = payload,
            panic.location = location,
            panic.thread = thread,
            "A panic occurred{backtrace}"
        );
    } else if let Some(payload) = payload {
        eprintln!("A panic occurred in thread `{thread}`: {payload}{backtrace}");
    } else {
        eprintln!("A panic occurred in thread `{thread}`{backtrace}");
    }
}
