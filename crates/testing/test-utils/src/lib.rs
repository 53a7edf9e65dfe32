use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{
    FmtContext, FormattedFields,
    format::{self, FormatEvent, FormatFields},
};
use tracing_subscriber::registry::LookupSpan;

static INIT: std::sync::Once = std::sync::Once::new();

/// `MM:SS.mmm LEVEL message fields @ target in span{fields} > span{fields}`
struct TestFormatter;

impl<S, N> FormatEvent<S, N> for TestFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{} {: <5} ",
            chrono::Utc::now().format("%M:%S%.3f"),
            metadata.level(),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        write!(writer, " @ {}", metadata.target())?;

        if let Some(scope) = ctx.event_scope() {
            let mut separator = " in ";
            for span in scope.from_root() {
                write!(writer, "{separator}{}", span.name())?;
                separator = " > ";
                let extensions = span.extensions();
                if let Some(fields) = extensions
                    .get::<FormattedFields<N>>()
                    .filter(|fields| !fields.is_empty())
                {
                    write!(writer, "{{{fields}}}")?;
                }
            }
        }
        writeln!(writer)
    }
}

/// Installs the tracing subscriber and the panic hook once per test binary.
/// Filtering follows `RUST_LOG`.
pub fn set_up() {
    INIT.call_once(|| {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        std::panic::set_hook(Box::new(utils::tracing_panic_hook));
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .event_format(TestFormatter),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}
