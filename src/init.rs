use crate::config::toml::{ConfigToml, log::LoggingStyle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;

pub(crate) fn init(config: &mut ConfigToml) -> Guard {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let out_layer = config
        .log
        .stdout
        .as_mut()
        .filter(|out| out.enabled)
        .map(|out| {
            // EnvFilter missing Clone
            let env_filter = std::mem::take(&mut out.common.level).0;

            // Code repetition because of https://github.com/tokio-rs/tracing/issues/575
            match out.style {
                LoggingStyle::Plain => tracing_subscriber::fmt::layer()
                    .with_target(out.common.target)
                    .with_span_events(out.common.span.into())
                    .with_filter(env_filter)
                    .boxed(),
                LoggingStyle::PlainCompact => tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(out.common.target)
                    .with_span_events(out.common.span.into())
                    .with_filter(env_filter)
                    .boxed(),
                LoggingStyle::Json => tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(out.common.target)
                    .with_span_events(out.common.span.into())
                    .with_filter(env_filter)
                    .boxed(),
            }
        });

    let (file_layer, file_guard) = match config.log.file.as_mut() {
        Some(file) => {
            let env_filter = std::mem::take(&mut file.common.level).0;
            let appender = tracing_appender::rolling::RollingFileAppender::new(
                file.rotation.into(),
                &file.directory,
                &file.prefix,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = match file.style {
                LoggingStyle::Plain => tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(file.common.target)
                    .with_span_events(file.common.span.into())
                    .with_filter(env_filter)
                    .boxed(),
                LoggingStyle::PlainCompact => tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(file.common.target)
                    .with_span_events(file.common.span.into())
                    .with_filter(env_filter)
                    .boxed(),
                LoggingStyle::Json => tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(file.common.target)
                    .with_span_events(file.common.span.into())
                    .with_filter(env_filter)
                    .boxed(),
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(out_layer)
        .with(file_layer)
        .init();

    std::panic::set_hook(Box::new(utils::tracing_panic_hook));
    Guard {
        _file_guard: file_guard,
    }
}

/// Flushes the rolling file appender when dropped.
pub(crate) struct Guard {
    _file_guard: Option<WorkerGuard>,
}
