use super::env_var::EnvVarConfig;
use concepts::Trigger;
use indexmap::IndexMap;
use log::{AppenderCommon, AppenderOut, LoggingConfig, LoggingStyle};
use serde::Deserialize;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

pub(crate) const DEFAULT_API_PORT: u16 = 5005;
pub(crate) const DEFAULT_HTTP_PORT: u16 = 8080;
pub(crate) const DEFAULT_FIREHOSE_PORT: u16 = 8081;
pub(crate) const EXEC_RUNTIME: &str = "exec";
pub(crate) const DEFAULT_ENTRYPOINT: &str = "handlers.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigToml {
    #[serde(default)]
    pub(crate) api: ApiConfig,
    #[serde(default)]
    pub(crate) http: HttpConfig,
    #[serde(default)]
    pub(crate) firehose: FirehoseConfig,
    #[serde(default)]
    pub(crate) scheduler: SchedulerConfigToml,
    #[serde(default)]
    pub(crate) runtime: RuntimeConfigToml,
    #[serde(default)]
    pub(crate) database: Option<DatabaseConfigToml>,
    /// Address under which the HTTP enqueuer is reachable from outside, passed to workers.
    #[serde(default)]
    pub(crate) public_url: Option<String>,
    #[serde(default)]
    pub(crate) log: LoggingConfig,
    #[serde(default, rename = "function")]
    pub(crate) functions: Vec<FunctionConfigToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ApiConfig {
    pub(crate) listening_addr: SocketAddr,
}
impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listening_addr: localhost(DEFAULT_API_PORT),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HttpConfig {
    #[serde(default = "default_http_listening_addr")]
    pub(crate) listening_addr: SocketAddr,
    #[serde(default = "default_path_prefix")]
    pub(crate) path_prefix: String,
    /// Largest accepted request body in bytes.
    #[serde(default = "default_max_body_size")]
    pub(crate) max_body_size: usize,
}
impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listening_addr: default_http_listening_addr(),
            path_prefix: default_path_prefix(),
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FirehoseConfig {
    #[serde(default = "default_firehose_listening_addr")]
    pub(crate) listening_addr: SocketAddr,
}
impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            listening_addr: default_firehose_listening_addr(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SchedulerConfigToml {
    #[serde(default = "default_pool_size")]
    pub(crate) pool_size: usize,
    /// Upper bound of every event's execution, targets may only lower it.
    #[serde(default = "default_timeout")]
    pub(crate) timeout: DurationConfig,
    #[serde(default = "default_kill_grace")]
    pub(crate) kill_grace: DurationConfig,
    #[serde(default = "default_queue_capacity")]
    pub(crate) queue_capacity: usize,
    #[serde(default = "default_respawn_backoff")]
    pub(crate) respawn_backoff: DurationConfig,
    /// Quiet period after the last `READY` subscription before the event fires.
    #[serde(default = "default_ready_debounce")]
    pub(crate) ready_debounce: DurationConfig,
}
impl Default for SchedulerConfigToml {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            timeout: default_timeout(),
            kill_grace: default_kill_grace(),
            queue_capacity: default_queue_capacity(),
            respawn_backoff: default_respawn_backoff(),
            ready_debounce: default_ready_debounce(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RuntimeConfigToml {
    #[serde(default = "default_runtime_name")]
    pub(crate) name: String,
    /// Worker executable. The `exec` runtime defaults to this binary's `worker` subcommand.
    #[serde(default)]
    pub(crate) program: Option<PathBuf>,
    #[serde(default)]
    pub(crate) args: Vec<String>,
    #[serde(default = "default_entrypoint")]
    pub(crate) entrypoint: String,
    #[serde(default = "default_forward_stdout")]
    pub(crate) forward_stdout: StdOutput,
    #[serde(default = "default_forward_stderr")]
    pub(crate) forward_stderr: StdOutput,
    /// Workers start with an empty environment apart from these and the injected contract.
    #[serde(default = "default_runtime_env_vars")]
    pub(crate) env_vars: Vec<EnvVarConfig>,
}
impl Default for RuntimeConfigToml {
    fn default() -> Self {
        Self {
            name: default_runtime_name(),
            program: None,
            args: Vec::new(),
            entrypoint: default_entrypoint(),
            forward_stdout: default_forward_stdout(),
            forward_stderr: default_forward_stderr(),
            env_vars: default_runtime_env_vars(),
        }
    }
}

/// Connection details handed to workers, the server itself never connects.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DatabaseConfigToml {
    pub(crate) uri: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) replica_set: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FunctionConfigToml {
    pub(crate) id: String,
    pub(crate) cwd: PathBuf,
    #[serde(default)]
    pub(crate) timeout: Option<DurationConfig>,
    #[serde(default)]
    pub(crate) env_vars: Vec<EnvVarConfig>,
    #[serde(default)]
    pub(crate) batch: Option<BatchConfigToml>,
    /// Keyed by handler name.
    #[serde(default)]
    pub(crate) triggers: IndexMap<String, Trigger>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BatchConfigToml {
    pub(crate) limit: u32,
    pub(crate) deadline: DurationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DurationConfig {
    Secs(u64),
    Millis(u64),
}

impl From<DurationConfig> for Duration {
    fn from(value: DurationConfig) -> Self {
        match value {
            DurationConfig::Millis(millis) => Duration::from_millis(millis),
            DurationConfig::Secs(secs) => Duration::from_secs(secs),
        }
    }
}

pub(crate) mod log {
    use super::{Deserialize, default_out_style};
    use serde_with::serde_as;
    use std::str::FromStr;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct LoggingConfig {
        #[serde(default)]
        pub(crate) file: Option<AppenderRollingFile>,
        #[serde(default)]
        pub(crate) stdout: Option<AppenderOut>,
    }

    #[derive(Debug, Deserialize, Default, Copy, Clone)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum SpanConfig {
        /// spans are ignored (this is the default)
        #[default]
        None,
        /// one event when span is created
        New,
        /// one event per enter of a span
        Enter,
        /// one event per exit of a span
        Exit,
        /// one event when the span is dropped
        Close,
        /// one event per enter/exit of a span
        Active,
        /// events at all points (new, enter, exit, drop)
        Full,
    }

    impl From<SpanConfig> for tracing_subscriber::fmt::format::FmtSpan {
        fn from(value: SpanConfig) -> Self {
            match value {
                SpanConfig::None => Self::NONE,
                SpanConfig::New => Self::NEW,
                SpanConfig::Enter => Self::ENTER,
                SpanConfig::Exit => Self::EXIT,
                SpanConfig::Close => Self::CLOSE,
                SpanConfig::Active => Self::ACTIVE,
                SpanConfig::Full => Self::FULL,
            }
        }
    }

    #[derive(Debug, Deserialize, Default, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum LoggingStyle {
        #[default]
        Plain,
        PlainCompact,
        Json,
    }

    #[serde_as]
    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct AppenderCommon {
        #[serde(default)]
        pub(crate) level: EnvFilter,
        #[serde(default)]
        pub(crate) span: SpanConfig,
        #[serde(default)]
        pub(crate) target: bool,
    }

    #[derive(Debug, serde_with::DeserializeFromStr)]
    pub(crate) struct EnvFilter(pub(crate) tracing_subscriber::EnvFilter);
    impl FromStr for EnvFilter {
        type Err = tracing_subscriber::filter::ParseError;

        fn from_str(directives: &str) -> Result<Self, Self::Err> {
            tracing_subscriber::EnvFilter::builder()
                .parse(directives)
                .map(Self)
        }
    }
    impl Default for EnvFilter {
        fn default() -> Self {
            Self(tracing_subscriber::EnvFilter::new("info"))
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct AppenderOut {
        pub(crate) enabled: bool,
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        #[serde(default = "default_out_style")]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct AppenderRollingFile {
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        pub(crate) directory: String,
        pub(crate) prefix: String,
        pub(crate) rotation: Rotation,
        #[serde(default)]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize, Clone, Copy)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum Rotation {
        Minutely,
        Hourly,
        Daily,
        Never,
    }
    impl From<Rotation> for tracing_appender::rolling::Rotation {
        fn from(value: Rotation) -> Self {
            match value {
                Rotation::Minutely => Self::MINUTELY,
                Rotation::Hourly => Self::HOURLY,
                Rotation::Daily => Self::DAILY,
                Rotation::Never => Self::NEVER,
            }
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            stdout: Some(AppenderOut {
                enabled: true,
                common: AppenderCommon::default(),
                style: default_out_style(),
            }),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StdOutput {
    #[default]
    None,
    Stdout,
    Stderr,
}
impl From<StdOutput> for Option<worker::std_output_stream::StdOutput> {
    fn from(value: StdOutput) -> Self {
        match value {
            StdOutput::None => None,
            StdOutput::Stdout => Some(worker::std_output_stream::StdOutput::Stdout),
            StdOutput::Stderr => Some(worker::std_output_stream::StdOutput::Stderr),
        }
    }
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

fn default_http_listening_addr() -> SocketAddr {
    localhost(DEFAULT_HTTP_PORT)
}

fn default_firehose_listening_addr() -> SocketAddr {
    localhost(DEFAULT_FIREHOSE_PORT)
}

fn default_path_prefix() -> String {
    enqueuers::http::DEFAULT_PATH_PREFIX.to_string()
}

const fn default_max_body_size() -> usize {
    enqueuers::http::DEFAULT_MAX_BODY_SIZE
}

const fn default_pool_size() -> usize {
    scheduler::scheduler::DEFAULT_POOL_SIZE
}

const fn default_timeout() -> DurationConfig {
    DurationConfig::Secs(scheduler::scheduler::DEFAULT_TIMEOUT.as_secs())
}

const fn default_kill_grace() -> DurationConfig {
    DurationConfig::Secs(5)
}

const fn default_queue_capacity() -> usize {
    queue::DEFAULT_QUEUE_CAPACITY
}

const fn default_respawn_backoff() -> DurationConfig {
    DurationConfig::Secs(scheduler::scheduler::DEFAULT_RESPAWN_BACKOFF.as_secs())
}

const fn default_ready_debounce() -> DurationConfig {
    DurationConfig::Secs(enqueuers::system::DEFAULT_DEBOUNCE.as_secs())
}

fn default_runtime_name() -> String {
    EXEC_RUNTIME.to_string()
}

fn default_entrypoint() -> String {
    DEFAULT_ENTRYPOINT.to_string()
}

fn default_runtime_env_vars() -> Vec<EnvVarConfig> {
    vec![EnvVarConfig {
        key: "PATH".to_string(),
        val: None,
    }]
}

const fn default_forward_stdout() -> StdOutput {
    StdOutput::Stdout
}

const fn default_forward_stderr() -> StdOutput {
    StdOutput::Stderr
}

fn default_out_style() -> LoggingStyle {
    LoggingStyle::PlainCompact
}
