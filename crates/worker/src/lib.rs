pub mod process;
pub mod std_output_stream;
#[cfg(any(test, feature = "test"))]
pub mod testing;

use async_trait::async_trait;
use concepts::WorkerId;
use std::{fmt::Display, path::PathBuf, sync::Arc};
use std_output_stream::StdOutput;

/// Exit code of a worker process that could not resolve or start its handler.
pub const EXIT_CODE_HANDLER_RESOLUTION: i32 = 126;

/// Environment contract between the dispatcher and spawned worker processes.
pub mod env {
    pub const FUNCTION_GRPC_ADDRESS: &str = "FUNCTION_GRPC_ADDRESS";
    pub const WORKER_ID: &str = "WORKER_ID";
    pub const ENTRYPOINT: &str = "ENTRYPOINT";
    pub const RUNTIME: &str = "RUNTIME";
    pub const DATABASE_URI: &str = "DATABASE_URI";
    pub const DATABASE_NAME: &str = "DATABASE_NAME";
    pub const REPLICA_SET: &str = "REPLICA_SET";
    pub const PUBLIC_URL: &str = "PUBLIC_URL";
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub id: WorkerId,
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    #[must_use]
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl WorkerExit {
    #[must_use]
    pub fn is_handler_resolution_failure(&self) -> bool {
        self.code == Some(EXIT_CODE_HANDLER_RESOLUTION)
    }
}

impl Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("command not found: `{0}`")]
    CommandNotFound(String),
    #[error("permission denied while spawning `{0}`")]
    PermissionDenied(String),
    #[error("working directory not found: {0:?}")]
    CwdNotFound(PathBuf),
    #[error("cannot spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

/// Handle to one running worker process.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn id(&self) -> WorkerId;

    /// Pipes process output to the sinks. Any previously attached sinks are detached first.
    fn attach(&self, stdout: Option<StdOutput>, stderr: Option<StdOutput>);

    /// Writes a line to the attached stderr sink, falling back to stdout.
    fn diagnostic(&self, message: &str);

    /// Sends a termination signal and resolves once the process has actually exited.
    async fn kill(&self) -> WorkerExit;

    async fn exited(&self) -> WorkerExit;
}

/// Spawns workers of one language runtime.
pub trait Runtime: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn spawn(&self, options: SpawnOptions) -> Result<Arc<dyn Worker>, WorkerError>;
}
