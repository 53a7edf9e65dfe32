use crate::std_output_stream::{LogStream, StdOutput};
use crate::{Runtime, SpawnOptions, Worker, WorkerError, WorkerExit, env};
use async_trait::async_trait;
use concepts::WorkerId;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, info, info_span, warn};

const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Runtime name passed to the worker as `RUNTIME`.
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub entrypoint: String,
    pub grpc_address: String,
    /// Variables set on every worker in addition to the injected ones.
    pub env: Vec<(String, String)>,
    pub kill_grace: Duration,
}

#[derive(Debug)]
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
}

impl ProcessRuntime {
    #[must_use]
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        Self { config }
    }
}

impl Runtime for ProcessRuntime {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn spawn(&self, options: SpawnOptions) -> Result<Arc<dyn Worker>, WorkerError> {
        Ok(Arc::new(ProcessWorker::spawn(&self.config, options)?))
    }
}

#[derive(derive_more::Debug)]
pub struct ProcessWorker {
    id: WorkerId,
    pid: Option<u32>,
    #[debug(skip)]
    stdout: watch::Sender<Option<LogStream>>,
    #[debug(skip)]
    stderr: watch::Sender<Option<LogStream>>,
    #[debug(skip)]
    kill_signal: Mutex<Option<oneshot::Sender<()>>>,
    #[debug(skip)]
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl ProcessWorker {
    pub fn spawn(
        config: &ProcessRuntimeConfig,
        options: SpawnOptions,
    ) -> Result<ProcessWorker, WorkerError> {
        let SpawnOptions { id, env: extra_env } = options;
        let program = config.program.to_string_lossy().into_owned();
        debug!(
            worker_id = %id,
            "Spawning worker: program='{program}', args={:?}, cwd={:?}",
            config.args, config.cwd
        );

        let mut cmd = tokio::process::Command::new(&config.program);
        cmd.args(&config.args);
        cmd.env_clear();
        cmd.env(env::FUNCTION_GRPC_ADDRESS, &config.grpc_address);
        cmd.env(env::WORKER_ID, id.to_string());
        cmd.env(env::ENTRYPOINT, &config.entrypoint);
        cmd.env(env::RUNTIME, &config.name);
        for (key, value) in config.env.iter().chain(extra_env.iter()) {
            cmd.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            if !cwd.is_dir() {
                return Err(WorkerError::CwdNotFound(cwd.clone()));
            }
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            warn!("Failed to spawn worker process '{program}': {err:?}");
            match err.kind() {
                std::io::ErrorKind::NotFound => WorkerError::CommandNotFound(program.clone()),
                std::io::ErrorKind::PermissionDenied => {
                    WorkerError::PermissionDenied(program.clone())
                }
                _ => WorkerError::Spawn {
                    program: program.clone(),
                    source: err,
                },
            }
        })?;
        let pid = child.id();
        let span = info_span!("worker", worker_id = %id, pid);

        let (stdout, stdout_sink) = watch::channel(None);
        let (stderr, stderr_sink) = watch::channel(None);
        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(out, stdout_sink)));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(err, stderr_sink)));
        }

        let (kill_signal, kill_receiver) = oneshot::channel();
        let (exit_sender, exit) = watch::channel(None);
        tokio::spawn(
            supervise(child, pid, kill_receiver, config.kill_grace, pumps, exit_sender)
                .instrument(span),
        );
        info!(worker_id = %id, pid, "Spawned worker");
        Ok(ProcessWorker {
            id,
            pid,
            stdout,
            stderr,
            kill_signal: Mutex::new(Some(kill_signal)),
            exit,
        })
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn sink(&self, output: Option<StdOutput>) -> Option<LogStream> {
        output.map(|output| LogStream::new(format!("[{}] ", self.id), output))
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn attach(&self, stdout: Option<StdOutput>, stderr: Option<StdOutput>) {
        self.stdout.send_replace(self.sink(stdout));
        self.stderr.send_replace(self.sink(stderr));
    }

    fn diagnostic(&self, message: &str) {
        let sink = self
            .stderr
            .borrow()
            .clone()
            .or_else(|| self.stdout.borrow().clone());
        match sink {
            Some(sink) => {
                if let Err(err) = sink.write_all(format!("{message}\n").as_bytes()) {
                    warn!(worker_id = %self.id, "Cannot write diagnostic: {err:?}");
                }
            }
            None => warn!(worker_id = %self.id, "{message}"),
        }
    }

    async fn kill(&self) -> WorkerExit {
        let signal = self.kill_signal.lock().unwrap().take();
        if let Some(signal) = signal {
            let _ = signal.send(());
        }
        self.exited().await
    }

    async fn exited(&self) -> WorkerExit {
        let mut exit = self.exit.clone();
        let exit = exit.wait_for(Option::is_some).await.map(|exit| *exit);
        exit.ok().flatten().unwrap_or_default()
    }
}

async fn pump(mut reader: impl AsyncRead + Unpin, sink: watch::Receiver<Option<LogStream>>) {
    let mut buf = vec![0; 8 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(len) => {
                let stream = sink.borrow().clone();
                if let Some(stream) = stream {
                    let _ = stream.write_all(&buf[..len]);
                }
            }
            Err(err) => {
                debug!("Stopped reading worker output: {err:?}");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: tokio::process::Child,
    pid: Option<u32>,
    kill_receiver: oneshot::Receiver<()>,
    kill_grace: Duration,
    pumps: Vec<JoinHandle<()>>,
    exit_sender: watch::Sender<Option<WorkerExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_receiver => {
            if terminate(pid) {
                match tokio::time::timeout(kill_grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_elapsed) => {
                        warn!("Worker did not exit within {kill_grace:?}, killing it");
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            } else {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    };
    let exit = match status {
        Ok(status) => WorkerExit {
            code: status.code(),
        },
        Err(err) => {
            warn!("Waiting on worker process failed: {err:?}");
            WorkerExit::default()
        }
    };
    // Orphaned grandchildren may keep the pipes open.
    let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;
    info!("Worker exited with {exit}");
    exit_sender.send_replace(Some(exit));
}

#[cfg(unix)]
fn terminate(pid: Option<u32>) -> bool {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: `kill(2)` has no memory-safety preconditions. Only `supervise` calls this,
    // while its `child.wait()` is still pending, so the child is not reaped and the pid
    // cannot have been reused by another process.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Instant;

    fn config(program: &str, args: &[&str]) -> ProcessRuntimeConfig {
        ProcessRuntimeConfig {
            name: "exec".to_string(),
            program: PathBuf::from(program),
            args: args.iter().map(ToString::to_string).collect(),
            cwd: None,
            entrypoint: "index.toml".to_string(),
            grpc_address: "http://127.0.0.1:5005".to_string(),
            env: vec![(
                "PATH".to_string(),
                std::env::var("PATH").unwrap_or_default(),
            )],
            kill_grace: Duration::from_secs(5),
        }
    }

    fn output_of(buffer: &Mutex<Vec<u8>>) -> String {
        String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
    }

    #[tokio::test]
    async fn injects_environment_and_forwards_output() {
        test_utils::set_up();
        let runtime = ProcessRuntime::new(config(
            "sh",
            &["-c", "sleep 0.3; echo $WORKER_ID $ENTRYPOINT $RUNTIME $FUNCTION_GRPC_ADDRESS"],
        ));
        let id = WorkerId::generate();
        let worker = runtime.spawn(SpawnOptions::new(id)).unwrap();
        let (stdout, buffer) = StdOutput::buffer();
        worker.attach(Some(stdout), None);
        assert_eq!(Some(0), worker.exited().await.code);
        assert_eq!(
            format!("[{id}] {id} index.toml exec http://127.0.0.1:5005\n"),
            output_of(&buffer)
        );
    }

    #[tokio::test]
    async fn kill_resolves_after_exit() {
        test_utils::set_up();
        let runtime = ProcessRuntime::new(config("sleep", &["30"]));
        let worker = runtime.spawn(SpawnOptions::new(WorkerId::generate())).unwrap();
        let started = Instant::now();
        let exit = worker.kill().await;
        assert_eq!(None, exit.code);
        assert!(started.elapsed() < Duration::from_secs(5));
        // Idempotent once exited.
        assert_eq!(exit, worker.kill().await);
    }

    #[tokio::test]
    async fn kill_after_exit_does_not_signal_again() {
        test_utils::set_up();
        let runtime = ProcessRuntime::new(config("sh", &["-c", "exit 3"]));
        let worker = runtime.spawn(SpawnOptions::new(WorkerId::generate())).unwrap();
        assert_eq!(Some(3), worker.exited().await.code);
        // The reaped pid is never signalled, the recorded exit is returned as is.
        assert_eq!(Some(3), worker.kill().await.code);
        assert!(!terminate(None));
    }

    #[tokio::test]
    async fn kill_escalates_when_termination_is_ignored() {
        test_utils::set_up();
        let mut config = config("sh", &["-c", "trap '' TERM; sleep 30"]);
        config.kill_grace = Duration::from_millis(300);
        let worker = ProcessRuntime::new(config)
            .spawn(SpawnOptions::new(WorkerId::generate()))
            .unwrap();
        // Let the shell install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        assert_eq!(None, worker.kill().await.code);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn diagnostic_goes_to_attached_stderr() {
        test_utils::set_up();
        let worker = ProcessRuntime::new(config("sleep", &["30"]))
            .spawn(SpawnOptions::new(WorkerId::generate()))
            .unwrap();
        let (stdout, stdout_buffer) = StdOutput::buffer();
        let (stderr, stderr_buffer) = StdOutput::buffer();
        worker.attach(Some(stdout), Some(stderr));
        worker.diagnostic("event timed out");
        assert!(output_of(&stderr_buffer).ends_with("event timed out\n"));
        assert!(output_of(&stdout_buffer).is_empty());
        worker.kill().await;
    }

    #[tokio::test]
    async fn reattaching_replaces_previous_sink() {
        test_utils::set_up();
        let worker = ProcessRuntime::new(config("sh", &["-c", "sleep 0.4; echo late"]))
            .spawn(SpawnOptions::new(WorkerId::generate()))
            .unwrap();
        let (first, first_buffer) = StdOutput::buffer();
        let (second, second_buffer) = StdOutput::buffer();
        worker.attach(Some(first), None);
        worker.attach(Some(second), None);
        worker.exited().await;
        assert!(output_of(&first_buffer).is_empty());
        assert!(output_of(&second_buffer).ends_with("late\n"));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        test_utils::set_up();
        let runtime = ProcessRuntime::new(config("/nonexistent/spindle-runtime", &[]));
        assert_matches!(
            runtime
                .spawn(SpawnOptions::new(WorkerId::generate()))
                .map(|_| ()),
            Err(WorkerError::CommandNotFound(_))
        );
    }

    #[tokio::test]
    async fn missing_cwd_is_reported() {
        test_utils::set_up();
        let mut config = config("sleep", &["1"]);
        config.cwd = Some(PathBuf::from("/nonexistent/spindle-cwd"));
        assert_matches!(
            ProcessRuntime::new(config)
                .spawn(SpawnOptions::new(WorkerId::generate()))
                .map(|_| ()),
            Err(WorkerError::CwdNotFound(_))
        );
    }
}
