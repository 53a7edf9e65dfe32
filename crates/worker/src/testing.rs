use crate::std_output_stream::StdOutput;
use crate::{Runtime, SpawnOptions, Worker, WorkerError, WorkerExit};
use async_trait::async_trait;
use concepts::WorkerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Runtime spawning in-memory workers that never exit on their own.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    spawned: Mutex<Vec<Arc<FakeWorker>>>,
    fail_spawn: AtomicBool,
}

impl FakeRuntime {
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<FakeWorker>> {
        self.spawned.lock().unwrap().clone()
    }

    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    #[must_use]
    pub fn worker(&self, id: &WorkerId) -> Option<Arc<FakeWorker>> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .find(|worker| worker.id == *id)
            .cloned()
    }

    /// Workers that were not killed and did not exit.
    #[must_use]
    pub fn alive(&self) -> Vec<Arc<FakeWorker>> {
        self.workers()
            .into_iter()
            .filter(|worker| !worker.has_exited())
            .collect()
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::Relaxed);
    }
}

impl Runtime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn spawn(&self, options: SpawnOptions) -> Result<Arc<dyn Worker>, WorkerError> {
        if self.fail_spawn.load(Ordering::Relaxed) {
            return Err(WorkerError::CommandNotFound("fake".to_string()));
        }
        let (exit, _) = watch::channel(None);
        let worker = Arc::new(FakeWorker {
            id: options.id,
            env: options.env,
            exit,
            killed: AtomicBool::new(false),
            diagnostics: Mutex::default(),
            attached: Mutex::default(),
        });
        self.spawned.lock().unwrap().push(worker.clone());
        Ok(worker)
    }
}

#[derive(Debug)]
pub struct FakeWorker {
    pub id: WorkerId,
    pub env: Vec<(String, String)>,
    exit: watch::Sender<Option<WorkerExit>>,
    killed: AtomicBool,
    diagnostics: Mutex<Vec<String>>,
    attached: Mutex<(Option<StdOutput>, Option<StdOutput>)>,
}

impl FakeWorker {
    /// Simulates the process dying on its own.
    pub fn crash(&self, code: i32) {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(WorkerExit { code: Some(code) });
                true
            } else {
                false
            }
        });
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.lock().unwrap().clone()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        let attached = self.attached.lock().unwrap();
        attached.0.is_some() || attached.1.is_some()
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn attach(&self, stdout: Option<StdOutput>, stderr: Option<StdOutput>) {
        *self.attached.lock().unwrap() = (stdout, stderr);
    }

    fn diagnostic(&self, message: &str) {
        self.diagnostics.lock().unwrap().push(message.to_string());
    }

    async fn kill(&self) -> WorkerExit {
        self.killed.store(true, Ordering::Relaxed);
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(WorkerExit { code: None });
                true
            } else {
                false
            }
        });
        self.exited().await
    }

    async fn exited(&self) -> WorkerExit {
        let mut exit = self.exit.subscribe();
        let exit = exit.wait_for(Option::is_some).await.map(|exit| *exit);
        exit.ok().flatten().unwrap_or_default()
    }
}
