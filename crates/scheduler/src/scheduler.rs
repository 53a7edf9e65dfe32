use crate::dispatcher::{Assignment, Dispatcher};
use crate::reconcile::Reconciliation;
use concepts::{
    Context, Event, EventId, EventOutcome, FailureKind, FunctionId, FunctionSpec, TargetChange,
    TargetFilter, WorkerId,
};
use enqueuers::{EnqueuerRegistry, SubscriptionError};
use hashbrown::HashMap;
use queue::{EventQueue, QueueError, QueueMessage};
use std::collections::VecDeque;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{Instrument as _, Level, debug, error, info, info_span, instrument, trace, warn};
use worker::{Runtime, SpawnOptions, Worker, WorkerExit, std_output_stream::StdOutput};

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    /// Upper bound of every event's execution. Targets can only shorten it.
    pub timeout: Duration,
    /// Delay before retrying a failed worker spawn.
    pub respawn_backoff: Duration,
    pub forward_stdout: Option<StdOutput>,
    pub forward_stderr: Option<StdOutput>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_TIMEOUT,
            respawn_backoff: DEFAULT_RESPAWN_BACKOFF,
            forward_stdout: None,
            forward_stderr: None,
        }
    }
}

/// Worker counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, derive_more::Display)]
#[display(
    "spawning: {spawning}, ready: {ready}, busy: {busy}, draining: {draining}, pending events: {pending}"
)]
pub struct PoolStatus {
    pub spawning: usize,
    pub ready: usize,
    /// Executing an event or between completing it and asking for the next one.
    pub busy: usize,
    pub draining: usize,
    pub pending: usize,
}

impl PoolStatus {
    #[must_use]
    pub fn size(&self) -> usize {
        self.spawning + self.ready + self.busy + self.draining
    }
}

type PopReply = oneshot::Sender<Result<Event, QueueError>>;

enum WorkerState {
    /// Has not asked for an event yet.
    Spawning,
    /// Parked in a pop.
    Ready(PopReply),
    Busy {
        event_id: EventId,
        timer: AbortHandle,
    },
    /// Completed its event, the next pop has not arrived yet.
    Idle,
    /// Being killed.
    Draining,
}

struct PoolWorker {
    handle: Arc<dyn Worker>,
    state: WorkerState,
}

impl PoolWorker {
    fn take_parked(&mut self) -> Option<PopReply> {
        if !matches!(self.state, WorkerState::Ready(_)) {
            return None;
        }
        match std::mem::replace(&mut self.state, WorkerState::Idle) {
            WorkerState::Ready(reply) => Some(reply),
            _ => None,
        }
    }
}

#[derive(derive_more::Debug)]
enum Internal {
    Exited {
        worker_id: WorkerId,
        exit: WorkerExit,
    },
    Timeout {
        worker_id: WorkerId,
        event_id: EventId,
        after: Duration,
    },
    Respawn,
    Status(#[debug(skip)] oneshot::Sender<PoolStatus>),
}

/// Owns the dispatcher tables and the worker pool. All state changes happen on its task.
struct SchedulerTask {
    config: SchedulerConfig,
    runtime: Arc<dyn Runtime>,
    queue: EventQueue,
    internal: mpsc::UnboundedSender<Internal>,
    dispatcher: Dispatcher,
    workers: HashMap<WorkerId, PoolWorker>,
    in_flight: HashMap<EventId, WorkerId>,
    respawn_scheduled: bool,
}

impl SchedulerTask {
    async fn run(
        mut self,
        mut messages: mpsc::Receiver<QueueMessage>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!(
            pool_size = self.config.pool_size,
            runtime = self.runtime.name(),
            "Starting the worker pool"
        );
        self.replenish();
        loop {
            let chain_deadline = self.dispatcher.next_chain_deadline();
            tokio::select! {
                message = messages.recv() => match message {
                    Some(QueueMessage::Enqueued(event)) => self.on_enqueued(event),
                    Some(QueueMessage::GotWorker { worker_id, reply }) => {
                        self.on_got_worker(worker_id, reply);
                    }
                    Some(QueueMessage::Complete { event_id, succeeded, reply }) => {
                        let _ = reply.send(self.on_complete(event_id, succeeded));
                    }
                    Some(QueueMessage::Kill { reply }) => {
                        self.kill().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.kill().await;
                        return;
                    }
                },
                Some(message) = internal.recv() => self.on_internal(message),
                () = tokio::time::sleep_until(chain_deadline.unwrap_or_else(Instant::now)),
                    if chain_deadline.is_some() =>
                {
                    let assignments = self.dispatcher.expire_chains(Instant::now());
                    self.deliver(assignments);
                }
            }
        }
    }

    fn on_internal(&mut self, message: Internal) {
        trace!("Got {message:?}");
        match message {
            Internal::Exited { worker_id, exit } => self.on_exited(worker_id, exit),
            Internal::Timeout {
                worker_id,
                event_id,
                after,
            } => self.on_timeout(worker_id, event_id, after),
            Internal::Respawn => {
                self.respawn_scheduled = false;
                self.replenish();
            }
            Internal::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(event_id = %event.id, event_type = %event.event_type))]
    fn on_enqueued(&mut self, event: Event) {
        trace!(target_key = %event.target.key(), "Enqueued");
        let assignment = self.dispatcher.on_enqueued(event, Instant::now());
        self.deliver(assignment.into_iter().collect());
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(%worker_id))]
    fn on_got_worker(&mut self, worker_id: WorkerId, reply: PopReply) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            debug!("Pop from an unknown worker");
            let _ = reply.send(Err(QueueError::UnknownWorker(worker_id)));
            return;
        };
        match std::mem::replace(&mut worker.state, WorkerState::Idle) {
            WorkerState::Draining => {
                worker.state = WorkerState::Draining;
                let _ = reply.send(Err(QueueError::Cancelled));
                return;
            }
            WorkerState::Ready(_previous) => {
                // The dispatcher already counts the worker as ready.
                worker.state = WorkerState::Ready(reply);
                return;
            }
            WorkerState::Busy { event_id, timer } => {
                timer.abort();
                self.in_flight.remove(&event_id);
                warn!(%event_id, "Worker asked for the next event without completing the previous one");
                self.queue
                    .settle(&event_id, EventOutcome::Failed(FailureKind::Handler));
            }
            WorkerState::Spawning | WorkerState::Idle => {}
        }
        worker.state = WorkerState::Ready(reply);
        let assignment = self.dispatcher.on_worker_ready(worker_id, Instant::now());
        self.deliver(assignment.into_iter().collect());
    }

    fn deliver(&mut self, assignments: Vec<Assignment>) {
        let mut assignments = VecDeque::from(assignments);
        while let Some(Assignment { worker_id, event }) = assignments.pop_front() {
            let reply = self
                .workers
                .get_mut(&worker_id)
                .and_then(PoolWorker::take_parked);
            let event_id = event.id;
            let Some(reply) = reply else {
                error!(%worker_id, %event_id, "Assigned worker is not parked");
                self.dispatcher.requeue_front(event);
                assignments.extend(self.dispatcher.remove_worker(worker_id, Instant::now()));
                continue;
            };
            let timeout = self.config.timeout.min(event.target.context.timeout);
            debug!(%worker_id, %event_id, target_key = %event.target.key(), ?timeout, "Assigning event");
            if let Err(Ok(event)) = reply.send(Ok(event)) {
                debug!(%worker_id, %event_id, "Worker stopped waiting, requeuing the event");
                self.dispatcher.requeue_front(event);
                assignments.extend(self.dispatcher.remove_worker(worker_id, Instant::now()));
                continue;
            }
            let timer = self.start_timer(worker_id, event_id, timeout);
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.state = WorkerState::Busy { event_id, timer };
            }
            self.in_flight.insert(event_id, worker_id);
        }
    }

    fn start_timer(&self, worker_id: WorkerId, event_id: EventId, after: Duration) -> AbortHandle {
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = internal.send(Internal::Timeout {
                worker_id,
                event_id,
                after,
            });
        })
        .abort_handle()
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    fn on_complete(&mut self, event_id: EventId, succeeded: bool) -> Result<(), QueueError> {
        let Some(worker_id) = self.in_flight.remove(&event_id) else {
            debug!("Completion of an unknown event");
            return Err(QueueError::NoItem(event_id));
        };
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if let WorkerState::Busy { timer, .. } = &worker.state {
                timer.abort();
            }
            worker.state = WorkerState::Idle;
        }
        let outcome = EventOutcome::from_completion(succeeded);
        debug!(%worker_id, %outcome, "Event completed");
        self.queue.settle(&event_id, outcome);
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    fn on_timeout(&mut self, worker_id: WorkerId, event_id: EventId, after: Duration) {
        if self.in_flight.get(&event_id) != Some(&worker_id) {
            trace!("Event was already settled");
            return;
        }
        self.in_flight.remove(&event_id);
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        warn!("Event timed out after {after:?}, killing the worker");
        worker
            .handle
            .diagnostic(&format!("Event {event_id} timed out after {after:?}"));
        worker.state = WorkerState::Draining;
        let handle = worker.handle.clone();
        self.queue
            .settle(&event_id, EventOutcome::Failed(FailureKind::Timeout));
        // The exit watcher reports the death and triggers the replacement.
        tokio::spawn(
            async move {
                let exit = handle.kill().await;
                debug!("Killed with {exit}");
            }
            .instrument(info_span!("worker_kill", %worker_id)),
        );
        let assignments = self.dispatcher.remove_worker(worker_id, Instant::now());
        self.deliver(assignments);
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    fn on_exited(&mut self, worker_id: WorkerId, exit: WorkerExit) {
        let Some(worker) = self.workers.remove(&worker_id) else {
            return;
        };
        if exit.is_handler_resolution_failure() {
            error!("Worker could not resolve its handler");
        }
        match worker.state {
            WorkerState::Busy { event_id, timer } => {
                timer.abort();
                self.in_flight.remove(&event_id);
                warn!(%event_id, "Worker crashed while processing an event");
                self.queue
                    .settle(&event_id, EventOutcome::Failed(FailureKind::WorkerCrash));
            }
            WorkerState::Draining => debug!("Worker drained"),
            _ => warn!("Worker exited unexpectedly"),
        }
        let assignments = self.dispatcher.remove_worker(worker_id, Instant::now());
        self.deliver(assignments);
        self.replenish();
    }

    fn replenish(&mut self) {
        while self.workers.len() < self.config.pool_size {
            let worker_id = WorkerId::generate();
            match self.runtime.spawn(SpawnOptions::new(worker_id)) {
                Ok(handle) => self.add_worker(worker_id, handle),
                Err(err) => {
                    error!(runtime = self.runtime.name(), "Cannot spawn a worker: {err}");
                    self.schedule_respawn();
                    return;
                }
            }
        }
    }

    fn add_worker(&mut self, worker_id: WorkerId, handle: Arc<dyn Worker>) {
        handle.attach(
            self.config.forward_stdout.clone(),
            self.config.forward_stderr.clone(),
        );
        let internal = self.internal.clone();
        let exited = handle.clone();
        tokio::spawn(async move {
            let exit = exited.exited().await;
            let _ = internal.send(Internal::Exited { worker_id, exit });
        });
        debug!(%worker_id, "Spawned worker");
        self.workers.insert(
            worker_id,
            PoolWorker {
                handle,
                state: WorkerState::Spawning,
            },
        );
    }

    fn schedule_respawn(&mut self) {
        if self.respawn_scheduled {
            return;
        }
        self.respawn_scheduled = true;
        let internal = self.internal.clone();
        let backoff = self.config.respawn_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = internal.send(Internal::Respawn);
        });
    }

    fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            pending: self.dispatcher.pending_len(),
            ..PoolStatus::default()
        };
        for worker in self.workers.values() {
            match worker.state {
                WorkerState::Spawning => status.spawning += 1,
                WorkerState::Ready(_) => status.ready += 1,
                WorkerState::Busy { .. } | WorkerState::Idle => status.busy += 1,
                WorkerState::Draining => status.draining += 1,
            }
        }
        status
    }

    async fn kill(&mut self) {
        info!(status = %self.status(), "Stopping the worker pool");
        for event in self.dispatcher.drain_all() {
            self.queue
                .settle(&event.id, EventOutcome::Failed(FailureKind::Cancelled));
        }
        let mut handles = Vec::with_capacity(self.workers.len());
        for (_, worker) in self.workers.drain() {
            match worker.state {
                WorkerState::Ready(reply) => {
                    let _ = reply.send(Err(QueueError::Cancelled));
                }
                WorkerState::Busy { event_id, timer } => {
                    timer.abort();
                    self.queue
                        .settle(&event_id, EventOutcome::Failed(FailureKind::Cancelled));
                }
                WorkerState::Spawning | WorkerState::Idle | WorkerState::Draining => {}
            }
            handles.push(worker.handle);
        }
        self.in_flight.clear();
        let exits = futures_util::future::join_all(handles.iter().map(|handle| handle.kill())).await;
        debug!("Killed {} workers", exits.len());
    }
}

#[derive(derive_more::Debug)]
struct SchedulerTaskHandle {
    #[debug(skip)]
    abort_handle: AbortHandle,
    /// Turns `true` once the actor returned. The sender is dropped if the task is aborted.
    #[debug(skip)]
    stopped: watch::Receiver<bool>,
}

impl Drop for SchedulerTaskHandle {
    #[instrument(level = Level::DEBUG, name = "scheduler.drop", skip_all)]
    fn drop(&mut self) {
        if self.abort_handle.is_finished() {
            return;
        }
        warn!("Aborting the scheduler task");
        self.abort_handle.abort();
    }
}

/// Handle to the dispatcher actor and the enqueuers feeding it.
#[derive(Clone, derive_more::Debug)]
pub struct Scheduler {
    #[debug(skip)]
    queue: EventQueue,
    registry: EnqueuerRegistry,
    #[debug(skip)]
    internal: mpsc::UnboundedSender<Internal>,
    task: Arc<SchedulerTaskHandle>,
}

impl Scheduler {
    /// Starts the actor consuming `messages` and fills the worker pool.
    #[must_use]
    pub fn spawn(
        config: SchedulerConfig,
        runtime: Arc<dyn Runtime>,
        queue: EventQueue,
        messages: mpsc::Receiver<QueueMessage>,
        registry: EnqueuerRegistry,
    ) -> Self {
        let (internal, internal_receiver) = mpsc::unbounded_channel();
        let task = SchedulerTask {
            config,
            runtime,
            queue: queue.clone(),
            internal: internal.clone(),
            dispatcher: Dispatcher::default(),
            workers: HashMap::new(),
            in_flight: HashMap::new(),
            respawn_scheduled: false,
        };
        let (stopped_sender, stopped) = watch::channel(false);
        let abort_handle = tokio::spawn(
            async move {
                task.run(messages, internal_receiver).await;
                let _ = stopped_sender.send(true);
            }
            .instrument(info_span!("scheduler")),
        )
        .abort_handle();
        Self {
            queue,
            registry,
            internal,
            task: Arc::new(SchedulerTaskHandle {
                abort_handle,
                stopped,
            }),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Subscribes the change's target with the options it ends up with.
    #[instrument(level = Level::DEBUG, skip_all, fields(handler = %change.handler(), trigger_type = %change.trigger_type()))]
    pub async fn subscribe(&self, change: &TargetChange) -> Result<(), SubscriptionError> {
        self.registry
            .get(change.trigger_type())?
            .subscribe(change.target().clone(), change.options())
            .await
    }

    /// Drops the target's current subscription, which for an update is the previous one.
    #[instrument(level = Level::DEBUG, skip_all, fields(handler = %change.handler()))]
    pub async fn unsubscribe(&self, change: &TargetChange) -> Result<(), SubscriptionError> {
        let trigger_type = match change {
            TargetChange::Updated { previous, .. } => previous.trigger_type(),
            TargetChange::Added { .. } | TargetChange::Removed { .. } => change.trigger_type(),
        };
        self.registry
            .get(trigger_type)?
            .unsubscribe(&change.target().filter())
            .await;
        Ok(())
    }

    pub async fn apply(&self, change: &TargetChange) -> Result<(), SubscriptionError> {
        match change {
            TargetChange::Added { .. } => self.subscribe(change).await,
            TargetChange::Updated { .. } => {
                self.unsubscribe(change).await?;
                self.subscribe(change).await
            }
            TargetChange::Removed { .. } => self.unsubscribe(change).await,
        }
    }

    /// Applies a reconciliation, returning the changes that could not be applied.
    /// A failing change does not stop the remaining ones.
    pub async fn reconcile(
        &self,
        reconciliation: Reconciliation,
    ) -> Vec<(TargetChange, SubscriptionError)> {
        for (function_id, context) in reconciliation.contexts {
            self.update_context(function_id, context);
        }
        for function in &reconciliation.removed {
            self.remove_function(function).await;
        }
        let mut failures = Vec::new();
        for change in reconciliation.changes {
            if let Err(err) = self.apply(&change).await {
                warn!(
                    handler = %change.handler(),
                    cwd = ?change.target().cwd,
                    "Cannot apply trigger change: {err}"
                );
                failures.push((change, err));
            }
        }
        failures
    }

    /// Drops every subscription of the function and forgets its context.
    #[instrument(level = Level::DEBUG, skip_all, fields(function_id = %function.id))]
    pub async fn remove_function(&self, function: &FunctionSpec) {
        let filter = TargetFilter::function(function.cwd.clone());
        for enqueuer in self.registry.iter() {
            enqueuer.unsubscribe(&filter).await;
        }
        self.queue.remove_context(&function.id);
    }

    /// Context used by the next events of the function's targets.
    pub fn update_context(&self, function_id: FunctionId, context: Arc<Context>) {
        self.queue.set_context(function_id, context);
    }

    pub async fn pool_status(&self) -> PoolStatus {
        let (reply, receiver) = oneshot::channel();
        if self.internal.send(Internal::Status(reply)).is_err() {
            return PoolStatus::default();
        }
        receiver.await.unwrap_or_default()
    }

    /// Cancels parked pops and pending events, kills the pool and stops the actor.
    #[instrument(level = Level::DEBUG, name = "scheduler.kill", skip_all)]
    pub async fn kill(&self) {
        trace!("Killing");
        self.queue.kill().await;
        let mut stopped = self.task.stopped.clone();
        // Err means the task was aborted, which stops it as well.
        let _ = stopped.wait_for(|stopped| *stopped).await;
        debug!("Killed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Reconciler;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use concepts::{
        Batching, EventType, Target, TargetKey, Trigger, TriggerOptions, TriggerType,
    };
    use enqueuers::Enqueuer;
    use queue::SubQueue;
    use rstest::rstest;
    use std::sync::Mutex;
    use worker::testing::{FakeRuntime, FakeWorker};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<(EventId, EventOutcome)>>);

    impl Outcomes {
        fn get(&self, event_id: &EventId) -> Option<EventOutcome> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == event_id)
                .map(|(_, outcome)| *outcome)
        }
    }

    impl SubQueue for Outcomes {
        fn event_type(&self) -> EventType {
            EventType::Database
        }

        fn settle(&self, event_id: &EventId, outcome: EventOutcome) {
            self.0.lock().unwrap().push((*event_id, outcome));
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        runtime: Arc<FakeRuntime>,
        outcomes: Arc<Outcomes>,
    }

    impl Fixture {
        fn new(pool_size: usize) -> Self {
            Self::with_registry(pool_size, EnqueuerRegistry::new())
        }

        fn with_registry(pool_size: usize, registry: EnqueuerRegistry) -> Self {
            Self::with_config(config(pool_size), registry)
        }

        fn with_config(config: SchedulerConfig, registry: EnqueuerRegistry) -> Self {
            test_utils::set_up();
            let (queue, messages) = EventQueue::new(64);
            let outcomes = Arc::new(Outcomes::default());
            queue.add_queue(outcomes.clone());
            let runtime = Arc::new(FakeRuntime::default());
            let scheduler = Scheduler::spawn(config, runtime.clone(), queue, messages, registry);
            Self {
                scheduler,
                runtime,
                outcomes,
            }
        }

        fn queue(&self) -> &EventQueue {
            self.scheduler.queue()
        }

        async fn wait_for(&self, predicate: impl Fn(PoolStatus) -> bool) -> PoolStatus {
            tokio::time::timeout(WAIT, async {
                loop {
                    let status = self.scheduler.pool_status().await;
                    if predicate(status) {
                        return status;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("pool did not reach the expected status")
        }

        /// Waits until the pool is filled and returns its workers.
        async fn workers(&self, count: usize) -> Vec<Arc<FakeWorker>> {
            self.wait_for(|status| status.spawning == count).await;
            self.runtime.alive()
        }

        /// Starts a pop and waits until the worker is parked.
        async fn park(&self, worker_id: WorkerId) -> tokio::task::JoinHandle<Result<Event, QueueError>> {
            let ready_before = self.scheduler.pool_status().await.ready;
            let queue = self.queue().clone();
            let pop = tokio::spawn(async move { queue.pop(worker_id).await });
            self.wait_for(|status| status.ready > ready_before).await;
            pop
        }

        async fn enqueue(&self, target: &Arc<Target>) -> Event {
            let event = self.queue().new_event(EventType::Database, target);
            self.queue().enqueue(event.clone()).await.unwrap();
            event
        }

        async fn wait_for_outcome(&self, event_id: &EventId) -> EventOutcome {
            tokio::time::timeout(WAIT, async {
                loop {
                    if let Some(outcome) = self.outcomes.get(event_id) {
                        return outcome;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("event was not settled")
        }
    }

    fn config(pool_size: usize) -> SchedulerConfig {
        SchedulerConfig {
            pool_size,
            respawn_backoff: Duration::from_millis(50),
            forward_stdout: Some(StdOutput::buffer().0),
            forward_stderr: Some(StdOutput::buffer().0),
            ..SchedulerConfig::default()
        }
    }

    async fn resolved(pop: tokio::task::JoinHandle<Result<Event, QueueError>>) -> Result<Event, QueueError> {
        tokio::time::timeout(WAIT, pop).await.unwrap().unwrap()
    }

    fn target(handler: &str, context: Context) -> Arc<Target> {
        Arc::new(
            Target::new(FunctionId::new("fn1"), handler, "/functions/fn1")
                .with_context(Arc::new(context)),
        )
    }

    fn plain_target() -> Arc<Target> {
        target("hello", Context::default())
    }

    #[tokio::test]
    async fn pop_blocks_until_event_is_enqueued() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let pop = fixture.park(workers[0].id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pop.is_finished());

        let event = fixture.enqueue(&plain_target()).await;
        assert_eq!(event, resolved(pop).await.unwrap());
        assert!(workers[0].is_attached());
    }

    #[tokio::test]
    async fn pending_event_is_taken_by_next_pop() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let event = fixture.enqueue(&plain_target()).await;
        fixture.wait_for(|status| status.pending == 1).await;
        assert_eq!(event, fixture.queue().pop(workers[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn kill_cancels_parked_pops_and_pending_events() {
        let fixture = Fixture::new(2);
        let workers = fixture.workers(2).await;
        let first = fixture.park(workers[0].id).await;
        let second = fixture.park(workers[1].id).await;

        fixture.scheduler.kill().await;
        assert_matches!(resolved(first).await, Err(QueueError::Cancelled));
        assert_matches!(resolved(second).await, Err(QueueError::Cancelled));
        assert!(workers.iter().all(|worker| worker.is_killed()));
        assert!(fixture.queue().is_closed());
        assert_matches!(
            fixture.queue().pop(workers[0].id).await,
            Err(QueueError::Cancelled)
        );
    }

    #[tokio::test]
    async fn kill_returns_once_the_actor_stopped() {
        let fixture = Fixture::new(1);
        fixture.workers(1).await;
        let other = fixture.scheduler.clone();
        tokio::time::timeout(WAIT, async {
            tokio::join!(fixture.scheduler.kill(), other.kill());
        })
        .await
        .unwrap();
        assert!(*fixture.scheduler.task.stopped.borrow());
        assert_eq!(PoolStatus::default(), fixture.scheduler.pool_status().await);
        // Killing a stopped scheduler returns right away.
        tokio::time::timeout(WAIT, fixture.scheduler.kill()).await.unwrap();
    }

    #[tokio::test]
    async fn kill_settles_pending_events_as_cancelled() {
        let fixture = Fixture::new(1);
        fixture.workers(1).await;
        let event = fixture.enqueue(&plain_target()).await;
        fixture.wait_for(|status| status.pending == 1).await;
        fixture.scheduler.kill().await;
        assert_eq!(
            EventOutcome::Failed(FailureKind::Cancelled),
            fixture.wait_for_outcome(&event.id).await
        );
    }

    #[tokio::test]
    async fn every_event_is_delivered_exactly_once() {
        let fixture = Fixture::new(3);
        let workers = fixture.workers(3).await;
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut loops = Vec::new();
        for worker in &workers {
            let queue = fixture.queue().clone();
            let delivered = delivered.clone();
            let worker_id = worker.id;
            loops.push(tokio::spawn(async move {
                while let Ok(event) = queue.pop(worker_id).await {
                    delivered.lock().unwrap().push(event.id);
                    if queue.complete(event.id, true).await.is_err() {
                        break;
                    }
                }
            }));
        }
        let mut enqueued = Vec::new();
        for _ in 0..30 {
            enqueued.push(fixture.enqueue(&plain_target()).await.id);
        }
        tokio::time::timeout(WAIT, async {
            while delivered.lock().unwrap().len() < enqueued.len() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        fixture.scheduler.kill().await;
        for worker_loop in loops {
            worker_loop.await.unwrap();
        }

        let mut delivered = delivered.lock().unwrap().clone();
        delivered.sort();
        enqueued.sort();
        assert_eq!(enqueued, delivered);
        assert_eq!(3, fixture.runtime.spawn_count());
    }

    #[tokio::test]
    async fn completed_worker_is_reused_without_spawn() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let worker_id = workers[0].id;
        let queue = fixture.queue();

        let first = fixture.enqueue(&plain_target()).await;
        assert_eq!(first, queue.pop(worker_id).await.unwrap());
        queue.complete(first.id, true).await.unwrap();
        assert_eq!(EventOutcome::Succeeded, fixture.wait_for_outcome(&first.id).await);

        let second = fixture.enqueue(&plain_target()).await;
        assert_eq!(second, queue.pop(worker_id).await.unwrap());
        assert_eq!(1, fixture.runtime.spawn_count());
        // No redelivery once settled.
        assert_matches!(
            queue.complete(first.id, true).await,
            Err(QueueError::NoItem(id)) if id == first.id
        );
    }

    #[tokio::test]
    async fn failed_completion_is_settled_as_handler_failure() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let event = fixture.enqueue(&plain_target()).await;
        assert_eq!(event, fixture.queue().pop(workers[0].id).await.unwrap());
        fixture.queue().complete(event.id, false).await.unwrap();
        assert_eq!(
            EventOutcome::Failed(FailureKind::Handler),
            fixture.wait_for_outcome(&event.id).await
        );
    }

    #[tokio::test]
    async fn timed_out_worker_is_killed_and_replaced() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let stuck = target(
            "stuck",
            Context {
                timeout: Duration::from_millis(200),
                ..Context::default()
            },
        );
        let event = fixture.enqueue(&stuck).await;
        assert_eq!(event, fixture.queue().pop(workers[0].id).await.unwrap());

        assert_eq!(
            EventOutcome::Failed(FailureKind::Timeout),
            fixture.wait_for_outcome(&event.id).await
        );
        fixture
            .wait_for(|status| status.size() == 1 && status.spawning == 1)
            .await;
        assert!(workers[0].is_killed());
        assert_matches!(workers[0].diagnostics().as_slice(), [message] if message.contains("timed out"));
        assert_eq!(2, fixture.runtime.spawn_count());
        assert_matches!(
            fixture.queue().complete(event.id, true).await,
            Err(QueueError::NoItem(_))
        );
        assert_matches!(
            fixture.queue().pop(workers[0].id).await,
            Err(QueueError::UnknownWorker(id)) if id == workers[0].id
        );

        // The replacement takes the next event.
        let replacement = fixture.runtime.alive().pop().unwrap();
        let next = fixture.enqueue(&plain_target()).await;
        assert_eq!(next, fixture.queue().pop(replacement.id).await.unwrap());
    }

    #[rstest]
    #[case::pool_limit_is_shorter(Duration::from_millis(200), Context::default())]
    #[case::target_limit_is_shorter(
        Duration::from_secs(300),
        Context { timeout: Duration::from_millis(200), ..Context::default() }
    )]
    #[tokio::test]
    async fn event_times_out_after_the_shorter_limit(
        #[case] pool_timeout: Duration,
        #[case] context: Context,
    ) {
        let fixture = Fixture::with_config(
            SchedulerConfig {
                timeout: pool_timeout,
                ..config(1)
            },
            EnqueuerRegistry::new(),
        );
        let workers = fixture.workers(1).await;
        let event = fixture.enqueue(&target("slow", context)).await;
        assert_eq!(event, fixture.queue().pop(workers[0].id).await.unwrap());

        assert_eq!(
            EventOutcome::Failed(FailureKind::Timeout),
            fixture.wait_for_outcome(&event.id).await
        );
        fixture.wait_for(|status| status.spawning == 1).await;
        assert!(workers[0].is_killed());
        assert_matches!(
            workers[0].diagnostics().as_slice(),
            [message] if message.ends_with("timed out after 200ms")
        );
    }

    #[tokio::test]
    async fn pop_without_completion_fails_the_previous_event() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let event = fixture.enqueue(&plain_target()).await;
        assert_eq!(event, fixture.queue().pop(workers[0].id).await.unwrap());

        let next_pop = fixture.park(workers[0].id).await;
        assert_eq!(
            EventOutcome::Failed(FailureKind::Handler),
            fixture.wait_for_outcome(&event.id).await
        );
        assert_matches!(
            fixture.queue().complete(event.id, true).await,
            Err(QueueError::NoItem(id)) if id == event.id
        );
        assert!(!workers[0].is_killed());

        let next = fixture.enqueue(&plain_target()).await;
        assert_eq!(next, resolved(next_pop).await.unwrap());
    }

    #[tokio::test]
    async fn completion_before_timeout_cancels_the_timer() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let quick = target(
            "quick",
            Context {
                timeout: Duration::from_millis(100),
                ..Context::default()
            },
        );
        let event = fixture.enqueue(&quick).await;
        assert_eq!(event, fixture.queue().pop(workers[0].id).await.unwrap());
        fixture.queue().complete(event.id, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!workers[0].is_killed());
        assert_eq!(1, fixture.runtime.spawn_count());
    }

    #[tokio::test]
    async fn crashed_worker_fails_its_event_and_is_replaced() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        let event = fixture.enqueue(&plain_target()).await;
        assert_eq!(event, fixture.queue().pop(workers[0].id).await.unwrap());

        workers[0].crash(1);
        assert_eq!(
            EventOutcome::Failed(FailureKind::WorkerCrash),
            fixture.wait_for_outcome(&event.id).await
        );
        fixture.wait_for(|status| status.spawning == 1).await;
        assert_eq!(2, fixture.runtime.spawn_count());
    }

    #[tokio::test]
    async fn failed_spawn_is_retried() {
        let fixture = Fixture::new(1);
        let workers = fixture.workers(1).await;
        fixture.runtime.fail_spawn(true);
        workers[0].crash(126);
        fixture.wait_for(|status| status.size() == 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(1, fixture.runtime.spawn_count());

        fixture.runtime.fail_spawn(false);
        fixture.wait_for(|status| status.spawning == 1).await;
        assert_eq!(2, fixture.runtime.spawn_count());
    }

    #[tokio::test]
    async fn batch_chain_is_contained_by_limit() {
        let fixture = Fixture::new(2);
        let workers = fixture.workers(2).await;
        let (w1, w2) = (workers[0].id, workers[1].id);
        let batched = target(
            "onChange",
            Context {
                batch: Some(Batching {
                    limit: 3,
                    deadline: Duration::from_secs(10),
                }),
                ..Context::default()
            },
        );
        let first_pop = fixture.park(w1).await;
        let second_pop = fixture.park(w2).await;
        let mut events = Vec::new();
        for _ in 0..4 {
            events.push(fixture.enqueue(&batched).await);
        }
        assert_eq!(events[0], resolved(first_pop).await.unwrap());
        assert_eq!(events[3], resolved(second_pop).await.unwrap());

        let queue = fixture.queue();
        queue.complete(events[0].id, true).await.unwrap();
        assert_eq!(events[1], queue.pop(w1).await.unwrap());
        queue.complete(events[1].id, true).await.unwrap();
        assert_eq!(events[2], queue.pop(w1).await.unwrap());
        queue.complete(events[2].id, true).await.unwrap();

        // Limit reached: the worker goes back to the general pool and takes other targets.
        let parked = fixture.park(w1).await;
        let other = fixture.enqueue(&plain_target()).await;
        assert_eq!(other, resolved(parked).await.unwrap());
    }

    #[tokio::test]
    async fn expired_chain_hands_backlog_to_another_worker() {
        let fixture = Fixture::new(2);
        let workers = fixture.workers(2).await;
        let batched = target(
            "onChange",
            Context {
                batch: Some(Batching {
                    limit: 10,
                    deadline: Duration::from_millis(300),
                }),
                ..Context::default()
            },
        );
        let first_pop = fixture.park(workers[0].id).await;
        let second_pop = fixture.park(workers[1].id).await;
        let first = fixture.enqueue(&batched).await;
        let second = fixture.enqueue(&batched).await;
        assert_eq!(first, resolved(first_pop).await.unwrap());

        // Held back for the busy chain worker while the chain is open.
        fixture.wait_for(|status| status.pending == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second_pop.is_finished());

        assert_eq!(second, resolved(second_pop).await.unwrap());
        assert_eq!(0, fixture.scheduler.pool_status().await.pending);
    }

    #[tokio::test]
    async fn unknown_worker_and_event_are_rejected() {
        let fixture = Fixture::new(1);
        fixture.workers(1).await;
        let stranger = WorkerId::generate();
        assert_matches!(
            fixture.queue().pop(stranger).await,
            Err(QueueError::UnknownWorker(id)) if id == stranger
        );
        let event_id = EventId::generate();
        assert_matches!(
            fixture.queue().complete(event_id, true).await,
            Err(QueueError::NoItem(id)) if id == event_id
        );
    }

    #[tokio::test]
    async fn context_update_reaches_next_event() {
        let fixture = Fixture::new(1);
        let target = plain_target();
        let context = Arc::new(Context {
            timeout: Duration::from_secs(7),
            ..Context::default()
        });
        fixture
            .scheduler
            .update_context(target.id.clone(), context.clone());
        let event = fixture.enqueue(&target).await;
        assert_eq!(context, event.target.context);
    }

    #[derive(Default)]
    struct RecordingEnqueuer {
        calls: Mutex<Vec<String>>,
        // Paths owned by a function outside of the reconciler.
        taken: Mutex<Vec<String>>,
    }

    impl RecordingEnqueuer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Enqueuer for RecordingEnqueuer {
        fn trigger_type(&self) -> TriggerType {
            TriggerType::Http
        }

        async fn subscribe(
            &self,
            target: Arc<Target>,
            options: &TriggerOptions,
        ) -> Result<(), SubscriptionError> {
            let TriggerOptions::Http { path, .. } = options else {
                unreachable!()
            };
            if !path.starts_with('/') {
                return Err(SubscriptionError::InvalidPath(path.clone()));
            }
            if self.taken.lock().unwrap().contains(path) {
                return Err(SubscriptionError::DuplicateRoute {
                    method: "GET".to_string(),
                    route: path.clone(),
                    existing: TargetKey {
                        cwd: "/functions/other".into(),
                        handler: "h1".to_string(),
                    },
                });
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("subscribe {} {path}", target.handler));
            Ok(())
        }

        async fn unsubscribe(&self, filter: &TargetFilter) {
            self.calls.lock().unwrap().push(format!(
                "unsubscribe {}",
                filter.handler.as_deref().unwrap_or("*")
            ));
        }
    }

    fn http(path: &str) -> TriggerOptions {
        TriggerOptions::Http {
            method: "GET".to_string(),
            path: path.to_string(),
            preflight: false,
        }
    }

    #[tokio::test]
    async fn reconciliation_unsubscribes_before_subscribing() {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let mut registry = EnqueuerRegistry::new();
        registry.register(enqueuer.clone());
        let fixture = Fixture::with_registry(1, registry);
        let mut reconciler = Reconciler::default();
        let function = |path: &str| {
            FunctionSpec::new(FunctionId::new("fn1"), "/functions/fn1")
                .with_trigger("h1", Trigger::active(http(path)))
        };

        let failures = fixture
            .scheduler
            .reconcile(reconciler.sync(vec![function("/a")]))
            .await;
        assert!(failures.is_empty());
        let failures = fixture
            .scheduler
            .reconcile(reconciler.sync(vec![function("/b")]))
            .await;
        assert!(failures.is_empty());
        assert_eq!(
            vec!["subscribe h1 /a", "unsubscribe h1", "subscribe h1 /b"],
            enqueuer.calls()
        );

        // An invalid trigger is reported and the rest is still applied.
        let broken = function("no-slash").with_trigger("h2", Trigger::active(http("/c")));
        let failures = fixture.scheduler.reconcile(reconciler.sync(vec![broken])).await;
        assert_matches!(
            failures.as_slice(),
            [(TargetChange::Updated { .. }, SubscriptionError::InvalidPath(path))] if path == "no-slash"
        );
        assert_eq!(Some("subscribe h2 /c"), enqueuer.calls().last().map(String::as_str));

        let removal = fixture.scheduler.reconcile(reconciler.sync(vec![])).await;
        assert!(removal.is_empty());
        assert_eq!(Some("unsubscribe *"), enqueuer.calls().last().map(String::as_str));
    }

    #[tokio::test]
    async fn failed_subscription_is_retried_by_next_sync() {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        enqueuer.taken.lock().unwrap().push("/a".to_string());
        let mut registry = EnqueuerRegistry::new();
        registry.register(enqueuer.clone());
        let fixture = Fixture::with_registry(1, registry);
        let mut reconciler = Reconciler::default();
        let function = FunctionSpec::new(FunctionId::new("fn1"), "/functions/fn1")
            .with_trigger("h1", Trigger::active(http("/a")));

        let failures = fixture
            .scheduler
            .reconcile(reconciler.sync(vec![function.clone()]))
            .await;
        assert_matches!(
            failures.as_slice(),
            [(TargetChange::Added { .. }, SubscriptionError::DuplicateRoute { route, .. })] if route == "/a"
        );
        for (change, _) in &failures {
            reconciler.forget(change);
        }
        assert!(enqueuer.calls().is_empty());

        enqueuer.taken.lock().unwrap().clear();
        let failures = fixture
            .scheduler
            .reconcile(reconciler.sync(vec![function.clone()]))
            .await;
        assert!(failures.is_empty());
        assert_eq!(vec!["subscribe h1 /a"], enqueuer.calls());

        // Once applied, the same declarations are a no-op.
        assert!(reconciler.sync(vec![function]).is_empty());
    }

    #[tokio::test]
    async fn change_without_enqueuer_is_rejected() {
        let fixture = Fixture::new(1);
        let change = TargetChange::Added {
            target: plain_target(),
            trigger: TriggerOptions::System {
                name: "READY".to_string(),
            },
        };
        assert_matches!(
            fixture.scheduler.apply(&change).await,
            Err(SubscriptionError::NoEnqueuer(TriggerType::System))
        );
    }
}
