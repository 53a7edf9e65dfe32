pub mod database;
pub mod firehose;
pub mod http;

use concepts::{Context, Event, EventId, EventOutcome, EventType, FunctionId, Target, WorkerId};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, instrument, trace};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("no item with id {0}")]
    NoItem(EventId),
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
    #[error("response head was already sent for {0}")]
    HeadAlreadySent(EventId),
    #[error("queue was killed")]
    Cancelled,
}

/// Messages consumed by the dispatcher owning the ready and pending tables.
#[derive(derive_more::Debug)]
pub enum QueueMessage {
    Enqueued(Event),
    /// The worker is ready for its next event. The reply resolves once an event is assigned.
    GotWorker {
        worker_id: WorkerId,
        #[debug(skip)]
        reply: oneshot::Sender<Result<Event, QueueError>>,
    },
    Complete {
        event_id: EventId,
        succeeded: bool,
        #[debug(skip)]
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Kill {
        #[debug(skip)]
        reply: oneshot::Sender<()>,
    },
}

/// Typed payload storage keyed by event id.
pub trait SubQueue: Send + Sync {
    fn event_type(&self) -> EventType;

    /// Called once the event reached a terminal outcome. Drops any payload left for it.
    fn settle(&self, event_id: &EventId, outcome: EventOutcome);
}

#[derive(Default)]
struct Shared {
    sub_queues: RwLock<Vec<Arc<dyn SubQueue>>>,
    contexts: RwLock<hashbrown::HashMap<FunctionId, Arc<Context>>>,
}

/// Front of the dispatcher: producers enqueue envelopes, workers long-poll with [`EventQueue::pop`].
#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<QueueMessage>,
    shared: Arc<Shared>,
}

impl EventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueueMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                shared: Arc::default(),
            },
            receiver,
        )
    }

    pub fn add_queue(&self, sub_queue: Arc<dyn SubQueue>) {
        debug!(event_type = %sub_queue.event_type(), "Registering sub-queue");
        self.shared.sub_queues.write().unwrap().push(sub_queue);
    }

    /// Creates an event for the target, stamped with the latest known context of its function.
    #[must_use]
    pub fn new_event(&self, event_type: EventType, target: &Arc<Target>) -> Event {
        let latest = self.shared.contexts.read().unwrap().get(&target.id).cloned();
        let target = match latest {
            Some(context) if context != target.context => Arc::new(target.with_context(context)),
            _ => target.clone(),
        };
        Event::new(event_type, target)
    }

    pub fn set_context(&self, function_id: FunctionId, context: Arc<Context>) {
        trace!(%function_id, ?context, "Updating context");
        self.shared
            .contexts
            .write()
            .unwrap()
            .insert(function_id, context);
    }

    pub fn remove_context(&self, function_id: &FunctionId) {
        self.shared.contexts.write().unwrap().remove(function_id);
    }

    #[instrument(level = Level::TRACE, skip_all, fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn enqueue(&self, event: Event) -> Result<(), QueueError> {
        self.sender
            .send(QueueMessage::Enqueued(event))
            .await
            .map_err(|_| QueueError::Cancelled)
    }

    /// Parks until an event is assigned to the worker or the queue is killed.
    #[instrument(level = Level::TRACE, skip(self))]
    pub async fn pop(&self, worker_id: WorkerId) -> Result<Event, QueueError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(QueueMessage::GotWorker { worker_id, reply })
            .await
            .map_err(|_| QueueError::Cancelled)?;
        receiver.await.map_err(|_| QueueError::Cancelled)?
    }

    #[instrument(level = Level::TRACE, skip(self))]
    pub async fn complete(&self, event_id: EventId, succeeded: bool) -> Result<(), QueueError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(QueueMessage::Complete {
                event_id,
                succeeded,
                reply,
            })
            .await
            .map_err(|_| QueueError::Cancelled)?;
        receiver.await.map_err(|_| QueueError::Cancelled)?
    }

    /// Resolves all parked pops with [`QueueError::Cancelled`] and waits for the dispatcher to stop.
    pub async fn kill(&self) {
        let (reply, receiver) = oneshot::channel();
        if self.sender.send(QueueMessage::Kill { reply }).await.is_ok() {
            let _ = receiver.await;
        }
    }

    pub fn settle(&self, event_id: &EventId, outcome: EventOutcome) {
        let sub_queues = self.shared.sub_queues.read().unwrap().clone();
        for sub_queue in sub_queues {
            sub_queue.settle(event_id, outcome);
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Change, DatabaseQueue};
    use assert_matches::assert_matches;
    use concepts::{DatabaseOperation, FailureKind};
    use std::time::Duration;

    fn target() -> Arc<Target> {
        Arc::new(Target::new(FunctionId::new("fn1"), "handler", "/fn1"))
    }

    #[tokio::test]
    async fn pop_after_dispatcher_is_gone_is_cancelled() {
        test_utils::set_up();
        let (queue, receiver) = EventQueue::new(1);
        drop(receiver);
        assert_matches!(
            queue.pop(WorkerId::generate()).await,
            Err(QueueError::Cancelled)
        );
        assert_matches!(
            queue.enqueue(queue.new_event(EventType::System, &target())).await,
            Err(QueueError::Cancelled)
        );
    }

    #[tokio::test]
    async fn dropped_reply_is_cancellation() {
        test_utils::set_up();
        let (queue, mut receiver) = EventQueue::new(1);
        let dispatcher = tokio::spawn(async move {
            // Drops the reply sender without answering.
            let message = receiver.recv().await.unwrap();
            assert_matches!(message, QueueMessage::GotWorker { .. });
        });
        assert_matches!(
            queue.pop(WorkerId::generate()).await,
            Err(QueueError::Cancelled)
        );
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn pop_resolves_with_assigned_event() {
        test_utils::set_up();
        let (queue, mut receiver) = EventQueue::new(1);
        let event = queue.new_event(EventType::Schedule, &target());
        let expected = event.clone();
        tokio::spawn(async move {
            let QueueMessage::GotWorker { reply, .. } = receiver.recv().await.unwrap() else {
                unreachable!()
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            reply.send(Ok(event)).unwrap();
        });
        assert_eq!(expected, queue.pop(WorkerId::generate()).await.unwrap());
    }

    #[test]
    fn new_event_carries_latest_context() {
        let (queue, _receiver) = EventQueue::new(1);
        let target = target();
        let unchanged = queue.new_event(EventType::Http, &target);
        assert!(Arc::ptr_eq(&target, &unchanged.target));

        let context = Arc::new(Context {
            timeout: Duration::from_secs(3),
            ..Context::default()
        });
        queue.set_context(target.id.clone(), context.clone());
        let event = queue.new_event(EventType::Http, &target);
        assert_eq!(context, event.target.context);
        assert_eq!(target.handler, event.target.handler);
        // The original snapshot is untouched.
        assert_eq!(Arc::<Context>::default(), target.context);
    }

    #[test]
    fn settle_reaches_sub_queues() {
        let (queue, _receiver) = EventQueue::new(1);
        let database = Arc::new(DatabaseQueue::default());
        queue.add_queue(database.clone());
        let event_id = EventId::generate();
        database.enqueue(
            event_id,
            Change {
                kind: DatabaseOperation::Insert,
                collection: "users".to_string(),
                document: None,
                document_key: serde_json::json!({"_id": 1}),
                update_description: None,
            },
        );
        queue.settle(&event_id, EventOutcome::Failed(FailureKind::Timeout));
        assert_matches!(database.pop(&event_id), Err(QueueError::NoItem(id)) if id == event_id);
    }
}
