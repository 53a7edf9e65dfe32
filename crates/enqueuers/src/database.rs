use crate::{Enqueuer, SubscriptionError, mismatch};
use async_trait::async_trait;
use concepts::{
    DatabaseOperation, EventType, Target, TargetFilter, TargetKey, TriggerOptions, TriggerType,
};
use indexmap::IndexMap;
use queue::EventQueue;
use queue::database::{Change, DatabaseQueue};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument as _, Level, debug, info, info_span, instrument, warn};

const CHANGE_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeStreamError {
    #[error("cannot watch collection `{collection}`: {reason}")]
    Watch { collection: String, reason: String },
}

/// Database collaborator providing change-stream cursors.
#[async_trait]
pub trait ChangeStreamSource: Send + Sync + 'static {
    /// Opens a cursor yielding changes of `collection` whose kind is one of `operations`.
    /// The cursor is closed when the receiver is dropped.
    async fn watch(
        &self,
        collection: &str,
        operations: &[DatabaseOperation],
    ) -> Result<mpsc::Receiver<Change>, ChangeStreamError>;
}

/// Change-stream source fed by [`InMemoryChangeStream::publish`].
#[derive(Debug, Clone)]
pub struct InMemoryChangeStream {
    sender: broadcast::Sender<Change>,
}

impl InMemoryChangeStream {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns the number of open cursors that received the change.
    pub fn publish(&self, change: Change) -> usize {
        self.sender.send(change).unwrap_or_default()
    }
}

impl Default for InMemoryChangeStream {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeStreamSource for InMemoryChangeStream {
    async fn watch(
        &self,
        collection: &str,
        operations: &[DatabaseOperation],
    ) -> Result<mpsc::Receiver<Change>, ChangeStreamError> {
        let mut changes = self.sender.subscribe();
        let (sender, receiver) = mpsc::channel(CHANGE_BUFFER);
        let collection = collection.to_string();
        let operations = operations.to_vec();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    change = changes.recv() => change,
                    () = sender.closed() => return,
                };
                match change {
                    Ok(change) => {
                        if change.collection == collection
                            && operations.contains(&change.kind)
                            && sender.send(change).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%collection, "Change cursor lagged, skipped {skipped} changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(receiver)
    }
}

/// One real cursor is opened per distinct collection and operation set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    collection: String,
    operations: Vec<DatabaseOperation>,
}

impl StreamKey {
    pub(crate) fn new(
        collection: &str,
        operations: &[DatabaseOperation],
    ) -> Result<Self, SubscriptionError> {
        if collection.is_empty() {
            return Err(SubscriptionError::EmptyCollection);
        }
        let mut operations = operations.to_vec();
        operations.sort_unstable();
        operations.dedup();
        if operations.is_empty() {
            return Err(SubscriptionError::EmptyOperations(collection.to_string()));
        }
        Ok(Self {
            collection: collection.to_string(),
            operations,
        })
    }
}

type Subscribers = Arc<Mutex<IndexMap<TargetKey, Arc<Target>>>>;

struct ChangeStream {
    subscribers: Subscribers,
    task: JoinHandle<()>,
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct DatabaseEnqueuer {
    queue: EventQueue,
    database_queue: Arc<DatabaseQueue>,
    source: Arc<dyn ChangeStreamSource>,
    streams: tokio::sync::Mutex<hashbrown::HashMap<StreamKey, ChangeStream>>,
}

impl DatabaseEnqueuer {
    #[must_use]
    pub fn new(
        queue: EventQueue,
        database_queue: Arc<DatabaseQueue>,
        source: Arc<dyn ChangeStreamSource>,
    ) -> Self {
        Self {
            queue,
            database_queue,
            source,
            streams: tokio::sync::Mutex::default(),
        }
    }

    /// Number of open change-stream cursors.
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }
}

fn remove_subscriber(
    streams: &mut hashbrown::HashMap<StreamKey, ChangeStream>,
    matches: impl Fn(&TargetKey) -> bool,
) {
    streams.retain(|key, stream| {
        let mut subscribers = stream.subscribers.lock().unwrap();
        subscribers.retain(|target, _| !matches(target));
        if subscribers.is_empty() {
            info!(collection = %key.collection, "Closing change stream");
            false
        } else {
            true
        }
    });
}

async fn forward(
    mut changes: mpsc::Receiver<Change>,
    subscribers: Subscribers,
    queue: EventQueue,
    database_queue: Arc<DatabaseQueue>,
) {
    while let Some(change) = changes.recv().await {
        let targets: Vec<_> = subscribers.lock().unwrap().values().cloned().collect();
        for target in targets {
            let event = queue.new_event(EventType::Database, &target);
            let event_id = event.id;
            debug!(%event_id, handler = %target.handler, kind = %change.kind, "Enqueuing change");
            database_queue.enqueue(event_id, change.clone());
            if let Err(err) = queue.enqueue(event).await {
                let _ = database_queue.pop(&event_id);
                warn!("Stopping change stream: {err}");
                return;
            }
        }
    }
    debug!("Change stream ended");
}

#[async_trait]
impl Enqueuer for DatabaseEnqueuer {
    fn trigger_type(&self) -> TriggerType {
        TriggerType::Database
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(handler = %target.handler))]
    async fn subscribe(
        &self,
        target: Arc<Target>,
        options: &TriggerOptions,
    ) -> Result<(), SubscriptionError> {
        let TriggerOptions::Database { collection, types } = options else {
            return Err(mismatch(TriggerType::Database, options));
        };
        let stream_key = StreamKey::new(collection, types)?;
        let target_key = target.key();

        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get(&stream_key) {
            let mut subscribers = stream.subscribers.lock().unwrap();
            if subscribers.contains_key(&target_key) {
                subscribers.insert(target_key, target);
                return Ok(());
            }
        }
        // A target is subscribed to at most one stream.
        remove_subscriber(&mut streams, |key| *key == target_key);

        if let Some(stream) = streams.get(&stream_key) {
            stream.subscribers.lock().unwrap().insert(target_key, target);
            return Ok(());
        }
        let changes = self
            .source
            .watch(&stream_key.collection, &stream_key.operations)
            .await?;
        info!(
            collection = %stream_key.collection,
            operations = ?stream_key.operations,
            "Opened change stream"
        );
        let subscribers = Arc::new(Mutex::new(IndexMap::from([(target_key, target)])));
        let task = tokio::spawn(
            forward(
                changes,
                subscribers.clone(),
                self.queue.clone(),
                self.database_queue.clone(),
            )
            .instrument(info_span!("change_stream", collection = %stream_key.collection)),
        );
        streams.insert(stream_key, ChangeStream { subscribers, task });
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(cwd = ?filter.cwd, handler = ?filter.handler))]
    async fn unsubscribe(&self, filter: &TargetFilter) {
        let mut streams = self.streams.lock().await;
        remove_subscriber(&mut streams, |key| filter.matches_key(key));
    }
}
