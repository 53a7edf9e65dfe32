pub mod database;
pub mod firehose;
pub mod http;
pub mod schedule;
pub mod system;

use async_trait::async_trait;
use concepts::{Target, TargetFilter, TargetKey, TriggerOptions, TriggerType};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("`{actual}` trigger cannot be handled by the `{expected}` enqueuer")]
    TriggerTypeMismatch {
        expected: TriggerType,
        actual: TriggerType,
    },
    #[error("unsupported HTTP method `{0}`")]
    UnsupportedMethod(String),
    #[error("invalid path `{0}`, must start with `/`")]
    InvalidPath(String),
    #[error("route `{method} {route}` is already registered by `{existing}`")]
    DuplicateRoute {
        method: String,
        route: String,
        existing: TargetKey,
    },
    #[error("collection name must not be empty")]
    EmptyCollection,
    #[error("operation set of collection `{0}` must not be empty")]
    EmptyOperations(String),
    #[error("invalid cron expression `{frequency}`: {reason}")]
    InvalidCron { frequency: String, reason: String },
    #[error("unknown timezone `{0}`")]
    InvalidTimezone(String),
    #[error("firehose event pattern must not be empty")]
    EmptyEventPattern,
    #[error("unsupported system event `{0}`")]
    UnsupportedSystemEvent(String),
    #[error(transparent)]
    ChangeStream(#[from] database::ChangeStreamError),
    #[error("no enqueuer registered for trigger type `{0}`")]
    NoEnqueuer(TriggerType),
}

/// Trigger-source adapter forwarding external occurrences into the event queue.
#[async_trait]
pub trait Enqueuer: Send + Sync + 'static {
    fn trigger_type(&self) -> TriggerType;

    /// Starts forwarding occurrences matching `options` to `target`.
    /// Invalid options are rejected before anything is registered.
    /// Subscribing an already subscribed target replaces its previous subscription.
    async fn subscribe(
        &self,
        target: Arc<Target>,
        options: &TriggerOptions,
    ) -> Result<(), SubscriptionError>;

    /// Stops forwarding to every target matched by the filter.
    async fn unsubscribe(&self, filter: &TargetFilter);
}

/// Checks trigger options without registering anything.
pub fn validate(options: &TriggerOptions) -> Result<(), SubscriptionError> {
    match options {
        TriggerOptions::Http { method, path, .. } => {
            http::parse_method(method)?;
            http::check_path(path)
        }
        TriggerOptions::Database { collection, types } => {
            database::StreamKey::new(collection, types).map(|_| ())
        }
        TriggerOptions::Schedule {
            frequency,
            timezone,
        } => schedule::parse_schedule(frequency, timezone).map(|_| ()),
        TriggerOptions::Firehose { event } => firehose::EventPattern::parse(event).map(|_| ()),
        TriggerOptions::System { name } => system::check_event_name(name),
    }
}

fn mismatch(expected: TriggerType, options: &TriggerOptions) -> SubscriptionError {
    SubscriptionError::TriggerTypeMismatch {
        expected,
        actual: options.trigger_type(),
    }
}

/// Enqueuers addressable by the trigger type they handle.
#[derive(Clone, Default)]
pub struct EnqueuerRegistry {
    enqueuers: hashbrown::HashMap<TriggerType, Arc<dyn Enqueuer>>,
}

impl EnqueuerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any enqueuer registered for the same trigger type.
    pub fn register(&mut self, enqueuer: Arc<dyn Enqueuer>) {
        self.enqueuers.insert(enqueuer.trigger_type(), enqueuer);
    }

    pub fn get(&self, trigger_type: TriggerType) -> Result<&Arc<dyn Enqueuer>, SubscriptionError> {
        self.enqueuers
            .get(&trigger_type)
            .ok_or(SubscriptionError::NoEnqueuer(trigger_type))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Enqueuer>> {
        self.enqueuers.values()
    }
}

impl std::fmt::Debug for EnqueuerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.enqueuers.keys()).finish()
    }
}
