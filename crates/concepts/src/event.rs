use crate::{EventId, Target};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Http,
    Database,
    Firehose,
    Schedule,
    System,
}

/// The thin envelope routed through the event queue. Type specific payloads travel
/// separately in the sub-queue matching `event_type`, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub target: Arc<Target>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    #[must_use]
    pub fn new(event_type: EventType, target: Arc<Target>) -> Self {
        Self {
            id: EventId::generate(),
            event_type,
            target,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The handler ran and reported failure.
    Handler,
    Timeout,
    WorkerCrash,
    /// The queue was killed before the event reached a worker.
    Cancelled,
}

/// Terminal outcome of an event. There is no redelivery after any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EventOutcome {
    #[display("succeeded")]
    Succeeded,
    #[display("failed: {_0}")]
    Failed(FailureKind),
}

impl EventOutcome {
    #[must_use]
    pub fn from_completion(succeeded: bool) -> Self {
        if succeeded {
            Self::Succeeded
        } else {
            Self::Failed(FailureKind::Handler)
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}
