pub mod event;
pub mod target;
pub mod trigger;

pub use event::{Event, EventOutcome, EventType, FailureKind};
pub use target::{Batching, Context, Target, TargetFilter, TargetKey};
pub use trigger::{
    DatabaseOperation, FunctionSpec, TargetChange, Trigger, TriggerOptions, TriggerType,
};

use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};

/// Identifies a deployed function. All handlers of a function share its working directory
/// and execution context.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct FunctionId(Arc<str>);

impl FunctionId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FunctionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct EventId(uuid::Uuid);

impl EventId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl FromStr for EventId {
    type Err = IdParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(input)
            .map(Self)
            .map_err(|err| IdParseError::Malformed(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("wrong prefix, expected `{expected}`")]
    WrongPrefix { expected: &'static str },
    #[error("malformed id: {0}")]
    Malformed(String),
}

pub mod prefixed_ulid {
    use super::IdParseError;
    use std::{
        fmt::{Debug, Display},
        hash::Hash,
        marker::PhantomData,
        str::FromStr,
    };

    pub trait Prefix {
        const PREFIX: &'static str;
    }

    pub struct PrefixedUlid<T: Prefix> {
        ulid: ulid::Ulid,
        phantom_data: PhantomData<fn(T) -> T>,
    }

    impl<T: Prefix> PrefixedUlid<T> {
        #[must_use]
        pub fn generate() -> Self {
            Self::from_ulid(ulid::Ulid::new())
        }

        #[must_use]
        pub const fn from_ulid(ulid: ulid::Ulid) -> Self {
            Self {
                ulid,
                phantom_data: PhantomData,
            }
        }

        #[must_use]
        pub fn timestamp_ms(&self) -> u64 {
            self.ulid.timestamp_ms()
        }
    }

    impl<T: Prefix> Display for PrefixedUlid<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}_{}", T::PREFIX, self.ulid)
        }
    }

    impl<T: Prefix> Debug for PrefixedUlid<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Display::fmt(&self, f)
        }
    }

    impl<T: Prefix> FromStr for PrefixedUlid<T> {
        type Err = IdParseError;

        fn from_str(input: &str) -> Result<Self, Self::Err> {
            let Some(suffix) = input
                .strip_prefix(T::PREFIX)
                .and_then(|rest| rest.strip_prefix('_'))
            else {
                return Err(IdParseError::WrongPrefix {
                    expected: T::PREFIX,
                });
            };
            ulid::Ulid::from_string(suffix)
                .map(Self::from_ulid)
                .map_err(|err| IdParseError::Malformed(err.to_string()))
        }
    }

    impl<T: Prefix> Clone for PrefixedUlid<T> {
        fn clone(&self) -> Self {
            *self
        }
    }

    impl<T: Prefix> Copy for PrefixedUlid<T> {}

    impl<T: Prefix> Hash for PrefixedUlid<T> {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            T::PREFIX.hash(state);
            self.ulid.hash(state);
        }
    }

    impl<T: Prefix> PartialEq for PrefixedUlid<T> {
        fn eq(&self, other: &Self) -> bool {
            self.ulid == other.ulid
        }
    }

    impl<T: Prefix> Eq for PrefixedUlid<T> {}

    impl<T: Prefix> PartialOrd for PrefixedUlid<T> {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl<T: Prefix> Ord for PrefixedUlid<T> {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.ulid.cmp(&other.ulid)
        }
    }

    pub mod prefix {
        pub struct Wrk;
        impl super::Prefix for Wrk {
            const PREFIX: &'static str = "wrk";
        }
        pub struct Fhc;
        impl super::Prefix for Fhc {
            const PREFIX: &'static str = "fhc";
        }
    }

    pub type WorkerId = PrefixedUlid<prefix::Wrk>;
    /// Identifies one websocket client connected to the firehose.
    pub type ClientId = PrefixedUlid<prefix::Fhc>;
}

pub use prefixed_ulid::{ClientId, WorkerId};

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn worker_id_roundtrips_through_display() {
        let id = WorkerId::generate();
        let parsed: WorkerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("wrk_"));
    }

    #[test]
    fn worker_id_with_wrong_prefix_is_rejected() {
        let client = ClientId::generate().to_string();
        assert_matches!(
            client.parse::<WorkerId>(),
            Err(IdParseError::WrongPrefix { expected: "wrk" })
        );
    }

    #[test]
    fn event_id_parse_error() {
        assert_matches!("nope".parse::<EventId>(), Err(IdParseError::Malformed(_)));
    }

    #[test]
    fn function_id_is_a_plain_string_in_serde() {
        let id: FunctionId = serde_json::from_str(r#""users""#).unwrap();
        assert_eq!(FunctionId::new("users"), id);
        assert_eq!(r#""users""#, serde_json::to_string(&id).unwrap());
    }
}
