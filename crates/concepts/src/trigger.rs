use crate::{Context, FunctionId, Target};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Http,
    Database,
    Schedule,
    Firehose,
    System,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseOperation {
    Insert,
    Update,
    Replace,
    Delete,
}

impl DatabaseOperation {
    #[must_use]
    pub fn all() -> Vec<DatabaseOperation> {
        use strum::IntoEnumIterator as _;
        Self::iter().collect()
    }
}

/// Type specific options of a trigger, tagged by the enqueuer type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerOptions {
    Http {
        method: String,
        path: String,
        #[serde(default)]
        preflight: bool,
    },
    Database {
        collection: String,
        #[serde(default = "DatabaseOperation::all")]
        types: Vec<DatabaseOperation>,
    },
    Schedule {
        frequency: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    Firehose {
        event: String,
    },
    System {
        name: String,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl TriggerOptions {
    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Http { .. } => TriggerType::Http,
            Self::Database { .. } => TriggerType::Database,
            Self::Schedule { .. } => TriggerType::Schedule,
            Self::Firehose { .. } => TriggerType::Firehose,
            Self::System { .. } => TriggerType::System,
        }
    }
}

const fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(flatten)]
    pub options: TriggerOptions,
    /// Inactive triggers are kept in the declaration but must not be subscribed.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Trigger {
    #[must_use]
    pub fn active(options: TriggerOptions) -> Self {
        Self {
            options,
            active: true,
        }
    }

    #[must_use]
    pub fn inactive(options: TriggerOptions) -> Self {
        Self {
            options,
            active: false,
        }
    }
}

/// Declared configuration of one function as read from the function store.
/// Triggers are keyed by handler name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub id: FunctionId,
    pub cwd: PathBuf,
    pub context: Arc<Context>,
    pub triggers: IndexMap<String, Trigger>,
}

impl FunctionSpec {
    #[must_use]
    pub fn new(id: FunctionId, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id,
            cwd: cwd.into(),
            context: Arc::default(),
            triggers: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_trigger(mut self, handler: impl Into<String>, trigger: Trigger) -> Self {
        self.triggers.insert(handler.into(), trigger);
        self
    }

    #[must_use]
    pub fn target(&self, handler: &str) -> Arc<Target> {
        Arc::new(Target {
            id: self.id.clone(),
            handler: handler.to_string(),
            cwd: self.cwd.clone(),
            context: self.context.clone(),
        })
    }
}

/// Subscription delta for one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetChange {
    Added {
        target: Arc<Target>,
        trigger: TriggerOptions,
    },
    Updated {
        target: Arc<Target>,
        previous: TriggerOptions,
        current: TriggerOptions,
    },
    Removed {
        target: Arc<Target>,
        trigger: TriggerOptions,
    },
}

impl TargetChange {
    #[must_use]
    pub fn target(&self) -> &Arc<Target> {
        match self {
            Self::Added { target, .. }
            | Self::Updated { target, .. }
            | Self::Removed { target, .. } => target,
        }
    }

    #[must_use]
    pub fn handler(&self) -> &str {
        &self.target().handler
    }

    /// Options of the subscription this change ends up with (or removes).
    #[must_use]
    pub fn options(&self) -> &TriggerOptions {
        match self {
            Self::Added { trigger, .. } | Self::Removed { trigger, .. } => trigger,
            Self::Updated { current, .. } => current,
        }
    }

    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        self.options().trigger_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_deserializes_with_defaults() {
        let trigger: Trigger = serde_json::from_value(serde_json::json!({
            "type": "database",
            "collection": "users",
        }))
        .unwrap();
        assert!(trigger.active);
        assert_eq!(
            TriggerOptions::Database {
                collection: "users".to_string(),
                types: DatabaseOperation::all(),
            },
            trigger.options
        );
    }

    #[test]
    fn inactive_schedule_trigger() {
        let trigger: Trigger = serde_json::from_value(serde_json::json!({
            "type": "schedule",
            "frequency": "*/5 * * * *",
            "active": false,
        }))
        .unwrap();
        assert!(!trigger.active);
        assert_eq!(TriggerType::Schedule, trigger.options.trigger_type());
        assert_eq!(
            TriggerOptions::Schedule {
                frequency: "*/5 * * * *".to_string(),
                timezone: "UTC".to_string(),
            },
            trigger.options
        );
    }

    #[test]
    fn trigger_type_parses_from_snake_case() {
        assert_eq!(TriggerType::Firehose, "firehose".parse().unwrap());
        assert_eq!("system", TriggerType::System.to_string());
    }
}
