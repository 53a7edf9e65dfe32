use crate::FunctionId;
use indexmap::IndexMap;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(60);

/// Limits of a batching chain: how many same-target events one worker may process
/// back to back, and for how long after the first of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batching {
    pub limit: u32,
    pub deadline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub env: IndexMap<String, String>,
    pub timeout: Duration,
    pub batch: Option<Batching>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            env: IndexMap::new(),
            timeout: DEFAULT_TARGET_TIMEOUT,
            batch: None,
        }
    }
}

/// A function handler together with the context it executes in.
///
/// Events hold an `Arc<Target>` snapshot, so a target is never mutated once referenced.
/// Context updates produce a new snapshot via [`Target::with_context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: FunctionId,
    pub handler: String,
    pub cwd: PathBuf,
    pub context: Arc<Context>,
}

impl Target {
    #[must_use]
    pub fn new(id: FunctionId, handler: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id,
            handler: handler.into(),
            cwd: cwd.into(),
            context: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_context(&self, context: Arc<Context>) -> Self {
        Self {
            id: self.id.clone(),
            handler: self.handler.clone(),
            cwd: self.cwd.clone(),
            context,
        }
    }

    #[must_use]
    pub fn key(&self) -> TargetKey {
        TargetKey {
            cwd: self.cwd.clone(),
            handler: self.handler.clone(),
        }
    }

    #[must_use]
    pub fn filter(&self) -> TargetFilter {
        TargetFilter {
            cwd: self.cwd.clone(),
            handler: Some(self.handler.clone()),
        }
    }
}

/// Identity of a target for subscription bookkeeping and batching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("{}#{}", cwd.display(), handler)]
pub struct TargetKey {
    pub cwd: PathBuf,
    pub handler: String,
}

/// Selects the subscriptions to drop. Without a handler, every trigger of the function
/// living in `cwd` matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFilter {
    pub cwd: PathBuf,
    pub handler: Option<String>,
}

impl TargetFilter {
    #[must_use]
    pub fn function(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            handler: None,
        }
    }

    #[must_use]
    pub fn matches(&self, target: &Target) -> bool {
        self.matches_parts(&target.cwd, &target.handler)
    }

    #[must_use]
    pub fn matches_key(&self, key: &TargetKey) -> bool {
        self.matches_parts(&key.cwd, &key.handler)
    }

    fn matches_parts(&self, cwd: &Path, handler: &str) -> bool {
        self.cwd == cwd
            && self
                .handler
                .as_deref()
                .is_none_or(|expected| expected == handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("hello"), "hello", true)]
    #[case(Some("hello"), "other", false)]
    #[case(None, "hello", true)]
    #[case(None, "other", true)]
    fn filter_matching(
        #[case] filter_handler: Option<&str>,
        #[case] handler: &str,
        #[case] expected: bool,
    ) {
        let target = Target::new(FunctionId::new("fn1"), handler, "/functions/fn1");
        let filter = TargetFilter {
            cwd: PathBuf::from("/functions/fn1"),
            handler: filter_handler.map(ToString::to_string),
        };
        assert_eq!(expected, filter.matches(&target));
    }

    #[test]
    fn filter_does_not_match_other_function() {
        let target = Target::new(FunctionId::new("fn2"), "hello", "/functions/fn2");
        assert!(!TargetFilter::function("/functions/fn1").matches(&target));
    }
}
