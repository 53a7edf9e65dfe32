use concepts::{Context, FunctionId, FunctionSpec, TargetChange};
use indexmap::IndexMap;
use std::sync::Arc;

/// Subscription deltas between two declarations of the same function.
///
/// Inactive triggers count as absent. A function whose `cwd` changed gets every trigger
/// removed from the old location and added at the new one. Removals come first, then
/// updates, then additions, each group in declaration order.
#[must_use]
pub fn diff_triggers(previous: &FunctionSpec, current: &FunctionSpec) -> Vec<TargetChange> {
    let moved = previous.cwd != current.cwd;
    let mut removed = Vec::new();
    let mut updated = Vec::new();
    for (handler, before) in previous.triggers.iter().filter(|(_, trigger)| trigger.active) {
        match current.triggers.get(handler) {
            Some(after) if after.active && !moved => {
                if after.options != before.options {
                    updated.push(TargetChange::Updated {
                        target: current.target(handler),
                        previous: before.options.clone(),
                        current: after.options.clone(),
                    });
                }
            }
            _ => removed.push(TargetChange::Removed {
                target: previous.target(handler),
                trigger: before.options.clone(),
            }),
        }
    }
    let added = current
        .triggers
        .iter()
        .filter(|(handler, trigger)| {
            trigger.active
                && (moved
                    || !previous
                        .triggers
                        .get(*handler)
                        .is_some_and(|before| before.active))
        })
        .map(|(handler, trigger)| TargetChange::Added {
            target: current.target(handler),
            trigger: trigger.options.clone(),
        });
    removed.into_iter().chain(updated).chain(added).collect()
}

fn apply_order(change: &TargetChange) -> u8 {
    match change {
        TargetChange::Removed { .. } => 0,
        TargetChange::Updated { .. } => 1,
        TargetChange::Added { .. } => 2,
    }
}

/// Everything the scheduler has to do to move from the last synced declarations to new ones.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Trigger deltas of all functions, removals first.
    pub changes: Vec<TargetChange>,
    /// Contexts of functions that are new or whose context changed.
    pub contexts: Vec<(FunctionId, Arc<Context>)>,
    /// Functions that are no longer declared.
    pub removed: Vec<FunctionSpec>,
}

impl Reconciliation {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.contexts.is_empty() && self.removed.is_empty()
    }
}

/// Remembers the last applied function declarations.
#[derive(Debug, Default)]
pub struct Reconciler {
    functions: IndexMap<FunctionId, FunctionSpec>,
}

impl Reconciler {
    pub fn functions(&self) -> impl Iterator<Item = &FunctionSpec> {
        self.functions.values()
    }

    pub fn sync(&mut self, functions: impl IntoIterator<Item = FunctionSpec>) -> Reconciliation {
        let mut previous = std::mem::take(&mut self.functions);
        let mut reconciliation = Reconciliation::default();
        for function in functions {
            let (before, is_new) = match previous.shift_remove(&function.id) {
                Some(before) => (before, false),
                None => (
                    FunctionSpec::new(function.id.clone(), function.cwd.clone()),
                    true,
                ),
            };
            if is_new || before.context != function.context {
                reconciliation
                    .contexts
                    .push((function.id.clone(), function.context.clone()));
            }
            reconciliation
                .changes
                .extend(diff_triggers(&before, &function));
            self.functions.insert(function.id.clone(), function);
        }
        // Stable, so declaration order survives within each group.
        reconciliation.changes.sort_by_key(apply_order);
        reconciliation.removed = previous.into_values().collect();
        reconciliation
    }

    /// Marks the trigger of a change that could not be applied as unsubscribed,
    /// so that the next [`Reconciler::sync`] adds it again.
    pub fn forget(&mut self, change: &TargetChange) {
        if let TargetChange::Removed { .. } = change {
            return;
        }
        let target = change.target();
        if let Some(trigger) = self
            .functions
            .get_mut(&target.id)
            .filter(|function| function.cwd == target.cwd)
            .and_then(|function| function.triggers.get_mut(&target.handler))
        {
            trigger.active = false;
        }
    }
}
