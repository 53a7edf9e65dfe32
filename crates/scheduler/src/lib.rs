pub mod dispatcher;
pub mod reconcile;
pub mod scheduler;

pub use reconcile::{Reconciler, Reconciliation, diff_triggers};
pub use scheduler::{PoolStatus, Scheduler, SchedulerConfig};
