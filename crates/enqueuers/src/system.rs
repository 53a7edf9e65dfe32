use crate::{Enqueuer, SubscriptionError, mismatch};
use async_trait::async_trait;
use concepts::{EventType, Target, TargetFilter, TargetKey, TriggerOptions, TriggerType};
use indexmap::IndexMap;
use queue::EventQueue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{Instrument as _, Level, debug, info, info_span, instrument};

pub const READY_EVENT: &str = "READY";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

pub(crate) fn check_event_name(name: &str) -> Result<(), SubscriptionError> {
    if name == READY_EVENT {
        Ok(())
    } else {
        Err(SubscriptionError::UnsupportedSystemEvent(name.to_string()))
    }
}

#[derive(Default)]
struct State {
    pending: IndexMap<TargetKey, Arc<Target>>,
    timer: Option<AbortHandle>,
}

/// Fires `READY` once per target after subscriptions have been quiet for the debounce window.
pub struct SystemEnqueuer {
    queue: EventQueue,
    debounce: Duration,
    state: Arc<Mutex<State>>,
}

impl SystemEnqueuer {
    #[must_use]
    pub fn new(queue: EventQueue, debounce: Duration) -> Self {
        Self {
            queue,
            debounce,
            state: Arc::default(),
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

async fn fire(state: Arc<Mutex<State>>, queue: EventQueue, debounce: Duration) {
    tokio::time::sleep(debounce).await;
    let ready = {
        let mut state = state.lock().unwrap();
        // Past this point the timer can no longer be reset.
        state.timer = None;
        std::mem::take(&mut state.pending)
    };
    info!("Firing {READY_EVENT} for {} targets", ready.len());
    for target in ready.into_values() {
        let event = queue.new_event(EventType::System, &target);
        debug!(event_id = %event.id, handler = %target.handler, "Enqueuing {READY_EVENT}");
        if let Err(err) = queue.enqueue(event).await {
            debug!("Cannot enqueue {READY_EVENT}: {err}");
            return;
        }
    }
}

#[async_trait]
impl Enqueuer for SystemEnqueuer {
    fn trigger_type(&self) -> TriggerType {
        TriggerType::System
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(handler = %target.handler))]
    async fn subscribe(
        &self,
        target: Arc<Target>,
        options: &TriggerOptions,
    ) -> Result<(), SubscriptionError> {
        let TriggerOptions::System { name } = options else {
            return Err(mismatch(TriggerType::System, options));
        };
        check_event_name(name)?;
        let mut state = self.state.lock().unwrap();
        state.pending.insert(target.key(), target);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let task = tokio::spawn(
            fire(self.state.clone(), self.queue.clone(), self.debounce)
                .instrument(info_span!("system_debounce")),
        );
        state.timer = Some(task.abort_handle());
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(cwd = ?filter.cwd, handler = ?filter.handler))]
    async fn unsubscribe(&self, filter: &TargetFilter) {
        self.state
            .lock()
            .unwrap()
            .pending
            .retain(|key, _| !filter.matches_key(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use concepts::FunctionId;
    use queue::QueueMessage;
    use tokio::sync::mpsc;

    fn target(function: &str) -> Arc<Target> {
        Arc::new(Target::new(
            FunctionId::new(function),
            "onReady",
            format!("/functions/{function}"),
        ))
    }

    fn ready() -> TriggerOptions {
        TriggerOptions::System {
            name: READY_EVENT.to_string(),
        }
    }

    async fn next_handler_cwd(receiver: &mut mpsc::Receiver<QueueMessage>) -> String {
        let message = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        let QueueMessage::Enqueued(event) = message else {
            panic!("unexpected message {message:?}")
        };
        assert_eq!(EventType::System, event.event_type);
        event.target.cwd.display().to_string()
    }

    #[tokio::test]
    async fn burst_of_subscriptions_fires_once_after_quiet_period() {
        test_utils::set_up();
        let (queue, mut receiver) = EventQueue::new(16);
        let enqueuer = SystemEnqueuer::new(queue, Duration::from_millis(300));
        enqueuer.subscribe(target("fn1"), &ready()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        enqueuer.subscribe(target("fn2"), &ready()).await.unwrap();
        // More than the window since the first subscription, less since the last.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(receiver.try_recv().is_err());
        assert_eq!(2, enqueuer.pending_count());

        assert_eq!("/functions/fn1", next_handler_cwd(&mut receiver).await);
        assert_eq!("/functions/fn2", next_handler_cwd(&mut receiver).await);
        assert_eq!(0, enqueuer.pending_count());

        // Already fired targets are not repeated with the next wave.
        enqueuer.subscribe(target("fn3"), &ready()).await.unwrap();
        assert_eq!("/functions/fn3", next_handler_cwd(&mut receiver).await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribed_target_does_not_fire() {
        test_utils::set_up();
        let (queue, mut receiver) = EventQueue::new(16);
        let enqueuer = SystemEnqueuer::new(queue, Duration::from_millis(100));
        enqueuer.subscribe(target("fn1"), &ready()).await.unwrap();
        enqueuer.subscribe(target("fn2"), &ready()).await.unwrap();
        enqueuer
            .unsubscribe(&TargetFilter::function("/functions/fn1"))
            .await;
        assert_eq!("/functions/fn2", next_handler_cwd(&mut receiver).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_ready_is_supported() {
        test_utils::set_up();
        let (queue, _receiver) = EventQueue::new(16);
        let enqueuer = SystemEnqueuer::new(queue, DEFAULT_DEBOUNCE);
        assert_matches!(
            enqueuer
                .subscribe(
                    target("fn1"),
                    &TriggerOptions::System {
                        name: "SHUTDOWN".to_string()
                    }
                )
                .await,
            Err(SubscriptionError::UnsupportedSystemEvent(name)) if name == "SHUTDOWN"
        );
        assert_eq!(0, enqueuer.pending_count());
    }
}
