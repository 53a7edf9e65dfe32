use crate::{Enqueuer, SubscriptionError, mismatch};
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use concepts::{EventType, Target, TargetFilter, TargetKey, TriggerOptions, TriggerType};
use cron::Schedule;
use queue::EventQueue;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;
use tracing::{Instrument as _, Level, debug, info, info_span, instrument, trace};

/// Parses a cron expression. Five-field expressions get a leading `0` seconds field.
pub(crate) fn parse_schedule(
    frequency: &str,
    timezone: &str,
) -> Result<(Schedule, Tz), SubscriptionError> {
    let expression = if frequency.split_whitespace().count() == 5 {
        format!("0 {frequency}")
    } else {
        frequency.to_string()
    };
    let schedule =
        Schedule::from_str(&expression).map_err(|err| SubscriptionError::InvalidCron {
            frequency: frequency.to_string(),
            reason: err.to_string(),
        })?;
    let timezone = timezone
        .parse::<Tz>()
        .map_err(|_| SubscriptionError::InvalidTimezone(timezone.to_string()))?;
    Ok((schedule, timezone))
}

struct Job {
    task: AbortHandle,
}

impl Drop for Job {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One cron job per target.
pub struct ScheduleEnqueuer {
    queue: EventQueue,
    jobs: Mutex<hashbrown::HashMap<TargetKey, Job>>,
}

impl ScheduleEnqueuer {
    #[must_use]
    pub fn new(queue: EventQueue) -> Self {
        Self {
            queue,
            jobs: Mutex::default(),
        }
    }

    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

async fn run(schedule: Schedule, timezone: Tz, target: Arc<Target>, queue: EventQueue) {
    let mut last = Utc::now().with_timezone(&timezone);
    loop {
        let Some(next) = schedule.after(&last).next() else {
            debug!("Schedule has no upcoming ticks");
            return;
        };
        let delay = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();
        trace!("Next tick at {next}");
        tokio::time::sleep(delay).await;
        last = next;
        let event = queue.new_event(EventType::Schedule, &target);
        debug!(event_id = %event.id, "Enqueuing tick");
        if let Err(err) = queue.enqueue(event).await {
            debug!("Stopping schedule: {err}");
            return;
        }
    }
}

#[async_trait]
impl Enqueuer for ScheduleEnqueuer {
    fn trigger_type(&self) -> TriggerType {
        TriggerType::Schedule
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(handler = %target.handler))]
    async fn subscribe(
        &self,
        target: Arc<Target>,
        options: &TriggerOptions,
    ) -> Result<(), SubscriptionError> {
        let TriggerOptions::Schedule {
            frequency,
            timezone,
        } = options
        else {
            return Err(mismatch(TriggerType::Schedule, options));
        };
        let (schedule, tz) = parse_schedule(frequency, timezone)?;
        let key = target.key();
        info!(%frequency, %timezone, "Scheduling {key}");
        let span = info_span!("schedule", target_key = %key);
        let task = tokio::spawn(run(schedule, tz, target, self.queue.clone()).instrument(span));
        // Replacing drops and aborts the previous job.
        self.jobs.lock().unwrap().insert(
            key,
            Job {
                task: task.abort_handle(),
            },
        );
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(cwd = ?filter.cwd, handler = ?filter.handler))]
    async fn unsubscribe(&self, filter: &TargetFilter) {
        self.jobs.lock().unwrap().retain(|key, _| {
            let remove = filter.matches_key(key);
            if remove {
                debug!("Removing schedule of {key}");
            }
            !remove
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use concepts::FunctionId;
    use queue::QueueMessage;
    use rstest::rstest;
    use std::time::Duration;

    fn schedule(frequency: &str) -> TriggerOptions {
        TriggerOptions::Schedule {
            frequency: frequency.to_string(),
            timezone: "UTC".to_string(),
        }
    }

    fn target(handler: &str) -> Arc<Target> {
        Arc::new(Target::new(FunctionId::new("fn1"), handler, "/functions/fn1"))
    }

    #[rstest]
    #[case("*/5 * * * *")]
    #[case("0 0 12 * * Mon-Fri")]
    #[case("0 30 9,12,15 1,15 May-Aug Mon,Wed,Fri 2030/2")]
    fn accepted_expressions(#[case] frequency: &str) {
        parse_schedule(frequency, "America/New_York").unwrap();
    }

    #[test]
    fn rejected_expressions() {
        assert_matches!(
            parse_schedule("61 * * * *", "UTC"),
            Err(SubscriptionError::InvalidCron { frequency, .. }) if frequency == "61 * * * *"
        );
        assert_matches!(
            parse_schedule("* * * * *", "Nowhere/City"),
            Err(SubscriptionError::InvalidTimezone(_))
        );
    }

    #[tokio::test]
    async fn ticks_until_unsubscribed() {
        test_utils::set_up();
        let (queue, mut receiver) = EventQueue::new(16);
        let enqueuer = ScheduleEnqueuer::new(queue);
        enqueuer
            .subscribe(target("tick"), &schedule("* * * * * *"))
            .await
            .unwrap();
        assert_eq!(1, enqueuer.job_count());

        let message = tokio::time::timeout(Duration::from_secs(3), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_matches!(
            message,
            QueueMessage::Enqueued(event)
                if event.event_type == EventType::Schedule && event.target.handler == "tick"
        );

        enqueuer
            .unsubscribe(&TargetFilter::function("/functions/fn1"))
            .await;
        assert_eq!(0, enqueuer.job_count());
        tokio::time::sleep(Duration::from_millis(100)).await;
        while receiver.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribe_replaces_job() {
        test_utils::set_up();
        let (queue, _receiver) = EventQueue::new(16);
        let enqueuer = ScheduleEnqueuer::new(queue);
        enqueuer
            .subscribe(target("a"), &schedule("0 0 * * *"))
            .await
            .unwrap();
        enqueuer
            .subscribe(target("a"), &schedule("0 12 * * *"))
            .await
            .unwrap();
        enqueuer
            .subscribe(target("b"), &schedule("0 12 * * *"))
            .await
            .unwrap();
        assert_eq!(2, enqueuer.job_count());
        enqueuer.unsubscribe(&target("a").filter()).await;
        assert_eq!(1, enqueuer.job_count());
    }
}
