//! Background upkeep of in-flight replication events.
//!
//! Workers prove liveness with [`run_health_updates`] while they replicate.
//! [`StaleJobReclaimer`] returns events of workers that stopped proving
//! liveness to the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::ReplicationEvent;
use crate::domain::ports::{QueueReader, ReplicationQueueError};

/// Default interval between liveness refreshes.
pub const DEFAULT_HEALTH_UPDATE_PERIOD: Duration = Duration::from_secs(5);
/// Default age after which an in-flight event is considered abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(60);

fn shutdown_requested(
    changed: Result<(), watch::error::RecvError>,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *shutdown.borrow()
}

/// Refresh the liveness of `events` every `period` until shutdown.
///
/// Returns once none of the events holds its lock any more, or with the
/// first queue error.
pub async fn run_health_updates<R>(
    queue: &R,
    events: &[ReplicationEvent],
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ReplicationQueueError>
where
    R: QueueReader + ?Sized,
{
    if events.is_empty() {
        return Ok(());
    }
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    return Ok(());
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let locked = queue.health_update(events).await?;
        debug!(events = events.len(), locked, "replication events health updated");
        if locked == 0 {
            return Ok(());
        }
    }
}

/// Periodically reclaims abandoned in-flight events.
pub struct StaleJobReclaimer<R: ?Sized> {
    queue: Arc<R>,
    threshold: Duration,
    period: Duration,
}

impl<R> StaleJobReclaimer<R>
where
    R: QueueReader + ?Sized,
{
    /// Reclaim events older than `threshold`, checking every `period`.
    pub fn new(queue: Arc<R>, threshold: Duration, period: Duration) -> Self {
        Self {
            queue,
            threshold,
            period,
        }
    }

    /// Run one reclaim pass.
    pub async fn reclaim(&self) -> Result<u64, ReplicationQueueError> {
        let reclaimed = self.queue.acknowledge_stale(self.threshold).await?;
        if reclaimed > 0 {
            info!(reclaimed, threshold = ?self.threshold, "reclaimed stale replication events");
        }
        Ok(reclaimed)
    }

    /// Reclaim until shutdown; failed passes are logged and retried.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if shutdown_requested(changed, &shutdown) {
                        info!("stale job reclaimer stopped");
                        return;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.reclaim().await {
                warn!(error = %err, "stale replication event reclaim failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::domain::ports::MockQueueReader;
    use crate::domain::{JobState, ReplicationJob};

    fn event(id: u64) -> ReplicationEvent {
        let job = ReplicationJob::update("default", "a.git", "gitaly-1", "gitaly-2");
        ReplicationEvent {
            id,
            state: JobState::InProgress,
            attempt: 2,
            lock_id: job.lock_id(),
            created_at: Utc::now(),
            updated_at: None,
            job,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn health_updates_stop_when_no_event_is_locked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let mut queue = MockQueueReader::new();
        queue.expect_health_update().returning(move |_| {
            let call = counted.fetch_add(1, Ordering::SeqCst);
            Ok(if call < 2 { 1 } else { 0 })
        });
        let (_tx, rx) = watch::channel(false);
        let events = [event(1)];

        run_health_updates(&queue, &events, Duration::from_secs(5), rx)
            .await
            .expect("health updates succeed");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn health_updates_stop_on_shutdown() {
        let mut queue = MockQueueReader::new();
        queue.expect_health_update().returning(|_| Ok(1));
        let (tx, rx) = watch::channel(false);
        let events = [event(1)];

        let updater = run_health_updates(&queue, &events, Duration::from_secs(5), rx);
        let stopper = async {
            time::sleep(Duration::from_secs(12)).await;
            tx.send(true).expect("send shutdown");
        };
        let (result, ()) = tokio::join!(updater, stopper);

        result.expect("shutdown is not an error");
    }

    #[tokio::test(start_paused = true)]
    async fn health_update_error_is_returned() {
        let mut queue = MockQueueReader::new();
        queue
            .expect_health_update()
            .returning(|_| Err(ReplicationQueueError::connection("db down")));
        let (_tx, rx) = watch::channel(false);
        let events = [event(1)];

        let result = run_health_updates(&queue, &events, Duration::from_secs(5), rx).await;

        assert_eq!(result, Err(ReplicationQueueError::connection("db down")));
    }

    #[tokio::test]
    async fn reclaim_uses_the_threshold() {
        let mut queue = MockQueueReader::new();
        queue
            .expect_acknowledge_stale()
            .withf(|older_than| *older_than == Duration::from_secs(60))
            .returning(|_| Ok(2));
        let reclaimer = StaleJobReclaimer::new(
            Arc::new(queue),
            DEFAULT_STALE_THRESHOLD,
            Duration::from_secs(30),
        );

        assert_eq!(reclaimer.reclaim().await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reclaimer_survives_failures_until_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let mut queue = MockQueueReader::new();
        queue.expect_acknowledge_stale().returning(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(ReplicationQueueError::query("timeout"))
        });
        let reclaimer = StaleJobReclaimer::new(
            Arc::new(queue),
            DEFAULT_STALE_THRESHOLD,
            Duration::from_secs(30),
        );
        let (tx, rx) = watch::channel(false);

        let stopper = async {
            time::sleep(Duration::from_secs(65)).await;
            tx.send(true).expect("send shutdown");
        };
        tokio::join!(reclaimer.run(rx), stopper);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
