//! Background check-in sweeper.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use motionwatch_store::DeviceStore;

use crate::registry::DeviceRegistry;

/// Periodically marks devices that stopped checking in.
///
/// A device is demoted once `now - latest_check_in_time` exceeds the timeout.
/// The sweeper only ever clears `is_checked_in`; a check-in or sensor ping is
/// the only way back.
pub struct CheckInSweeper<S> {
    registry: Arc<DeviceRegistry<S>>,
    timeout: Duration,
    stop_tx: watch::Sender<bool>,
}

impl<S: DeviceStore + 'static> CheckInSweeper<S> {
    /// Create a sweeper that runs every `timeout` and demotes devices silent
    /// for longer than `timeout`.
    pub fn new(registry: Arc<DeviceRegistry<S>>, timeout: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            registry,
            timeout,
            stop_tx,
        }
    }

    /// The staleness window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one sweep using the current time.
    pub async fn sweep(&self) -> Vec<String> {
        self.sweep_at(OffsetDateTime::now_utc()).await
    }

    /// Run one sweep as of `now`. Returns the names of demoted devices.
    pub async fn sweep_at(&self, now: OffsetDateTime) -> Vec<String> {
        let timeout = time::Duration::try_from(self.timeout).unwrap_or(time::Duration::MAX);
        let mut demoted = Vec::new();

        for record in self.registry.snapshot().await {
            if !record.is_checked_in || !record.is_stale(now, timeout) {
                continue;
            }

            match self
                .registry
                .mark_checked_out(&record.name, now, timeout)
                .await
            {
                Ok(true) => {
                    warn!(
                        "{} has not checked in since {}",
                        record.name, record.latest_check_in_time
                    );
                    demoted.push(record.name);
                }
                Ok(false) => debug!("{} checked in during the sweep", record.name),
                Err(e) => error!("Failed to mark {} as not checked in: {}", record.name, e),
            }
        }

        demoted
    }

    /// Spawn the sweep loop. It runs until [`stop`](Self::stop) is called.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            info!("Check-in sweeper running every {:?}", self.timeout);

            let mut timer = interval(self.timeout);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let demoted = self.sweep().await;
                        if !demoted.is_empty() {
                            info!("Sweep marked {} device(s) as not checked in", demoted.len());
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("Check-in sweeper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signal the sweep loop to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::EventLogStore;
    use motionwatch_store::Store;
    use motionwatch_types::DeviceRecord;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn create_test_sweeper(store: Store) -> (tempfile::TempDir, CheckInSweeper<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(EventLogStore::new(dir.path()));
        let registry = DeviceRegistry::load(store, logs).unwrap();
        (dir, CheckInSweeper::new(Arc::new(registry), TIMEOUT))
    }

    fn far_future() -> OffsetDateTime {
        OffsetDateTime::now_utc() + time::Duration::days(2)
    }

    #[tokio::test]
    async fn test_sweep_demotes_stale_devices_only() {
        let store = Store::open_in_memory().unwrap();
        let an_hour_ago =
            (OffsetDateTime::now_utc() - time::Duration::hours(1)).replace_nanosecond(0).unwrap();
        store
            .upsert_device(&DeviceRecord::new("quiet", an_hour_ago))
            .unwrap();
        let (_dir, sweeper) = create_test_sweeper(store);
        sweeper.registry.check_in("chatty").await.unwrap();

        let demoted = sweeper.sweep().await;

        assert_eq!(demoted, vec!["quiet".to_string()]);
        let quiet = sweeper.registry.get("quiet").await.unwrap();
        assert!(!quiet.is_checked_in);
        assert_eq!(quiet.latest_check_in_time, an_hour_ago);
        assert!(sweeper.registry.get("chatty").await.unwrap().is_checked_in);
    }

    #[tokio::test]
    async fn test_sweep_boundary_is_exclusive() {
        let (_dir, sweeper) = create_test_sweeper(Store::open_in_memory().unwrap());
        sweeper.registry.check_in("cam").await.unwrap();
        let checked_in = sweeper.registry.get("cam").await.unwrap().latest_check_in_time;

        let at_limit = checked_in + time::Duration::seconds(300);
        assert!(sweeper.sweep_at(at_limit).await.is_empty());

        let past_limit = checked_in + time::Duration::seconds(301);
        assert_eq!(sweeper.sweep_at(past_limit).await, vec!["cam".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_never_promotes() {
        let (_dir, sweeper) = create_test_sweeper(Store::open_in_memory().unwrap());
        sweeper.registry.check_in("cam").await.unwrap();

        assert_eq!(sweeper.sweep_at(far_future()).await, vec!["cam".to_string()]);

        // A sweep at an instant where the device looks fresh leaves it demoted
        assert!(sweeper.sweep().await.is_empty());
        assert!(!sweeper.registry.get("cam").await.unwrap().is_checked_in);

        // Already demoted devices are not reported again
        assert!(sweeper.sweep_at(far_future()).await.is_empty());
    }

    #[tokio::test]
    async fn test_check_in_restores_after_sweep() {
        let (_dir, sweeper) = create_test_sweeper(Store::open_in_memory().unwrap());
        sweeper.registry.check_in("cam").await.unwrap();
        sweeper.sweep_at(far_future()).await;

        sweeper.registry.check_in("cam").await.unwrap();

        assert!(sweeper.registry.get("cam").await.unwrap().is_checked_in);
    }

    #[tokio::test]
    async fn test_loop_sweeps_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(EventLogStore::new(dir.path()));
        let registry =
            Arc::new(DeviceRegistry::load(Store::open_in_memory().unwrap(), logs).unwrap());
        registry.check_in("cam").await.unwrap();

        let sweeper = Arc::new(CheckInSweeper::new(
            Arc::clone(&registry),
            Duration::from_millis(10),
        ));
        let handle = Arc::clone(&sweeper).start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!registry.get("cam").await.unwrap().is_checked_in);

        sweeper.stop();
        handle.await.unwrap();
    }
}
