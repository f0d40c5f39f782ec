//! Periodic removal of expired idempotency records.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{ConfigError, SweeperConfig};

use super::guard::IdempotencyGuard;
use super::store::{IdempotencyStore, IdempotencyStoreError};

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub deleted: u64,
    pub errors: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

/// Calls [`IdempotencyGuard::cleanup_expired`] on a fixed interval.
pub struct IdempotencySweeper<S> {
    guard: Arc<IdempotencyGuard<S>>,
}

impl<S> IdempotencySweeper<S>
where
    S: IdempotencyStore + 'static,
{
    pub fn new(guard: Arc<IdempotencyGuard<S>>) -> Self {
        Self { guard }
    }

    /// One sweep, outside any schedule.
    pub async fn sweep_once(&self) -> Result<u64, IdempotencyStoreError> {
        self.guard.cleanup_expired().await
    }

    /// Run on the current tokio runtime until the handle is shut down.
    ///
    /// The first sweep happens immediately. A zero interval is rejected.
    pub fn spawn(self, config: SweeperConfig) -> Result<SweeperHandle, ConfigError> {
        config.validate()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let task_stats = stats.clone();

        let join = tokio::spawn(async move {
            info!(interval_secs = config.interval.as_secs(), "idempotency sweeper started");
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let result = self.sweep_once().await;
                        record_sweep(&task_stats, &result);
                        match result {
                            Ok(deleted) => debug!(deleted, "idempotency sweep finished"),
                            Err(e) => error!(error = %e, "idempotency sweep failed"),
                        }
                    }
                }
            }

            info!("idempotency sweeper stopped");
        });

        Ok(SweeperHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        })
    }
}

fn record_sweep(stats: &Mutex<SweeperStats>, result: &Result<u64, IdempotencyStoreError>) {
    let Ok(mut s) = stats.lock() else {
        return;
    };
    s.sweeps += 1;
    s.last_sweep_at = Some(Utc::now());
    match result {
        Ok(deleted) => s.deleted += deleted,
        Err(_) => s.errors += 1,
    }
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Stop the sweeper and wait for the current sweep to finish.
    pub async fn shutdown(mut self) -> SweeperStats {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "idempotency sweeper task panicked");
            }
        }
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdempotencyConfig;
    use crate::idempotency::{IdempotencyKey, IdempotencyRecord, InMemoryIdempotencyStore};
    use std::time::Duration;
    use wms_core::Payload;

    fn expired(key: &str) -> IdempotencyRecord {
        IdempotencyRecord::pending(
            IdempotencyKey::new(key).unwrap(),
            "op",
            "test",
            Payload::new(),
            Duration::ZERO,
            Utc::now() - chrono::Duration::minutes(1),
        )
    }

    #[tokio::test]
    async fn sweep_once_counts_deleted_rows() {
        let store = InMemoryIdempotencyStore::arc();
        store.put_raw(expired("a")).unwrap();
        store.put_raw(expired("b")).unwrap();

        let guard = Arc::new(IdempotencyGuard::new(store.clone(), &IdempotencyConfig::default()));
        let sweeper = IdempotencySweeper::new(guard);

        assert_eq!(sweeper.sweep_once().await.unwrap(), 2);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_and_stops() {
        let store = InMemoryIdempotencyStore::arc();
        store.put_raw(expired("a")).unwrap();

        let guard = Arc::new(IdempotencyGuard::new(store.clone(), &IdempotencyConfig::default()));
        let handle = IdempotencySweeper::new(guard)
            .spawn(SweeperConfig {
                interval: Duration::from_millis(10),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = handle.shutdown().await;

        assert!(stats.sweeps >= 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_sweep_at.is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let guard = Arc::new(IdempotencyGuard::new(
            InMemoryIdempotencyStore::arc(),
            &IdempotencyConfig::default(),
        ));

        let err = IdempotencySweeper::new(guard)
            .spawn(SweeperConfig {
                interval: Duration::ZERO,
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WMS_SWEEP_INTERVAL_SECS", .. }));
    }
}
