//! Periodic persistence worker
//!
//! Every interval the worker projects the cache through the column mapping
//! into one wide row and hands it to the storage backend. The data path is
//! always cache snapshot -> batch -> insert; the update-notification hook
//! only counts activity between ticks for the cycle log line.
//!
//! A failed insert marks the cycle failed and triggers storage recovery in
//! the background; the worker never blocks its ticker on a reconnect.

use crate::cache::{Sample, ValueCache};
use crate::fanout::UpdateListener;
use crate::storage::{ColumnMapping, PersistenceBatch, Storage};
use crate::supervisor::ReconnectSupervisor;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Worker counters, readable while the worker runs
#[derive(Default)]
pub struct PersistStats {
    cycles: AtomicU64,
    inserts: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    updates_seen: AtomicU64,
}

/// Point-in-time copy of [`PersistStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistStatsSnapshot {
    pub cycles: u64,
    pub inserts: u64,
    pub skipped: u64,
    pub failures: u64,
    pub updates_seen: u64,
}

impl PersistStats {
    pub fn snapshot(&self) -> PersistStatsSnapshot {
        PersistStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            updates_seen: self.updates_seen.load(Ordering::Relaxed),
        }
    }
}

/// Counts cache updates between persistence ticks
pub struct PersistActivityListener {
    stats: Arc<PersistStats>,
}

impl UpdateListener for PersistActivityListener {
    fn name(&self) -> &str {
        "persistence"
    }

    fn on_update(&self, _tag: &str, _sample: &Sample) -> anyhow::Result<()> {
        self.stats.updates_seen.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct PersistenceWorker {
    cache: Arc<ValueCache>,
    storage: Arc<dyn Storage>,
    mapping: Arc<ColumnMapping>,
    supervisor: Arc<ReconnectSupervisor>,
    interval: Duration,
    stats: Arc<PersistStats>,
}

/// Running worker task plus its cancellation handle
pub struct PersistHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PersistHandle {
    /// Cancel the worker and wait for it, bounded
    ///
    /// An in-flight cycle is allowed to finish; if it does not within the
    /// timeout the task is abandoned rather than holding up shutdown.
    pub async fn stop(self, timeout: Duration) {
        self.token.cancel();
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            warn!("persistence worker did not stop in time, abandoning");
        }
    }
}

impl PersistenceWorker {
    /// Build a worker from the configured interval
    ///
    /// Non-positive intervals are corrected to the default rather than
    /// rejected, so a misconfigured deployment keeps persisting.
    pub fn new(
        cache: Arc<ValueCache>,
        storage: Arc<dyn Storage>,
        mapping: Arc<ColumnMapping>,
        supervisor: Arc<ReconnectSupervisor>,
        interval_secs: i64,
    ) -> Self {
        let interval = if interval_secs <= 0 {
            warn!(
                configured = interval_secs,
                corrected = DEFAULT_INTERVAL_SECS,
                "invalid persistence interval, using default"
            );
            Duration::from_secs(DEFAULT_INTERVAL_SECS)
        } else {
            Duration::from_secs(interval_secs as u64)
        };
        Self::with_interval(cache, storage, mapping, supervisor, interval)
    }

    pub fn with_interval(
        cache: Arc<ValueCache>,
        storage: Arc<dyn Storage>,
        mapping: Arc<ColumnMapping>,
        supervisor: Arc<ReconnectSupervisor>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            storage,
            mapping,
            supervisor,
            interval,
            stats: Arc::new(PersistStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PersistStats> {
        self.stats.clone()
    }

    /// The fan-out listener that feeds the activity counter
    pub fn listener(&self) -> Arc<dyn UpdateListener> {
        Arc::new(PersistActivityListener {
            stats: self.stats.clone(),
        })
    }

    /// Project the cache through the mapping into one wide row
    ///
    /// Unmapped tags and samples without a value are skipped. Columns are
    /// sorted so the generated insert statement is stable across cycles.
    pub fn build_batch(&self) -> PersistenceBatch {
        let mapping = self.mapping.current();
        let mut columns: Vec<(String, f64)> = self
            .cache
            .snapshot()
            .into_iter()
            .filter_map(|(tag, sample)| {
                let column = mapping.get(&tag)?;
                let value = sample.value?;
                Some((column.clone(), value))
            })
            .collect();
        columns.sort_by(|a, b| a.0.cmp(&b.0));

        PersistenceBatch {
            captured_at: Utc::now(),
            columns,
        }
    }

    /// Run one persistence cycle
    pub async fn run_cycle(&self) {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let updates = self.stats.updates_seen.swap(0, Ordering::Relaxed);

        let batch = self.build_batch();
        if batch.is_empty() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("no mapped values to persist, skipping cycle");
            return;
        }

        match self.storage.insert_batch(&batch).await {
            Ok(()) => {
                self.stats.inserts.fetch_add(1, Ordering::Relaxed);
                info!(
                    columns = batch.len(),
                    updates_since_last = updates,
                    "persisted cycle"
                );
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, retryable = e.is_retryable(), "persistence cycle failed");

                // Recovery runs off the ticker path
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move {
                    supervisor.reconnect_storage().await;
                });
            }
        }
    }

    /// Spawn the ticking worker task
    pub fn spawn(self, token: CancellationToken) -> PersistHandle {
        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately; the first real
                // cycle happens one interval after startup
                ticker.tick().await;

                info!(interval_secs = self.interval.as_secs(), "persistence worker started");

                loop {
                    tokio::select! {
                        biased;

                        _ = token.cancelled() => {
                            info!("persistence worker stopping");
                            break;
                        }

                        _ = ticker.tick() => {
                            self.run_cycle().await;
                        }
                    }
                }
            }
        });

        PersistHandle { token, handle }
    }
}
