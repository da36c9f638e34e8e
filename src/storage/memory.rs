//! In-memory storage backend
//!
//! Keeps batches and audit events in plain vectors, with switches to force
//! connect or insert failures. Used by the test suite to exercise the
//! persistence worker and the reconnect supervisor without a database.

use super::{HistoryRow, PersistenceBatch, Severity, Storage};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One recorded audit event
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub category: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Default)]
pub struct MemoryStorage {
    connected: AtomicBool,
    fail_connects: AtomicBool,
    fail_inserts: AtomicBool,
    mapping: RwLock<HashMap<String, String>>,
    mapping_loads: AtomicU64,
    batches: Mutex<Vec<PersistenceBatch>>,
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mapping table contents (simulates operator edits)
    pub fn set_mapping(&self, mapping: HashMap<String, String>) {
        *self.mapping.write() = mapping;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// How many times the mapping table has been loaded
    pub fn mapping_load_count(&self) -> u64 {
        self.mapping_loads.load(Ordering::SeqCst)
    }

    pub fn insert_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn batches(&self) -> Vec<PersistenceBatch> {
        self.batches.lock().clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    fn require_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::StorageDisconnected)
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self) -> Result<()> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(GatewayError::StorageConnection(
                "simulated connect failure".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn load_mapping(&self) -> Result<HashMap<String, String>> {
        self.require_connected()?;
        self.mapping_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.mapping.read().clone())
    }

    async fn insert_batch(&self, batch: &PersistenceBatch) -> Result<()> {
        self.require_connected()?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(GatewayError::PersistenceCycle(
                "simulated insert failure".to_string(),
            ));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    async fn log_event(&self, category: &str, message: &str, severity: Severity) -> Result<()> {
        self.require_connected()?;
        self.events.lock().push(RecordedEvent {
            category: category.to_string(),
            message: message.to_string(),
            severity,
        });
        Ok(())
    }

    async fn query_history(
        &self,
        column: &str,
        window_hours: i64,
        max_rows: i64,
    ) -> Result<Vec<HistoryRow>> {
        self.require_connected()?;
        let cutoff = Utc::now() - ChronoDuration::hours(window_hours.max(1));

        let mut rows: Vec<HistoryRow> = self
            .batches
            .lock()
            .iter()
            .filter(|b| b.captured_at >= cutoff)
            .filter_map(|b| {
                b.columns
                    .iter()
                    .find(|(c, _)| c == column)
                    .map(|(_, v)| HistoryRow {
                        value: *v,
                        timestamp: b.captured_at,
                    })
            })
            .collect();

        rows.sort_by_key(|r| r.timestamp);
        rows.truncate(max_rows.max(0) as usize);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(columns: Vec<(&str, f64)>) -> PersistenceBatch {
        PersistenceBatch {
            captured_at: Utc::now(),
            columns: columns
                .into_iter()
                .map(|(c, v)| (c.to_string(), v))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let storage = MemoryStorage::new();
        assert!(storage.load_mapping().await.is_err());
        assert!(storage.insert_batch(&batch(vec![("a", 1.0)])).await.is_err());
        assert!(storage.query_history("a", 24, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_insert_failure_injection() {
        let storage = MemoryStorage::new();
        storage.connect().await.unwrap();

        storage.fail_inserts(true);
        assert!(storage.insert_batch(&batch(vec![("a", 1.0)])).await.is_err());
        assert_eq!(storage.insert_count(), 0);

        storage.fail_inserts(false);
        storage
            .insert_batch(&batch(vec![("a", 1.0)]))
            .await
            .unwrap();
        assert_eq!(storage.insert_count(), 1);
    }

    #[tokio::test]
    async fn test_history_filters_by_column() {
        let storage = MemoryStorage::new();
        storage.connect().await.unwrap();

        storage
            .insert_batch(&batch(vec![("temp_inlet", 23.46), ("flow_main", 5.0)]))
            .await
            .unwrap();
        storage
            .insert_batch(&batch(vec![("flow_main", 6.0)]))
            .await
            .unwrap();

        let rows = storage.query_history("flow_main", 24, 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 5.0);

        let rows = storage.query_history("temp_inlet", 24, 100).await.unwrap();
        assert_eq!(rows.len(), 1);

        let rows = storage.query_history("missing", 24, 100).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_history_respects_limit() {
        let storage = MemoryStorage::new();
        storage.connect().await.unwrap();

        for i in 0..5 {
            storage
                .insert_batch(&batch(vec![("temp_inlet", i as f64)]))
                .await
                .unwrap();
        }

        let rows = storage.query_history("temp_inlet", 24, 3).await.unwrap();
        assert_eq!(rows.len(), 3);
    }
}
