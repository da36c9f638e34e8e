//! Storage boundary
//!
//! The core only needs "insert one wide row", "query a range", an audit
//! event sink, and the tag-to-column mapping table. Driver mechanics live
//! behind the [`Storage`] trait: `SqliteStorage` is the production backend,
//! `MemoryStorage` the in-memory backend for tests.

pub mod memory;
pub mod sqlite;

use crate::error::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Severity of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Column names must be identifier-shaped before they may appear in SQL
///
/// The insert and history statements interpolate column names (the column
/// set is dynamic), so only names validated here ever reach them; values
/// are always bound as parameters.
pub fn is_valid_column(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Tag-name to storage-column mapping
///
/// Loaded once per storage connection and refreshed on reconnect. The map
/// is rebuilt wholesale and swapped in atomically, so concurrent readers
/// never observe a partially built mapping.
pub struct ColumnMapping {
    inner: ArcSwap<HashMap<String, String>>,
}

impl ColumnMapping {
    pub fn empty() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Swap in a freshly loaded mapping, dropping invalid column names
    pub fn replace(&self, mapping: HashMap<String, String>) {
        let filtered: HashMap<String, String> = mapping
            .into_iter()
            .filter(|(tag, column)| {
                if is_valid_column(column) {
                    true
                } else {
                    warn!(tag = %tag, column = %column, "rejecting non-identifier column name");
                    false
                }
            })
            .collect();
        self.inner.store(Arc::new(filtered));
    }

    pub fn column_for(&self, tag: &str) -> Option<String> {
        self.inner.load().get(tag).cloned()
    }

    /// Current mapping contents (cheap atomic pointer load)
    pub fn current(&self) -> Arc<HashMap<String, String>> {
        self.inner.load_full()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self::empty()
    }
}

/// One persistence cycle's projection of the cache: ordered
/// `(column, value)` pairs plus the capture timestamp. Built per tick,
/// never retained.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceBatch {
    pub captured_at: DateTime<Utc>,
    pub columns: Vec<(String, f64)>,
}

impl PersistenceBatch {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One row returned by a history query
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Storage backend session
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Load the tag-to-column mapping table
    async fn load_mapping(&self) -> Result<HashMap<String, String>>;

    /// Insert one wide row covering the batch's columns
    async fn insert_batch(&self, batch: &PersistenceBatch) -> Result<()>;

    /// Append one lifecycle/error event to the audit table
    async fn log_event(&self, category: &str, message: &str, severity: Severity) -> Result<()>;

    /// Rows for one column inside the trailing window, oldest first
    async fn query_history(
        &self,
        column: &str,
        window_hours: i64,
        max_rows: i64,
    ) -> Result<Vec<HistoryRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_column() {
        assert!(is_valid_column("temp_inlet"));
        assert!(is_valid_column("_x1"));
        assert!(is_valid_column("T1"));
        assert!(!is_valid_column(""));
        assert!(!is_valid_column("1temp"));
        assert!(!is_valid_column("temp-inlet"));
        assert!(!is_valid_column("temp; DROP TABLE process_data"));
    }

    #[test]
    fn test_mapping_replace_filters_invalid() {
        let mapping = ColumnMapping::empty();
        mapping.replace(HashMap::from([
            ("Temp1".to_string(), "temp_inlet".to_string()),
            ("Evil".to_string(), "x; DROP TABLE".to_string()),
        ]));

        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.column_for("Temp1").unwrap(), "temp_inlet");
        assert!(mapping.column_for("Evil").is_none());
    }

    #[test]
    fn test_mapping_swap_is_wholesale() {
        let mapping = ColumnMapping::empty();
        mapping.replace(HashMap::from([(
            "Temp1".to_string(),
            "temp_inlet".to_string(),
        )]));

        let before = mapping.current();

        mapping.replace(HashMap::from([(
            "Flow1".to_string(),
            "flow_main".to_string(),
        )]));

        // The old snapshot is untouched; the live view is the new map only
        assert!(before.contains_key("Temp1"));
        assert!(mapping.column_for("Temp1").is_none());
        assert_eq!(mapping.column_for("Flow1").unwrap(), "flow_main");
    }
}
