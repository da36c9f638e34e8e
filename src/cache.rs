//! Concurrency-safe latest-value cache
//!
//! One sample per tag, last write wins. Entries are replaced wholesale so a
//! concurrent reader can never observe a sample whose value, unit and
//! timestamp come from different updates. Backed by DashMap for lock-free
//! concurrent access from the notification, persistence and HTTP paths.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latest known value for a tag
///
/// `value` is absent when the last read or conversion failed. The timestamp
/// is the gateway-local capture instant, not the protocol server clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: Option<f64>,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: Option<f64>, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Store of the single latest sample per tag name
#[derive(Default)]
pub struct ValueCache {
    entries: DashMap<String, Sample>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Upsert the sample for a tag (whole-entry atomic replace)
    pub fn set(&self, tag: &str, sample: Sample) {
        self.entries.insert(tag.to_string(), sample);
    }

    /// Get a copy of the current sample for a tag
    pub fn get(&self, tag: &str) -> Option<Sample> {
        self.entries.get(tag).map(|e| e.clone())
    }

    /// Point-in-time copy of all entries
    ///
    /// Each entry is internally consistent; entries for different tags may
    /// reflect different update instants, which is fine for a system that
    /// records current state rather than transactions.
    pub fn snapshot(&self) -> HashMap<String, Sample> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
