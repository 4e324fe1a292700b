//! Bounded maintenance run history
//!
//! Diagnostics only; nothing reads it back for correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

use super::tiers::TierName;
use crate::backend::KeyValueStore;
use crate::sync::stable_key::StableKey;
use crate::types::error::Result;

pub const HISTORY_KEY: &str = "maintenance.history";

/// What a maintenance run changed for one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionAction {
    /// Live but missing from the index; queued for indexing
    Indexed,
    /// Indexed but no longer resolves; removed
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub key: StableKey,
    pub action: CorrectionAction,
    pub subject: Option<String>,
}

/// Outcome of the bounded compaction loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionSummary {
    pub steps: u32,
    pub total_changes: u64,
    pub converged: bool,
    pub size_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceRunRecord {
    pub tier: TierName,
    pub timestamp: DateTime<Utc>,
    pub scanned: usize,
    pub corrected_indexed: usize,
    pub corrected_removed: usize,
    pub skipped: usize,
    pub corrections: Vec<Correction>,
    #[serde(default)]
    pub compaction: Option<CompactionSummary>,
    /// Phases that failed and yielded partial results
    #[serde(default)]
    pub errors: Vec<String>,
}

impl MaintenanceRunRecord {
    pub fn new(tier: TierName, timestamp: DateTime<Utc>) -> Self {
        Self {
            tier,
            timestamp,
            scanned: 0,
            corrected_indexed: 0,
            corrected_removed: 0,
            skipped: 0,
            corrections: Vec::new(),
            compaction: None,
            errors: Vec::new(),
        }
    }

    /// Record a correction detail unless the sample is already full
    pub fn sample_correction(&mut self, correction: Correction, cap: usize) {
        if self.corrections.len() < cap {
            self.corrections.push(correction);
        }
    }
}

/// Fixed-capacity ring buffer of run records, oldest evicted first
#[derive(Debug, Clone)]
pub struct MaintenanceHistory {
    records: VecDeque<MaintenanceRunRecord>,
    capacity: usize,
}

impl MaintenanceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Load the persisted history; a corrupt blob starts a fresh buffer
    pub fn load(store: &dyn KeyValueStore, capacity: usize) -> Result<Self> {
        let mut history = Self::new(capacity);

        if let Some(json) = store.get(HISTORY_KEY)? {
            match serde_json::from_str::<Vec<MaintenanceRunRecord>>(&json) {
                Ok(records) => {
                    for record in records {
                        history.push(record);
                    }
                }
                Err(e) => warn!("Discarding unreadable maintenance history: {}", e),
            }
        }

        Ok(history)
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        let json = serde_json::to_string(&self.records)?;
        store.set(HISTORY_KEY, &json)
    }

    pub fn push(&mut self, record: MaintenanceRunRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records, oldest first
    pub fn records(&self) -> Vec<MaintenanceRunRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteKvStore;
    use chrono::TimeZone;

    fn record(minute: u32) -> MaintenanceRunRecord {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap();
        MaintenanceRunRecord::new(TierName::Hourly, ts)
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut history = MaintenanceHistory::new(3);
        for minute in 0..5 {
            history.push(record(minute));
        }

        let records = history.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].timestamp, record(2).timestamp);
        assert_eq!(records[2].timestamp, record(4).timestamp);
    }

    #[test]
    fn test_persist_and_reload() {
        let store = SqliteKvStore::in_memory().unwrap();
        let mut history = MaintenanceHistory::new(5);
        history.push(record(1));
        history.push(record(2));
        history.save(&store).unwrap();

        // Reloading into a smaller buffer keeps the newest
        let reloaded = MaintenanceHistory::load(&store, 1).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.records()[0].timestamp, record(2).timestamp);
    }

    #[test]
    fn test_corrupt_history_discarded() {
        let store = SqliteKvStore::in_memory().unwrap();
        store.set(HISTORY_KEY, "not json").unwrap();

        let history = MaintenanceHistory::load(&store, 5).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_correction_sample_capped() {
        let mut run = record(0);
        let key = StableKey::from_parts("INBOX", "a@example.com").unwrap();
        for _ in 0..10 {
            run.sample_correction(
                Correction {
                    key: key.clone(),
                    action: CorrectionAction::Removed,
                    subject: None,
                },
                3,
            );
        }
        assert_eq!(run.corrections.len(), 3);
    }
}
