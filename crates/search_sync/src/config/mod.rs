use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::sync::maintenance::tiers::MaintenanceTier;
use crate::types::error::{Result, SyncError};

/// Indexer configuration
///
/// Every field has a default, so a TOML file only needs the values it
/// wants to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Key-value database file path
    pub db_path: PathBuf,

    /// Max queue entries handled per batch run
    pub batch_size: usize,
    /// Debounce before a batch run after an enqueue
    pub batch_debounce_ms: u64,
    /// Debounce before the queue snapshot is written
    pub persist_debounce_ms: u64,
    /// Delay before the next batch after a failed run
    pub error_backoff_ms: u64,
    /// Consecutive zero-progress runs before failed entries are dropped
    pub max_consecutive_no_progress: u32,
    /// Best-effort cap on persisted snapshot entries
    pub snapshot_cap: usize,

    /// Period of the single maintenance tick alarm
    pub tick_interval_minutes: u32,
    /// Cleanup query page size
    pub query_page_size: usize,
    /// Optional cap on candidates collected by the cleanup query
    pub query_cap: Option<usize>,
    /// Candidates resolved per validation sub-batch
    pub validate_batch_size: usize,
    /// Keys removed per removal sub-batch
    pub remove_batch_size: usize,
    /// Live documents fetched per page while re-indexing a tier window
    pub reindex_page_size: usize,
    pub compaction: CompactionConfig,
    /// Run history ring buffer capacity
    pub history_capacity: usize,
    /// Max correction details kept per run record
    pub correction_sample_cap: usize,
    /// Tier table, narrowest scope first
    pub tiers: Vec<MaintenanceTier>,
}

/// Bounded compaction budget
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Pages merged per step
    pub page_budget: u32,
    /// Wall-clock budget per step
    pub step_time_ms: u64,
    /// Steps per maintenance run; the rest waits for the next run
    pub max_steps: u32,
    /// A step changing this many entries or fewer counts as converged
    pub negligible_changes: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            page_budget: 64,
            step_time_ms: 250,
            max_steps: 4,
            negligible_changes: 1,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            batch_size: 50,
            batch_debounce_ms: 2_000,
            persist_debounce_ms: 1_000,
            error_backoff_ms: 60_000,
            max_consecutive_no_progress: 5,
            snapshot_cap: 10_000,
            tick_interval_minutes: 15,
            query_page_size: 200,
            query_cap: None,
            validate_batch_size: 25,
            remove_batch_size: 50,
            reindex_page_size: 200,
            compaction: CompactionConfig::default(),
            history_capacity: 20,
            correction_sample_cap: 25,
            tiers: MaintenanceTier::defaults(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!("Loaded indexer config from {:?}", path);
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the queue
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("batch_size", self.batch_size),
            ("query_page_size", self.query_page_size),
            ("validate_batch_size", self.validate_batch_size),
            ("remove_batch_size", self.remove_batch_size),
            ("reindex_page_size", self.reindex_page_size),
            ("history_capacity", self.history_capacity),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(SyncError::ConfigInvalid(format!("{} must be non-zero", name)));
            }
        }

        if self.max_consecutive_no_progress == 0 {
            return Err(SyncError::ConfigInvalid(
                "max_consecutive_no_progress must be non-zero".to_string(),
            ));
        }
        if self.tick_interval_minutes == 0 {
            return Err(SyncError::ConfigInvalid(
                "tick_interval_minutes must be non-zero".to_string(),
            ));
        }
        if self.tiers.is_empty() {
            return Err(SyncError::ConfigInvalid("No maintenance tiers configured".to_string()));
        }
        // A malformed tier is skipped by the scheduler, the rest still runs
        for tier in &self.tiers {
            if let Err(e) = tier.validate() {
                warn!("Tier {} will be skipped: {}", tier.name.as_str(), e);
            }
        }

        Ok(())
    }

    pub fn batch_debounce(&self) -> Duration {
        Duration::from_millis(self.batch_debounce_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// Default database location under the platform data directory
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eddie.chat")
        .join("search")
        .join("search_sync.db")
}
