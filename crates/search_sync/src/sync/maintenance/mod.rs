//! Periodic index maintenance
//!
//! A single tick alarm asks the scheduler for the widest due tier, scans
//! that tier's lookback window, compacts the index in bounded steps and
//! appends one record to the run history.

pub mod compaction;
pub mod history;
pub mod scan;
pub mod scheduler;
pub mod tiers;

pub use history::{MaintenanceHistory, MaintenanceRunRecord};
pub use scheduler::{MaintenanceScheduler, TierStatus, LEGACY_ALARMS, TICK_ALARM};
pub use tiers::{MaintenanceTier, TierName};
