//! Maintenance tick scheduling
//!
//! One recurring alarm drives all tiers. Each tick picks at most one due
//! tier, widest scope first. Completing a tier stamps it and every tier it
//! covers, so a monthly run is not followed by an immediate daily run.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::tiers::{MaintenanceTier, TierName};
use crate::backend::KeyValueStore;
use crate::types::error::{Result, SyncError};

/// The single tick alarm
pub const TICK_ALARM: &str = "search-maintenance-tick";

/// Per-tier alarms registered by older releases
pub const LEGACY_ALARMS: &[&str] = &[
    "search-maintenance-hourly",
    "search-maintenance-daily",
    "search-maintenance-weekly",
    "search-maintenance-monthly",
    "search-reindex",
];

/// Tier state for the status surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierStatus {
    pub name: TierName,
    pub enabled: bool,
    pub interval_minutes: u32,
    pub lookback_days: Option<u32>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub due: bool,
    /// Set when this tier's settings or stored overrides are malformed
    pub config_error: Option<String>,
}

pub struct MaintenanceScheduler {
    tiers: Vec<MaintenanceTier>,
    store: Arc<dyn KeyValueStore>,
}

impl MaintenanceScheduler {
    pub fn new(tiers: Vec<MaintenanceTier>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { tiers, store }
    }

    fn last_run_key(name: TierName) -> String {
        format!("maintenance.{}.last_run_at", name.as_str())
    }

    fn enabled_key(name: TierName) -> String {
        format!("maintenance.{}.enabled", name.as_str())
    }

    fn interval_key(name: TierName) -> String {
        format!("maintenance.{}.interval_minutes", name.as_str())
    }

    /// Last completed run of a tier (own run or coverage)
    pub fn last_run_at(&self, name: TierName) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get(&Self::last_run_key(name))? else {
            return Ok(None);
        };

        match raw.trim().parse::<i64>().ok().and_then(DateTime::from_timestamp_millis) {
            Some(at) => Ok(Some(at)),
            None => {
                warn!(
                    "Unreadable last run stamp for tier {}: {:?}, treating as never run",
                    name.as_str(),
                    raw
                );
                Ok(None)
            }
        }
    }

    /// Store a last-run stamp; never moves a stamp backwards
    pub fn set_last_run_at(&self, name: TierName, at: DateTime<Utc>) -> Result<bool> {
        if let Some(existing) = self.last_run_at(name)? {
            if existing >= at {
                debug!(
                    "Keeping newer last run stamp for tier {} ({} >= {})",
                    name.as_str(),
                    existing,
                    at
                );
                return Ok(false);
            }
        }

        self.store
            .set(&Self::last_run_key(name), &at.timestamp_millis().to_string())?;
        Ok(true)
    }

    /// Persist a per-tier enable/interval override
    pub fn set_override(
        &self,
        name: TierName,
        enabled: Option<bool>,
        interval_minutes: Option<u32>,
    ) -> Result<()> {
        if let Some(enabled) = enabled {
            self.store.set(&Self::enabled_key(name), &enabled.to_string())?;
        }
        if let Some(interval) = interval_minutes {
            self.store.set(&Self::interval_key(name), &interval.to_string())?;
        }
        Ok(())
    }

    /// Apply stored overrides to a configured tier
    pub fn effective_tier(&self, tier: &MaintenanceTier) -> Result<MaintenanceTier> {
        let mut effective = tier.clone();

        if let Some(raw) = self.store.get(&Self::enabled_key(tier.name))? {
            effective.enabled = raw.trim().parse::<bool>().map_err(|_| {
                SyncError::ConfigInvalid(format!(
                    "Tier {} enabled flag is not a boolean: {:?}",
                    tier.name.as_str(),
                    raw
                ))
            })?;
        }

        if let Some(raw) = self.store.get(&Self::interval_key(tier.name))? {
            effective.interval_minutes = raw.trim().parse::<u32>().map_err(|_| {
                SyncError::ConfigInvalid(format!(
                    "Tier {} interval is not a number of minutes: {:?}",
                    tier.name.as_str(),
                    raw
                ))
            })?;
        }

        effective.validate()?;
        Ok(effective)
    }

    /// Pick the widest due tier, evaluating the window in host local time
    pub fn select_due(&self, now: DateTime<Utc>) -> Result<Option<MaintenanceTier>> {
        self.select_due_at(now, now.with_timezone(&Local).naive_local())
    }

    pub fn select_due_at(
        &self,
        now: DateTime<Utc>,
        local_now: NaiveDateTime,
    ) -> Result<Option<MaintenanceTier>> {
        let mut widest_first: Vec<&MaintenanceTier> = self.tiers.iter().collect();
        widest_first.sort_by(|a, b| b.name.cmp(&a.name));

        for configured in widest_first {
            let tier = match self.effective_tier(configured) {
                Ok(tier) => tier,
                Err(e) => {
                    warn!("Skipping tier {}: {}", configured.name.as_str(), e);
                    continue;
                }
            };

            let last_run = self.last_run_at(tier.name)?;
            if tier.is_due_at(last_run, now, local_now) {
                debug!(
                    "Tier {} is due (last run: {:?})",
                    tier.name.as_str(),
                    last_run
                );
                return Ok(Some(tier));
            }
        }

        Ok(None)
    }

    /// Stamp `completed` and every configured tier it covers
    pub fn apply_coverage(&self, completed: TierName, now: DateTime<Utc>) -> Result<Vec<TierName>> {
        let mut stamped = Vec::new();

        for tier in &self.tiers {
            if completed.covers(tier.name) {
                self.set_last_run_at(tier.name, now)?;
                stamped.push(tier.name);
            }
        }

        info!(
            "Maintenance tier {} complete, coverage applied to {:?}",
            completed.as_str(),
            stamped
        );
        Ok(stamped)
    }

    pub fn tier_statuses(&self, now: DateTime<Utc>) -> Result<Vec<TierStatus>> {
        let local_now = now.with_timezone(&Local).naive_local();
        let mut statuses = Vec::with_capacity(self.tiers.len());

        for configured in &self.tiers {
            let last_run_at = self.last_run_at(configured.name)?;
            let status = match self.effective_tier(configured) {
                Ok(tier) => TierStatus {
                    name: tier.name,
                    enabled: tier.enabled,
                    interval_minutes: tier.interval_minutes,
                    lookback_days: tier.lookback_days,
                    last_run_at,
                    due: tier.is_due_at(last_run_at, now, local_now),
                    config_error: None,
                },
                Err(e) => TierStatus {
                    name: configured.name,
                    enabled: false,
                    interval_minutes: configured.interval_minutes,
                    lookback_days: configured.lookback_days,
                    last_run_at,
                    due: false,
                    config_error: Some(e.to_string()),
                },
            };
            statuses.push(status);
        }

        Ok(statuses)
    }
}
