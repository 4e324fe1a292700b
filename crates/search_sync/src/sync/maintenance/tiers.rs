//! Maintenance tiers
//!
//! Four fixed scopes, narrowest to widest. The derive order on `TierName`
//! is the scope order: a tier covers itself and every tier before it.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::types::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl TierName {
    /// All tiers, narrowest first
    pub const ALL: [TierName; 4] = [
        TierName::Hourly,
        TierName::Daily,
        TierName::Weekly,
        TierName::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Whether completing `self` also completes `other`
    pub fn covers(&self, other: TierName) -> bool {
        other <= *self
    }
}

/// Day-of-week / hour window a tier may only start in (local time)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub weekday: Weekday,
    /// Inclusive
    pub start_hour: u32,
    /// Exclusive
    pub end_hour: u32,
}

impl ScheduleWindow {
    pub fn contains(&self, local: NaiveDateTime) -> bool {
        local.weekday() == self.weekday
            && local.hour() >= self.start_hour
            && local.hour() < self.end_hour
    }
}

/// One maintenance scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceTier {
    pub name: TierName,
    pub interval_minutes: u32,
    /// Days re-scanned; `None` scans the whole mailbox
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub window: Option<ScheduleWindow>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl MaintenanceTier {
    pub fn defaults() -> Vec<MaintenanceTier> {
        vec![
            MaintenanceTier {
                name: TierName::Hourly,
                interval_minutes: 60,
                lookback_days: Some(1),
                window: None,
                enabled: true,
            },
            MaintenanceTier {
                name: TierName::Daily,
                interval_minutes: 24 * 60,
                lookback_days: Some(3),
                window: None,
                enabled: true,
            },
            MaintenanceTier {
                name: TierName::Weekly,
                interval_minutes: 7 * 24 * 60,
                lookback_days: Some(30),
                window: Some(ScheduleWindow {
                    weekday: Weekday::Sun,
                    start_hour: 1,
                    end_hour: 5,
                }),
                enabled: true,
            },
            MaintenanceTier {
                name: TierName::Monthly,
                interval_minutes: 30 * 24 * 60,
                lookback_days: None,
                window: None,
                enabled: true,
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_minutes == 0 {
            return Err(SyncError::ConfigInvalid(format!(
                "Tier {} has a zero interval",
                self.name.as_str()
            )));
        }
        if self.lookback_days == Some(0) {
            return Err(SyncError::ConfigInvalid(format!(
                "Tier {} has a zero lookback",
                self.name.as_str()
            )));
        }
        if let Some(window) = &self.window {
            if window.start_hour >= window.end_hour || window.end_hour > 24 {
                return Err(SyncError::ConfigInvalid(format!(
                    "Tier {} has an empty or out of range window {}..{}",
                    self.name.as_str(),
                    window.start_hour,
                    window.end_hour
                )));
            }
        }
        Ok(())
    }

    /// Due-ness against the host's local wall clock
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.is_due_at(last_run, now, now.with_timezone(&Local).naive_local())
    }

    /// Due-ness with an explicit local time for the window check
    pub fn is_due_at(
        &self,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        local_now: NaiveDateTime,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(window) = &self.window {
            if !window.contains(local_now) {
                return false;
            }
        }

        match last_run {
            None => true,
            Some(last) => now - last >= Duration::minutes(i64::from(self.interval_minutes)),
        }
    }

    /// Date range re-scanned by this tier
    pub fn lookback_range(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = match self.lookback_days {
            Some(days) => now - Duration::days(i64::from(days)),
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        (start, now)
    }
}
