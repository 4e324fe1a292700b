//! In-process alarm host
//!
//! Desktop hosts hand us a real alarm facility. When running standalone,
//! `TokioAlarms` stands in: every registered alarm is a polling loop that
//! sends its name over a channel each period.

use async_trait::async_trait;
use flume::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::AlarmHost;
use crate::types::error::{Result, SyncError};

/// Alarm host backed by tokio interval loops
pub struct TokioAlarms {
    alarms: Mutex<HashMap<String, JoinHandle<()>>>,
    fired_tx: Sender<String>,
}

impl TokioAlarms {
    /// Create the alarm host and the receiver on which alarm names arrive
    pub fn new() -> (Self, Receiver<String>) {
        let (tx, rx) = flume::unbounded();
        let alarms = Self {
            alarms: Mutex::new(HashMap::new()),
            fired_tx: tx,
        };
        (alarms, rx)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>>> {
        self.alarms
            .lock()
            .map_err(|_| SyncError::Other("Alarm table lock poisoned".to_string()))
    }
}

#[async_trait]
impl AlarmHost for TokioAlarms {
    async fn alarm_names(&self) -> Result<Vec<String>> {
        let alarms = self.lock()?;
        let mut names: Vec<String> = alarms.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create(&self, name: &str, period_minutes: u32) -> Result<()> {
        if period_minutes == 0 {
            return Err(SyncError::ConfigInvalid(format!(
                "Alarm '{}' needs a non-zero period",
                name
            )));
        }

        let period = tokio::time::Duration::from_secs(u64::from(period_minutes) * 60);
        let tx = self.fired_tx.clone();
        let alarm_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick of a tokio interval completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                debug!("Alarm fired: {}", alarm_name);
                if tx.send(alarm_name.clone()).is_err() {
                    warn!("Alarm receiver dropped, stopping alarm {}", alarm_name);
                    break;
                }
            }
        });

        info!("Registered alarm '{}' every {} minutes", name, period_minutes);

        // Re-registering replaces the previous loop
        if let Some(previous) = self.lock()?.insert(name.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<bool> {
        match self.lock()?.remove(name) {
            Some(handle) => {
                handle.abort();
                info!("Cleared alarm '{}'", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for TokioAlarms {
    fn drop(&mut self) {
        if let Ok(alarms) = self.alarms.get_mut() {
            for (_, handle) in alarms.drain() {
                handle.abort();
            }
        }
    }
}
