//! Maintenance scan of a tier's lookback window
//!
//! Four phases, each chunked and each allowed to fail on its own:
//!
//! 1. Re-index: live messages in the window the engine does not hold are
//!    queued as `New`, so they go through the verified batch pipeline.
//! 2. Query: cursor-paginate engine entries in the window, newest first.
//! 3. Validate: resolve every candidate in its container, a sub-batch at a
//!    time, pinging the engine between sub-batches to keep it connected.
//! 4. Remove: delete candidates that no longer resolve.
//!
//! A failed phase is recorded on the run record and the scan moves on with
//! whatever the earlier phases produced.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::history::{Correction, CorrectionAction, MaintenanceRunRecord};
use super::tiers::MaintenanceTier;
use crate::backend::{Clock, MessageStore, SearchEngine};
use crate::config::SyncConfig;
use crate::sync::pending_queue::{PendingMeta, PendingQueue, UpdateKind};
use crate::sync::stable_key::{derive_key, StableKey};
use crate::types::error::Result;
use crate::types::{EngineEntry, HeaderRow};

/// Chunk sizes for the scan phases
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub query_page_size: usize,
    pub query_cap: Option<usize>,
    pub validate_batch_size: usize,
    pub remove_batch_size: usize,
    pub reindex_page_size: usize,
    pub correction_sample_cap: usize,
}

impl From<&SyncConfig> for ScanLimits {
    fn from(config: &SyncConfig) -> Self {
        Self {
            query_page_size: config.query_page_size,
            query_cap: config.query_cap,
            validate_batch_size: config.validate_batch_size,
            remove_batch_size: config.remove_batch_size,
            reindex_page_size: config.reindex_page_size,
            correction_sample_cap: config.correction_sample_cap,
        }
    }
}

pub struct MaintenanceScan<'a> {
    pub store: &'a dyn MessageStore,
    pub engine: &'a dyn SearchEngine,
    pub queue: &'a PendingQueue,
    pub clock: &'a dyn Clock,
    pub limits: ScanLimits,
}

impl MaintenanceScan<'_> {
    /// Scan the tier's window, filling `record` as phases complete
    pub async fn run(&self, tier: &MaintenanceTier, record: &mut MaintenanceRunRecord) {
        let (start, end) = tier.lookback_range(self.clock.now());
        info!(
            "Maintenance scan for tier {} over {} .. {}",
            tier.name.as_str(),
            start,
            end
        );

        if let Err(e) = self.reindex_window(start, end, record).await {
            warn!("Re-index phase failed: {}", e);
            record.errors.push(format!("reindex: {}", e));
        }

        let mut candidates = Vec::new();
        if let Err(e) = self.query_candidates(start, end, &mut candidates).await {
            warn!(
                "Query phase failed after {} candidates: {}",
                candidates.len(),
                e
            );
            record.errors.push(format!("query: {}", e));
        }
        record.scanned += candidates.len();

        let missing = self.validate(&candidates, record).await;

        if let Err(e) = self.remove_missing(&missing, record).await {
            warn!("Remove phase failed: {}", e);
            record.errors.push(format!("remove: {}", e));
        }

        info!(
            "Maintenance scan for tier {} done: {} scanned, {} queued for indexing, {} removed, {} skipped",
            tier.name.as_str(),
            record.scanned,
            record.corrected_indexed,
            record.corrected_removed,
            record.skipped
        );
    }

    /// Queue live messages in the window that the engine does not hold
    pub(crate) async fn reindex_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        record: &mut MaintenanceRunRecord,
    ) -> Result<()> {
        let page_size = self.limits.reindex_page_size;
        let mut offset = 0;

        loop {
            let page = self
                .store
                .list_in_range(start, end, offset, page_size)
                .await?;
            let page_len = page.len();
            offset += page_len;
            record.scanned += page_len;

            let mut headers = Vec::with_capacity(page_len);
            let mut metas = Vec::with_capacity(page_len);
            for doc in &page {
                match derive_key(doc, self.store).await {
                    Ok(key) => {
                        headers.push(HeaderRow::from_document(key, doc));
                        metas.push(PendingMeta::from_document(doc));
                    }
                    Err(e) => {
                        debug!("Skipping unkeyable message: {}", e);
                        record.skipped += 1;
                    }
                }
            }

            if !headers.is_empty() {
                let keys: Vec<StableKey> = headers.iter().map(|h| h.key.clone()).collect();
                let new_keys: HashSet<StableKey> = self
                    .engine
                    .filter_new_keys(headers)
                    .await?
                    .into_iter()
                    .collect();

                for (key, meta) in keys.into_iter().zip(metas) {
                    if !new_keys.contains(&key) {
                        continue;
                    }
                    // Don't clobber a mutation the host already reported
                    if self.queue.get(&key).await.is_some() {
                        continue;
                    }
                    let subject = meta.subject.clone();
                    self.queue
                        .enqueue_key(UpdateKind::New, key.clone(), meta, false, self.clock.now())
                        .await;
                    record.corrected_indexed += 1;
                    record.sample_correction(
                        Correction {
                            key,
                            action: CorrectionAction::Indexed,
                            subject,
                        },
                        self.limits.correction_sample_cap,
                    );
                }
            }

            if page_len < page_size {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    /// Collect engine entries in `[start, end]`, newest first, deduped by key.
    ///
    /// The cursor end stays inclusive at the oldest date seen, so entries
    /// sharing that date with the page boundary are picked up by the next
    /// page. Only a page with nothing unseen steps the cursor one
    /// millisecond past the boundary.
    pub(crate) async fn query_candidates(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        out: &mut Vec<EngineEntry>,
    ) -> Result<()> {
        let page_size = self.limits.query_page_size;
        let mut seen: HashSet<StableKey> = out.iter().map(|e| e.key.clone()).collect();
        let mut cursor = end;

        loop {
            let page = self
                .engine
                .query_by_date_range(start, cursor, page_size)
                .await?;
            let page_len = page.len();
            let Some(oldest) = page.iter().map(|e| e.date).min() else {
                return Ok(());
            };

            let mut fresh = 0;
            for entry in page {
                if !seen.insert(entry.key.clone()) {
                    continue;
                }
                out.push(entry);
                fresh += 1;

                if self.limits.query_cap.is_some_and(|cap| out.len() >= cap) {
                    debug!("Query cap reached at {} candidates", out.len());
                    return Ok(());
                }
            }

            if page_len < page_size {
                return Ok(());
            }

            cursor = if fresh == 0 {
                oldest - Duration::milliseconds(1)
            } else {
                oldest
            };
            if cursor < start {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    /// Candidates that no longer resolve in their container
    pub(crate) async fn validate(
        &self,
        candidates: &[EngineEntry],
        record: &mut MaintenanceRunRecord,
    ) -> Vec<EngineEntry> {
        let mut missing = Vec::new();

        for chunk in candidates.chunks(self.limits.validate_batch_size) {
            for entry in chunk {
                let doc_ref = match entry.key.to_ref() {
                    Ok(doc_ref) => doc_ref,
                    Err(e) => {
                        warn!("Unparseable key in index, removing: {}", e);
                        missing.push(entry.clone());
                        continue;
                    }
                };

                match self.store.resolve(&doc_ref).await {
                    Ok(Some(_)) => {}
                    Ok(None) => missing.push(entry.clone()),
                    Err(e) => {
                        // Unknown is not missing; leave it for the next run
                        debug!("Could not validate {}: {}", entry.key, e);
                        record.skipped += 1;
                    }
                }
            }

            if let Err(e) = self.engine.stats().await {
                debug!("Engine keepalive failed: {}", e);
            }
        }

        missing
    }

    pub(crate) async fn remove_missing(
        &self,
        missing: &[EngineEntry],
        record: &mut MaintenanceRunRecord,
    ) -> Result<()> {
        for chunk in missing.chunks(self.limits.remove_batch_size) {
            let keys = chunk.iter().map(|e| e.key.clone()).collect();
            self.engine.remove_batch(keys).await?;

            record.corrected_removed += chunk.len();
            for entry in chunk {
                record.sample_correction(
                    Correction {
                        key: entry.key.clone(),
                        action: CorrectionAction::Removed,
                        subject: entry.subject.clone(),
                    },
                    self.limits.correction_sample_cap,
                );
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}
