//! Batch resolution and indexing pipeline
//!
//! One run takes the oldest queued entries and moves the engine toward the
//! latest known mutation for each key. Nothing leaves the queue unless a
//! read-back against the engine confirms the end state, and even then only
//! if no newer mutation for the key arrived while the run was in flight.
//!
//! An engine error aborts the whole run with nothing dequeued; the caller
//! schedules the retry. Per-entry resolution problems never abort a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

use crate::backend::{Clock, MessageStore, SearchEngine};
use crate::sync::content::extract_text;
use crate::sync::pending_queue::{PendingQueue, PendingUpdate};
use crate::sync::stable_key::StableKey;
use crate::types::error::{Result, SyncError};
use crate::types::{Document, HeaderRow, IndexRow};

/// What a single run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Entries taken from the queue at run start
    pub attempted: usize,
    /// Entries confirmed and removed from the queue
    pub dequeued: usize,
    /// Confirmed, but a newer mutation for the key arrived mid-run
    pub superseded: usize,
    pub removed: usize,
    pub indexed: usize,
    /// Already present in the engine, nothing written
    pub already_indexed: usize,
    pub extraction_failures: usize,
    pub resolution_failures: usize,
    /// Engine reported success but the read-back disagreed
    pub mismatches: usize,
}

impl BatchOutcome {
    /// A run that had work but confirmed none of it
    pub fn made_no_progress(&self) -> bool {
        self.attempted > 0 && self.dequeued == 0
    }
}

/// Borrowed collaborators for one run
pub struct Pipeline<'a> {
    pub queue: &'a PendingQueue,
    pub store: &'a dyn MessageStore,
    pub engine: &'a dyn SearchEngine,
    pub clock: &'a dyn Clock,
}

struct Resolved {
    entry: PendingUpdate,
    doc: Document,
}

impl Pipeline<'_> {
    /// Process up to `batch_size` oldest entries
    pub async fn run(&self, batch_size: usize) -> Result<BatchOutcome> {
        let batch = self.queue.oldest(batch_size).await;
        let mut outcome = BatchOutcome {
            attempted: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(outcome);
        }

        debug!("Processing batch of {} queued updates", batch.len());

        // Stamps are copied here; dequeue compares against them at the end
        let mut processed: Vec<(StableKey, DateTime<Utc>)> = Vec::new();
        let (deletes, updates): (Vec<PendingUpdate>, Vec<PendingUpdate>) =
            batch.into_iter().partition(|e| e.kind.is_delete());

        self.apply_deletes(&deletes, &mut processed, &mut outcome)
            .await?;

        let resolved = self.resolve_all(updates, &mut outcome).await;
        if !resolved.is_empty() {
            let to_write = self.confirm_new(resolved, &mut processed, &mut outcome).await?;
            self.write_documents(to_write, &mut processed, &mut outcome)
                .await?;
        }

        for (key, stamp) in processed {
            if self.queue.dequeue_if_unchanged(&key, stamp).await {
                outcome.dequeued += 1;
            } else {
                outcome.superseded += 1;
            }
        }

        info!(
            "Batch complete: {} dequeued, {} indexed, {} removed, {} superseded, {} unresolved, {} mismatched",
            outcome.dequeued,
            outcome.indexed,
            outcome.removed,
            outcome.superseded,
            outcome.resolution_failures,
            outcome.mismatches
        );
        Ok(outcome)
    }

    async fn apply_deletes(
        &self,
        deletes: &[PendingUpdate],
        processed: &mut Vec<(StableKey, DateTime<Utc>)>,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        if deletes.is_empty() {
            return Ok(());
        }

        let keys: Vec<StableKey> = deletes.iter().map(|e| e.key.clone()).collect();
        self.engine.remove_batch(keys).await?;

        for entry in deletes {
            match self.engine.get_by_key(&entry.key).await? {
                None => {
                    outcome.removed += 1;
                    processed.push((entry.key.clone(), entry.enqueued_at));
                }
                Some(_) => {
                    outcome.mismatches += 1;
                    warn!(
                        "{}",
                        SyncError::VerificationMismatch(format!(
                            "{} still present after remove, keeping it queued",
                            entry.key
                        ))
                    );
                }
            }
        }
        Ok(())
    }

    /// Re-resolve each key to the live document in its own container
    async fn resolve_all(
        &self,
        updates: Vec<PendingUpdate>,
        outcome: &mut BatchOutcome,
    ) -> Vec<Resolved> {
        let mut resolved = Vec::with_capacity(updates.len());

        for entry in updates {
            let doc_ref = match entry.key.to_ref() {
                Ok(doc_ref) => doc_ref,
                Err(e) => {
                    warn!("Unparseable queued key {}: {}", entry.key, e);
                    self.fail(&entry, outcome).await;
                    continue;
                }
            };

            match self.store.resolve(&doc_ref).await {
                Ok(Some(doc)) => {
                    if entry.has_failed {
                        self.queue.clear_failed(&entry.key).await;
                    }
                    resolved.push(Resolved { entry, doc });
                }
                Ok(None) => {
                    debug!(
                        "{}",
                        SyncError::Resolution(format!("{} has no live message", entry.key))
                    );
                    self.fail(&entry, outcome).await;
                }
                Err(e) => {
                    warn!("Resolving {} failed: {}", entry.key, e);
                    self.fail(&entry, outcome).await;
                }
            }
        }

        resolved
    }

    async fn fail(&self, entry: &PendingUpdate, outcome: &mut BatchOutcome) {
        outcome.resolution_failures += 1;
        self.queue.mark_failed(&entry.key, self.clock.now()).await;
    }

    /// Ask the engine which documents are new. A claim of "already indexed"
    /// is checked by direct lookup before it is believed.
    async fn confirm_new(
        &self,
        resolved: Vec<Resolved>,
        processed: &mut Vec<(StableKey, DateTime<Utc>)>,
        outcome: &mut BatchOutcome,
    ) -> Result<Vec<Resolved>> {
        let headers: Vec<HeaderRow> = resolved
            .iter()
            .map(|r| HeaderRow::from_document(r.entry.key.clone(), &r.doc))
            .collect();
        let new_keys: HashSet<StableKey> =
            self.engine.filter_new_keys(headers).await?.into_iter().collect();

        let mut to_write = Vec::new();
        for item in resolved {
            if new_keys.contains(&item.entry.key) || item.entry.reindex {
                to_write.push(item);
                continue;
            }

            match self.engine.get_by_key(&item.entry.key).await? {
                Some(_) => {
                    outcome.already_indexed += 1;
                    processed.push((item.entry.key.clone(), item.entry.enqueued_at));
                }
                None => {
                    warn!(
                        "Engine claimed {} is indexed but it is absent, indexing anyway",
                        item.entry.key
                    );
                    to_write.push(item);
                }
            }
        }

        Ok(to_write)
    }

    /// Fetch and extract bodies, clear out documents whose body cannot be
    /// parsed, then index the rest and read each one back
    async fn write_documents(
        &self,
        items: Vec<Resolved>,
        processed: &mut Vec<(StableKey, DateTime<Utc>)>,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let mut rows = Vec::with_capacity(items.len());
        let mut stamps = Vec::with_capacity(items.len());
        let mut unextractable = Vec::new();

        for Resolved { entry, doc } in items {
            let raw = match self.store.fetch_raw(&doc).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Fetching body of {} failed: {}, keeping it queued", entry.key, e);
                    self.fail(&entry, outcome).await;
                    continue;
                }
            };

            match extract_text(&raw) {
                Ok(body) => {
                    stamps.push((entry.key.clone(), entry.enqueued_at));
                    rows.push(IndexRow {
                        key: entry.key,
                        container: doc.container,
                        subject: doc.subject,
                        author: doc.author,
                        date: doc.date,
                        labels: doc.labels,
                        body,
                    });
                }
                Err(e) => {
                    warn!("Extraction failed for {}: {}, removing from index", entry.key, e);
                    unextractable.push((entry.key, entry.enqueued_at));
                }
            }
        }

        if !unextractable.is_empty() {
            let keys = unextractable.iter().map(|(k, _)| k.clone()).collect();
            self.engine.remove_batch(keys).await?;
            outcome.extraction_failures += unextractable.len();
            processed.extend(unextractable);
        }

        if rows.is_empty() {
            return Ok(());
        }

        self.engine.index_batch(rows).await?;
        for (key, stamp) in stamps {
            if self.engine.get_by_key(&key).await?.is_some() {
                outcome.indexed += 1;
                processed.push((key, stamp));
            } else {
                outcome.mismatches += 1;
                warn!(
                    "{}",
                    SyncError::VerificationMismatch(format!(
                        "{} missing after index, keeping it queued",
                        key
                    ))
                );
            }
        }
        Ok(())
    }
}

/// Counts consecutive runs that dequeued nothing
pub struct NoProgressCounter {
    count: AtomicU32,
    threshold: u32,
}

impl NoProgressCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn value(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Record a finished run. Returns true when the threshold is reached,
    /// in which case the counter is already back at zero.
    pub fn record(&self, outcome: &BatchOutcome) -> bool {
        if !outcome.made_no_progress() {
            self.count.store(0, Ordering::SeqCst);
            return false;
        }

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold {
            self.count.store(0, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// Drop every failing entry once the queue is stuck. Returns what was dropped.
pub async fn drop_stuck_entries(queue: &PendingQueue) -> Vec<PendingUpdate> {
    let dropped = queue.drop_failed().await;
    for entry in &dropped {
        warn!(
            "Dropping stuck entry {} ({:?}, subject {:?}, last failed {:?})",
            entry.key, entry.kind, entry.meta.subject, entry.last_failed_at
        );
    }
    dropped
}
