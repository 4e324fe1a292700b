//! Pending update queue
//!
//! Outstanding index mutations keyed by stable key, at most one entry per
//! key. Re-enqueueing a key merges into the existing entry (latest kind
//! wins, failure bookkeeping survives). The map is mirrored to the
//! key-value store as a JSON snapshot and restored at startup.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{KeyValueStore, MessageStore};
use crate::sync::stable_key::{derive_key, StableKey};
use crate::types::error::Result;
use crate::types::Document;

pub const SNAPSHOT_KEY: &str = "index_queue.snapshot";

/// Kind of mutation waiting to be applied to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    New,
    Moved,
    Deleted,
}

impl UpdateKind {
    pub fn is_delete(&self) -> bool {
        matches!(self, UpdateKind::Deleted)
    }
}

/// Diagnostic metadata carried with an entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMeta {
    pub subject: Option<String>,
    pub container_label: Option<String>,
}

impl PendingMeta {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            subject: doc.subject.clone(),
            container_label: doc
                .container_label
                .clone()
                .or_else(|| Some(doc.container.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub key: StableKey,
    pub kind: UpdateKind,
    /// Strictly increasing across the queue; identifies this revision of the entry
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub has_failed: bool,
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Rewrite the document even if the engine already holds it
    #[serde(default)]
    pub reindex: bool,
    #[serde(default)]
    pub meta: PendingMeta,
}

/// Merge an incoming mutation into the entry already queued for its key.
///
/// The incoming kind, stamp and re-index request win. Failure bookkeeping
/// is kept from the existing entry so a flapping key still becomes
/// eligible for the stuck-queue drop. A re-index request stays sticky
/// across merges unless the newest mutation is a delete.
pub fn merge(existing: Option<&PendingUpdate>, incoming: PendingUpdate) -> PendingUpdate {
    let Some(existing) = existing else {
        return incoming;
    };

    let reindex = !incoming.kind.is_delete() && (incoming.reindex || existing.reindex);

    PendingUpdate {
        has_failed: existing.has_failed,
        last_failed_at: existing.last_failed_at,
        reindex,
        meta: PendingMeta {
            subject: incoming.meta.subject.or_else(|| existing.meta.subject.clone()),
            container_label: incoming
                .meta
                .container_label
                .or_else(|| existing.meta.container_label.clone()),
        },
        ..incoming
    }
}

struct QueueInner {
    entries: HashMap<StableKey, PendingUpdate>,
    last_stamp: Option<DateTime<Utc>>,
}

impl QueueInner {
    /// `now`, bumped past the previous stamp if the clock did not advance
    fn next_stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn insert(
        &mut self,
        key: StableKey,
        kind: UpdateKind,
        meta: PendingMeta,
        reindex: bool,
        now: DateTime<Utc>,
    ) -> PendingUpdate {
        let incoming = PendingUpdate {
            key: key.clone(),
            kind,
            enqueued_at: self.next_stamp(now),
            has_failed: false,
            last_failed_at: None,
            reindex,
            meta,
        };

        let merged = merge(self.entries.get(&key), incoming);
        self.entries.insert(key, merged.clone());
        merged
    }
}

/// Deduplicated map of outstanding mutations
pub struct PendingQueue {
    inner: Mutex<QueueInner>,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: HashMap::new(),
                last_stamp: None,
            }),
        }
    }

    /// Derive the key for `doc` and merge the mutation in.
    ///
    /// The lock is held across key derivation, which may ask the store for
    /// the message token. Two concurrent enqueues therefore cannot
    /// interleave their derive and merge steps.
    pub async fn enqueue(
        &self,
        kind: UpdateKind,
        doc: &Document,
        store: &dyn MessageStore,
        reindex: bool,
        now: DateTime<Utc>,
    ) -> Result<PendingUpdate> {
        let mut inner = self.inner.lock().await;
        let key = derive_key(doc, store).await?;
        let merged = inner.insert(key, kind, PendingMeta::from_document(doc), reindex, now);

        debug!(
            "Queued {:?} for {} (reindex: {}, failed before: {})",
            merged.kind, merged.key, merged.reindex, merged.has_failed
        );
        Ok(merged)
    }

    /// Merge a mutation for an already derived key
    pub async fn enqueue_key(
        &self,
        kind: UpdateKind,
        key: StableKey,
        meta: PendingMeta,
        reindex: bool,
        now: DateTime<Utc>,
    ) -> PendingUpdate {
        let mut inner = self.inner.lock().await;
        inner.insert(key, kind, meta, reindex, now)
    }

    /// Up to `limit` entries, oldest stamp first
    pub async fn oldest(&self, limit: usize) -> Vec<PendingUpdate> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<PendingUpdate> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        entries.truncate(limit);
        entries
    }

    pub async fn get(&self, key: &StableKey) -> Option<PendingUpdate> {
        self.inner.lock().await.entries.get(key).cloned()
    }

    /// Flag an entry as failing; no-op if it was dequeued meanwhile
    pub async fn mark_failed(&self, key: &StableKey, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.has_failed = true;
            entry.last_failed_at = Some(now);
        }
    }

    pub async fn clear_failed(&self, key: &StableKey) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.has_failed = false;
        }
    }

    /// Remove the entry only if it still carries the stamp seen at batch
    /// start. A newer event for the same key leaves the entry queued.
    pub async fn dequeue_if_unchanged(&self, key: &StableKey, stamp: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(key) {
            Some(entry) if entry.enqueued_at == stamp => {
                inner.entries.remove(key);
                true
            }
            Some(_) => {
                debug!("Keeping {}: a newer mutation arrived mid-batch", key);
                false
            }
            None => false,
        }
    }

    /// Force-drop every entry flagged as failing
    pub async fn drop_failed(&self) -> Vec<PendingUpdate> {
        let mut inner = self.inner.lock().await;
        let failed: Vec<StableKey> = inner
            .entries
            .values()
            .filter(|e| e.has_failed)
            .map(|e| e.key.clone())
            .collect();

        failed
            .iter()
            .filter_map(|key| inner.entries.remove(key))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    pub async fn failed_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.has_failed)
            .count()
    }

    pub async fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .await
            .entries
            .values()
            .map(|e| e.enqueued_at)
            .min()
    }

    /// Array mirror of the map, oldest first. Past `cap` entries only the
    /// newest are kept; the rest stay in memory but are not persisted.
    pub async fn snapshot(&self, cap: usize) -> Vec<PendingUpdate> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<PendingUpdate> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));

        if entries.len() > cap {
            warn!(
                "Queue snapshot capped: persisting newest {} of {} entries",
                cap,
                entries.len()
            );
            entries.drain(..entries.len() - cap);
        }
        entries
    }

    /// Merge restored entries; an in-memory entry for the same key wins.
    /// Returns how many entries were restored.
    pub async fn restore(&self, entries: Vec<PendingUpdate>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut restored = 0;

        for entry in entries {
            if inner.entries.contains_key(&entry.key) {
                debug!("Restore skipped {}: newer in-memory entry", entry.key);
                continue;
            }
            if inner.last_stamp.map_or(true, |last| entry.enqueued_at > last) {
                inner.last_stamp = Some(entry.enqueued_at);
            }
            inner.entries.insert(entry.key.clone(), entry);
            restored += 1;
        }

        restored
    }

    /// Write the snapshot to the key-value store
    pub async fn save_snapshot(&self, store: &dyn KeyValueStore, cap: usize) -> Result<usize> {
        let entries = self.snapshot(cap).await;
        let json = serde_json::to_string(&entries)?;
        store.set(SNAPSHOT_KEY, &json)?;
        Ok(entries.len())
    }
}

/// Read the persisted snapshot. An unreadable snapshot is discarded
/// (logged) rather than blocking startup.
pub fn load_snapshot(store: &dyn KeyValueStore) -> Result<Vec<PendingUpdate>> {
    let Some(json) = store.get(SNAPSHOT_KEY)? else {
        return Ok(Vec::new());
    };

    match serde_json::from_str::<Vec<PendingUpdate>>(&json) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            warn!("Discarding unreadable queue snapshot: {}", e);
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteKvStore;
    use crate::test_support::{t, FakeMailbox};
    use crate::types::error::SyncError;
    use std::sync::Arc;

    fn key(token: &str) -> StableKey {
        StableKey::from_parts("INBOX", token).unwrap()
    }

    fn update(token: &str, kind: UpdateKind, at: DateTime<Utc>) -> PendingUpdate {
        PendingUpdate {
            key: key(token),
            kind,
            enqueued_at: at,
            has_failed: false,
            last_failed_at: None,
            reindex: false,
            meta: PendingMeta::default(),
        }
    }

    #[test]
    fn test_merge_latest_kind_wins_failure_preserved() {
        let mut existing = update("a@x", UpdateKind::New, t(0));
        existing.has_failed = true;
        existing.last_failed_at = Some(t(5));

        let merged = merge(Some(&existing), update("a@x", UpdateKind::Deleted, t(10)));
        assert_eq!(merged.kind, UpdateKind::Deleted);
        assert_eq!(merged.enqueued_at, t(10));
        assert!(merged.has_failed);
        assert_eq!(merged.last_failed_at, Some(t(5)));
    }

    #[test]
    fn test_merge_without_existing_is_incoming() {
        let incoming = update("a@x", UpdateKind::Moved, t(3));
        assert_eq!(merge(None, incoming.clone()), incoming);
    }

    #[test]
    fn test_merge_reindex_sticky_until_delete() {
        let mut existing = update("a@x", UpdateKind::New, t(0));
        existing.reindex = true;

        let merged = merge(Some(&existing), update("a@x", UpdateKind::New, t(1)));
        assert!(merged.reindex);

        let merged = merge(Some(&merged), update("a@x", UpdateKind::Deleted, t(2)));
        assert!(!merged.reindex);
    }

    #[test]
    fn test_merge_keeps_known_meta() {
        let mut existing = update("a@x", UpdateKind::New, t(0));
        existing.meta.subject = Some("Invoice".to_string());

        let merged = merge(Some(&existing), update("a@x", UpdateKind::Moved, t(1)));
        assert_eq!(merged.meta.subject.as_deref(), Some("Invoice"));
    }

    #[tokio::test]
    async fn test_one_entry_per_key() {
        let queue = PendingQueue::new();
        let mailbox = FakeMailbox::new();
        let doc = mailbox.add("INBOX", "a@x", "Hello");

        queue.enqueue(UpdateKind::New, &doc, &mailbox, false, t(0)).await.unwrap();
        queue.enqueue(UpdateKind::Deleted, &doc, &mailbox, false, t(1)).await.unwrap();
        queue.enqueue(UpdateKind::New, &doc, &mailbox, false, t(2)).await.unwrap();

        assert_eq!(queue.len().await, 1);
        let entry = queue.get(&key("a@x")).await.unwrap();
        assert_eq!(entry.kind, UpdateKind::New);
        assert_eq!(entry.enqueued_at, t(2));
    }

    #[tokio::test]
    async fn test_stamps_strictly_increase_on_equal_clock() {
        let queue = PendingQueue::new();
        let first = queue
            .enqueue_key(UpdateKind::New, key("a@x"), PendingMeta::default(), false, t(0))
            .await;
        let second = queue
            .enqueue_key(UpdateKind::Deleted, key("a@x"), PendingMeta::default(), false, t(0))
            .await;
        assert!(second.enqueued_at > first.enqueued_at);
    }

    #[tokio::test]
    async fn test_unkeyable_document_rejected() {
        let queue = PendingQueue::new();
        let mailbox = FakeMailbox::new();
        let doc = Document {
            container: "INBOX".to_string(),
            id: 404,
            ..Default::default()
        };

        let err = queue
            .enqueue(UpdateKind::New, &doc, &mailbox, false, t(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::KeyDerivation(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_do_not_lose_updates() {
        let queue = Arc::new(PendingQueue::new());
        let mailbox = Arc::new(FakeMailbox::new());

        let mut handles = Vec::new();
        for i in 0..20 {
            let queue = queue.clone();
            let mailbox = mailbox.clone();
            let mut doc = mailbox.add("INBOX", &format!("m{}@x", i), "Hi");
            // Force the token lookup suspension point
            doc.token = None;
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(UpdateKind::New, &doc, mailbox.as_ref(), false, t(0))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(queue.len().await, 20);
    }

    #[tokio::test]
    async fn test_dequeue_respects_newer_stamp() {
        let queue = PendingQueue::new();
        let first = queue
            .enqueue_key(UpdateKind::Deleted, key("a@x"), PendingMeta::default(), false, t(0))
            .await;
        queue
            .enqueue_key(UpdateKind::New, key("a@x"), PendingMeta::default(), false, t(1))
            .await;

        assert!(!queue.dequeue_if_unchanged(&first.key, first.enqueued_at).await);
        assert_eq!(queue.len().await, 1);

        let current = queue.get(&first.key).await.unwrap();
        assert!(queue.dequeue_if_unchanged(&current.key, current.enqueued_at).await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_oldest_first_and_limit() {
        let queue = PendingQueue::new();
        for (i, token) in ["c@x", "a@x", "b@x"].iter().enumerate() {
            queue
                .enqueue_key(UpdateKind::New, key(token), PendingMeta::default(), false, t(i as i64))
                .await;
        }

        let oldest = queue.oldest(2).await;
        assert_eq!(oldest.len(), 2);
        assert_eq!(oldest[0].key, key("c@x"));
        assert_eq!(oldest[1].key, key("a@x"));
    }

    #[tokio::test]
    async fn test_drop_failed_only_drops_flagged() {
        let queue = PendingQueue::new();
        queue
            .enqueue_key(UpdateKind::New, key("a@x"), PendingMeta::default(), false, t(0))
            .await;
        queue
            .enqueue_key(UpdateKind::New, key("b@x"), PendingMeta::default(), false, t(1))
            .await;
        queue.mark_failed(&key("a@x"), t(2)).await;

        let dropped = queue.drop_failed().await;
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].key, key("a@x"));
        assert!(queue.get(&key("b@x")).await.is_some());
    }

    #[tokio::test]
    async fn test_restore_never_overwrites_in_memory() {
        let store = SqliteKvStore::in_memory().unwrap();

        let before = PendingQueue::new();
        before
            .enqueue_key(UpdateKind::New, key("a@x"), PendingMeta::default(), false, t(0))
            .await;
        before
            .enqueue_key(UpdateKind::New, key("b@x"), PendingMeta::default(), false, t(1))
            .await;
        before.save_snapshot(&store, 100).await.unwrap();

        // An event arrived before the restore ran
        let after = PendingQueue::new();
        after
            .enqueue_key(UpdateKind::Deleted, key("a@x"), PendingMeta::default(), false, t(5))
            .await;

        let restored = after.restore(load_snapshot(&store).unwrap()).await;
        assert_eq!(restored, 1);
        assert_eq!(after.len().await, 2);
        assert_eq!(after.get(&key("a@x")).await.unwrap().kind, UpdateKind::Deleted);
    }

    #[tokio::test]
    async fn test_snapshot_cap_keeps_newest() {
        let queue = PendingQueue::new();
        for i in 0..5 {
            queue
                .enqueue_key(
                    UpdateKind::New,
                    key(&format!("m{}@x", i)),
                    PendingMeta::default(),
                    false,
                    t(i),
                )
                .await;
        }

        let snapshot = queue.snapshot(2).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, key("m3@x"));
        assert_eq!(snapshot[1].key, key("m4@x"));
        assert_eq!(queue.len().await, 5);
    }

    #[test]
    fn test_corrupt_snapshot_discarded() {
        let store = SqliteKvStore::in_memory().unwrap();
        store.set(SNAPSHOT_KEY, "{not an array").unwrap();
        assert!(load_snapshot(&store).unwrap().is_empty());
    }
}
