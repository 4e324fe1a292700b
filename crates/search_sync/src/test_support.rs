//! In-memory collaborators for unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::backend::{Clock, MessageStore, SearchEngine};
use crate::sync::stable_key::StableKey;
use crate::types::error::{Result, SyncError};
use crate::types::{
    Document, DocumentRef, EngineEntry, EngineStats, HeaderRow, IndexRow, OptimizeOptions,
    OptimizeReport,
};

/// Fixed reference time plus `secs`
pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

/// Clock the test moves by hand
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

struct StoredMessage {
    doc: Document,
    raw: Vec<u8>,
}

#[derive(Default)]
struct MailboxInner {
    next_id: u32,
    messages: Vec<StoredMessage>,
    unfetchable: HashSet<String>,
    fail_resolve: bool,
    resolve_calls: usize,
}

/// Host mailbox fake
#[derive(Default)]
pub struct FakeMailbox {
    inner: Mutex<MailboxInner>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: &str, token: &str, subject: &str) -> Document {
        self.add_dated(container, token, subject, t(0))
    }

    pub fn add_dated(
        &self,
        container: &str,
        token: &str,
        subject: &str,
        date: DateTime<Utc>,
    ) -> Document {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let doc = Document {
            container: container.to_string(),
            id: inner.next_id,
            token: Some(token.to_string()),
            subject: Some(subject.to_string()),
            author: Some("sender@example.com".to_string()),
            date: Some(date),
            labels: Vec::new(),
            container_label: None,
        };
        let raw = format!(
            "From: sender@example.com\r\nMessage-ID: <{}>\r\nSubject: {}\r\n\r\nBody of {}\r\n",
            token, subject, subject
        )
        .into_bytes();
        inner.messages.push(StoredMessage {
            doc: doc.clone(),
            raw,
        });
        doc
    }

    pub fn remove(&self, container: &str, token: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .messages
            .retain(|m| !(m.doc.container == container && m.doc.token.as_deref() == Some(token)));
    }

    /// Move a message; the host assigns a new volatile id
    pub fn move_to(&self, doc: &Document, container: &str) -> Document {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let new_id = inner.next_id;
        let stored = inner
            .messages
            .iter_mut()
            .find(|m| m.doc.container == doc.container && m.doc.token == doc.token)
            .expect("message to move");
        stored.doc.container = container.to_string();
        stored.doc.id = new_id;
        stored.doc.clone()
    }

    pub fn set_unfetchable(&self, token: &str) {
        self.inner.lock().unwrap().unfetchable.insert(token.to_string());
    }

    pub fn set_raw(&self, token: &str, raw: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        for message in inner.messages.iter_mut() {
            if message.doc.token.as_deref() == Some(token) {
                message.raw = raw.to_vec();
            }
        }
    }

    pub fn set_fail_resolve(&self, fail: bool) {
        self.inner.lock().unwrap().fail_resolve = fail;
    }

    pub fn resolve_calls(&self) -> usize {
        self.inner.lock().unwrap().resolve_calls
    }
}

#[async_trait]
impl MessageStore for FakeMailbox {
    async fn lookup_token(&self, container: &str, id: u32) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .find(|m| m.doc.container == container && m.doc.id == id)
            .and_then(|m| m.doc.token.clone()))
    }

    async fn resolve(&self, doc_ref: &DocumentRef) -> Result<Option<Document>> {
        let mut inner = self.inner.lock().unwrap();
        inner.resolve_calls += 1;
        if inner.fail_resolve {
            return Err(SyncError::Resolution("mailbox offline".to_string()));
        }
        Ok(inner
            .messages
            .iter()
            .find(|m| {
                m.doc.container == doc_ref.container
                    && m.doc.token.as_deref() == Some(doc_ref.token.as_str())
            })
            .map(|m| m.doc.clone()))
    }

    async fn fetch_raw(&self, doc: &Document) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        if let Some(token) = &doc.token {
            if inner.unfetchable.contains(token) {
                return Err(SyncError::Resolution(format!("body of {} unavailable", token)));
            }
        }
        inner
            .messages
            .iter()
            .find(|m| m.doc.container == doc.container && m.doc.token == doc.token)
            .map(|m| m.raw.clone())
            .ok_or_else(|| SyncError::Resolution("message vanished".to_string()))
    }

    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.lock().unwrap();
        let mut docs: Vec<Document> = inner
            .messages
            .iter()
            .map(|m| m.doc.clone())
            .filter(|d| d.date.is_some_and(|date| date >= start && date <= end))
            .collect();
        docs.sort_by(|a, b| b.date.cmp(&a.date).then(a.id.cmp(&b.id)));
        Ok(docs.into_iter().skip(offset).take(limit).collect())
    }
}

/// Gate that parks `remove_batch` until the test releases it
#[derive(Clone, Default)]
pub struct RemoveGate {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
struct EngineInner {
    entries: BTreeMap<StableKey, EngineEntry>,
    fail_all: bool,
    claim_all_indexed: bool,
    drop_writes: bool,
    ignore_removes: bool,
    optimize_changes: VecDeque<u64>,
    remove_gate: Option<RemoveGate>,
    attempts: Vec<tokio::time::Instant>,
    stats_calls: usize,
    optimize_calls: usize,
    index_calls: usize,
}

/// Search engine fake with switchable misbehaviour
#[derive(Default)]
pub struct FakeEngine {
    inner: Mutex<EngineInner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: StableKey, date: DateTime<Utc>) {
        self.inner.lock().unwrap().entries.insert(
            key.clone(),
            EngineEntry {
                key,
                date,
                subject: None,
            },
        );
    }

    pub fn contains(&self, key: &StableKey) -> bool {
        self.inner.lock().unwrap().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.inner.lock().unwrap().fail_all = fail;
    }

    /// `filter_new_keys` claims everything is already indexed
    pub fn set_claim_all_indexed(&self, claim: bool) {
        self.inner.lock().unwrap().claim_all_indexed = claim;
    }

    /// `index_batch` reports success without storing
    pub fn set_drop_writes(&self, drop: bool) {
        self.inner.lock().unwrap().drop_writes = drop;
    }

    /// `remove_batch` reports success without removing
    pub fn set_ignore_removes(&self, ignore: bool) {
        self.inner.lock().unwrap().ignore_removes = ignore;
    }

    pub fn push_optimize_changes(&self, changes: &[u64]) {
        self.inner.lock().unwrap().optimize_changes.extend(changes);
    }

    pub fn set_remove_gate(&self, gate: RemoveGate) {
        self.inner.lock().unwrap().remove_gate = Some(gate);
    }

    /// Instants at which a batch run first touched the engine while failing
    pub fn attempts(&self) -> Vec<tokio::time::Instant> {
        self.inner.lock().unwrap().attempts.clone()
    }

    pub fn stats_calls(&self) -> usize {
        self.inner.lock().unwrap().stats_calls
    }

    pub fn optimize_calls(&self) -> usize {
        self.inner.lock().unwrap().optimize_calls
    }

    pub fn index_calls(&self) -> usize {
        self.inner.lock().unwrap().index_calls
    }

    fn check_available(inner: &mut EngineInner) -> Result<()> {
        if inner.fail_all {
            inner.attempts.push(tokio::time::Instant::now());
            return Err(SyncError::Engine("engine unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchEngine for FakeEngine {
    async fn index_batch(&self, rows: Vec<IndexRow>) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&mut inner)?;
        inner.index_calls += 1;
        if inner.drop_writes {
            return Ok(rows.len());
        }
        let count = rows.len();
        for row in rows {
            inner.entries.insert(
                row.key.clone(),
                EngineEntry {
                    key: row.key,
                    date: row.date.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                    subject: row.subject,
                },
            );
        }
        Ok(count)
    }

    async fn remove_batch(&self, keys: Vec<StableKey>) -> Result<usize> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            Self::check_available(&mut inner)?;
            if !inner.ignore_removes {
                for key in &keys {
                    inner.entries.remove(key);
                }
            }
            inner.remove_gate.take()
        };

        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        Ok(keys.len())
    }

    async fn filter_new_keys(&self, rows: Vec<HeaderRow>) -> Result<Vec<StableKey>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&mut inner)?;
        if inner.claim_all_indexed {
            return Ok(Vec::new());
        }
        Ok(rows
            .into_iter()
            .map(|r| r.key)
            .filter(|k| !inner.entries.contains_key(k))
            .collect())
    }

    async fn get_by_key(&self, key: &StableKey) -> Result<Option<EngineEntry>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&mut inner)?;
        Ok(inner.entries.get(key).cloned())
    }

    async fn query_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EngineEntry>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&mut inner)?;
        let mut entries: Vec<EngineEntry> = inner
            .entries
            .values()
            .filter(|e| e.date >= start && e.date <= end)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.date.cmp(&a.date).then(a.key.cmp(&b.key)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn optimize(&self, _options: OptimizeOptions) -> Result<OptimizeReport> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&mut inner)?;
        inner.optimize_calls += 1;
        let changes = inner.optimize_changes.pop_front().unwrap_or(0);
        Ok(OptimizeReport {
            steps: 1,
            total_changes: changes,
            converged: changes == 0,
            size_mb: 12.5,
        })
    }

    async fn stats(&self) -> Result<EngineStats> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&mut inner)?;
        inner.stats_calls += 1;
        Ok(EngineStats {
            document_count: inner.entries.len() as u64,
            size_mb: 12.5,
            healthy: true,
        })
    }
}
