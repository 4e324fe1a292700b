//! Collaborator boundaries
//!
//! The indexer is pure orchestration over the host mailbox, the embedded
//! search engine, a key-value store and the host alarm facility. Each is a
//! trait here so the host (or a test) plugs in its own implementation.

pub mod alarms;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::sync::stable_key::StableKey;
use crate::types::error::Result;
use crate::types::{
    Document, DocumentRef, EngineEntry, EngineStats, HeaderRow, IndexRow, OptimizeOptions,
    OptimizeReport,
};

/// The host mailbox (event source and document store)
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durable token for a message known only by its volatile id
    async fn lookup_token(&self, container: &str, id: u32) -> Result<Option<String>>;

    /// Resolve to the live message. Lookup is scoped to `doc_ref.container`;
    /// the same token in another folder is a different document.
    async fn resolve(&self, doc_ref: &DocumentRef) -> Result<Option<Document>>;

    /// Raw RFC 822 bytes for body extraction
    async fn fetch_raw(&self, doc: &Document) -> Result<Vec<u8>>;

    /// Live messages dated within `[start, end]`, newest first
    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Document>>;
}

/// RPC surface of the embedded search engine
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Upsert rows; returns the number written
    async fn index_batch(&self, rows: Vec<IndexRow>) -> Result<usize>;

    /// Remove by key; returns the number removed
    async fn remove_batch(&self, keys: Vec<StableKey>) -> Result<usize>;

    /// Keys among `rows` the engine does not hold yet
    async fn filter_new_keys(&self, rows: Vec<HeaderRow>) -> Result<Vec<StableKey>>;

    async fn get_by_key(&self, key: &StableKey) -> Result<Option<EngineEntry>>;

    /// Entries dated within `[start, end]`, newest first, at most `limit`
    async fn query_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EngineEntry>>;

    /// One bounded merge pass
    async fn optimize(&self, options: OptimizeOptions) -> Result<OptimizeReport>;

    async fn stats(&self) -> Result<EngineStats>;
}

/// Host-provided named recurring alarms that survive restarts
#[async_trait]
pub trait AlarmHost: Send + Sync {
    async fn alarm_names(&self) -> Result<Vec<String>>;

    async fn create(&self, name: &str, period_minutes: u32) -> Result<()>;

    /// Returns true if an alarm with that name existed
    async fn clear(&self, name: &str) -> Result<bool>;
}

/// Persistent string key-value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Wall-clock source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
