pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::stable_key::StableKey;

/// Minimal projection of a host message, as carried by mutation events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Folder path the message currently lives in
    pub container: String,
    /// Volatile host id (reassigned on move, compaction, resync)
    pub id: u32,
    /// Durable per-message token (the Message-ID header), if the host sent it
    pub token: Option<String>,
    pub subject: Option<String>,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Human readable folder name for diagnostics
    pub container_label: Option<String>,
}

/// `{container, token}` projection used to re-resolve a key without the full object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub container: String,
    pub token: String,
}

/// Fields reported by the host in an `updated` notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangedField {
    Read,
    Flagged,
    Junk,
    Labels,
    Subject,
    Other(String),
}

impl ChangedField {
    /// Whether a change to this field alters what the search engine stores
    pub fn is_indexed(&self) -> bool {
        matches!(self, ChangedField::Labels | ChangedField::Subject)
    }
}

/// Mutation notifications consumed from the host mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MutationEvent {
    /// New messages arrived in a folder
    New {
        container: String,
        documents: Vec<Document>,
    },

    /// Messages moved; `before[i]` became `after[i]`
    Moved {
        before: Vec<Document>,
        after: Vec<Document>,
    },

    /// Messages deleted from a folder
    Deleted {
        container: String,
        documents: Vec<Document>,
    },

    /// Messages copied; `after` holds the new copies
    Copied {
        before: Vec<Document>,
        after: Vec<Document>,
    },

    /// Message properties changed
    Updated {
        document: Document,
        changed: Vec<ChangedField>,
    },
}

impl MutationEvent {
    /// Get the event type string for logging
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::New { .. } => "new",
            Self::Moved { .. } => "moved",
            Self::Deleted { .. } => "deleted",
            Self::Copied { .. } => "copied",
            Self::Updated { .. } => "updated",
        }
    }
}

/// Cheap header-only row used to ask the engine which keys are new
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRow {
    pub key: StableKey,
    pub container: String,
    pub subject: Option<String>,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl HeaderRow {
    pub fn from_document(key: StableKey, doc: &Document) -> Self {
        Self {
            key,
            container: doc.container.clone(),
            subject: doc.subject.clone(),
            author: doc.author.clone(),
            date: doc.date,
        }
    }
}

/// Full row submitted for indexing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    pub key: StableKey,
    pub container: String,
    pub subject: Option<String>,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub body: String,
}

/// An entry as reported back by the search engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEntry {
    pub key: StableKey,
    pub date: DateTime<Utc>,
    pub subject: Option<String>,
}

/// Budget for one `optimize` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeOptions {
    pub page_budget: u32,
    pub step_time_ms: u64,
    pub max_steps: u32,
}

/// Result of one `optimize` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub steps: u32,
    pub total_changes: u64,
    pub converged: bool,
    pub size_mb: f64,
}

/// Engine health snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub document_count: u64,
    pub size_mb: f64,
    pub healthy: bool,
}
