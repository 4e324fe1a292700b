//! Stable key derivation
//!
//! Host message ids are reassigned on move, compaction and resync, so the
//! index is keyed by `container + durable token` (the Message-ID header)
//! instead. The key round-trips back to a `DocumentRef` so a queued
//! mutation can be re-resolved without fetching the full message first.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::backend::MessageStore;
use crate::types::error::{Result, SyncError};
use crate::types::{Document, DocumentRef};

/// ASCII unit separator; cannot appear in a folder path or a Message-ID
const KEY_SEPARATOR: char = '\u{1f}';

/// Durable identifier of a logical message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableKey(String);

impl StableKey {
    /// Build a key from its constituent parts
    pub fn from_parts(container: &str, token: &str) -> Result<Self> {
        let token = normalize_token(token);
        if token.is_empty() {
            return Err(SyncError::KeyDerivation(format!(
                "Message in '{}' has no durable token",
                container
            )));
        }
        if container.is_empty() {
            return Err(SyncError::KeyDerivation(format!(
                "Message '{}' has no container",
                token
            )));
        }
        if container.contains(KEY_SEPARATOR) || token.contains(KEY_SEPARATOR) {
            return Err(SyncError::KeyDerivation(format!(
                "Separator character in container '{}' or token '{}'",
                container.escape_debug(),
                token.escape_debug()
            )));
        }

        Ok(Self(format!("{}{}{}", container, KEY_SEPARATOR, token)))
    }

    /// Build a key from the minimal `{container, token}` projection
    pub fn from_ref(doc_ref: &DocumentRef) -> Result<Self> {
        Self::from_parts(&doc_ref.container, &doc_ref.token)
    }

    /// Build a key from a full document, without consulting the store
    pub fn from_document(doc: &Document) -> Result<Self> {
        match doc.token.as_deref() {
            Some(token) => Self::from_parts(&doc.container, token),
            None => Err(SyncError::KeyDerivation(format!(
                "Message {} in '{}' has no durable token",
                doc.id, doc.container
            ))),
        }
    }

    /// Parse the key back into `{container, token}`
    pub fn to_ref(&self) -> Result<DocumentRef> {
        match self.0.split_once(KEY_SEPARATOR) {
            Some((container, token)) if !container.is_empty() && !token.is_empty() => {
                Ok(DocumentRef {
                    container: container.to_string(),
                    token: token.to_string(),
                })
            }
            _ => Err(SyncError::Parse(format!(
                "Malformed stable key: {}",
                self.0.escape_debug()
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Swap the separator for something readable in logs
        write!(f, "{}", self.0.replace(KEY_SEPARATOR, "#"))
    }
}

/// Derive the key for a document, asking the store for the token if the
/// event did not carry it
pub async fn derive_key(doc: &Document, store: &dyn MessageStore) -> Result<StableKey> {
    if let Some(token) = doc.token.as_deref().filter(|t| !normalize_token(t).is_empty()) {
        return StableKey::from_parts(&doc.container, token);
    }

    let token = store
        .lookup_token(&doc.container, doc.id)
        .await
        .map_err(|e| {
            SyncError::KeyDerivation(format!(
                "Token lookup for message {} in '{}' failed: {}",
                doc.id, doc.container, e
            ))
        })?;

    match token {
        Some(token) => StableKey::from_parts(&doc.container, &token),
        None => Err(SyncError::KeyDerivation(format!(
            "Message {} in '{}' has no durable token",
            doc.id, doc.container
        ))),
    }
}

/// `<abc@host>` and `abc@host` name the same message
fn normalize_token(token: &str) -> &str {
    let token = token.trim();
    token
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .unwrap_or(token)
        .trim()
}
