//! Unified error types for the indexing subsystem
//!
//! This module defines error types that:
//! - Follow the failure taxonomy of the sync queue (keying, resolution,
//!   engine, verification, configuration)
//! - Are serializable so the last failure can travel in status snapshots
//! - Map collaborator errors (SQLite, JSON, MIME parsing) to one enum

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for queue, pipeline and maintenance operations
///
/// None of these are fatal to the host. The worst outcome is a single
/// unresolvable document being dropped after the stuck threshold.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message")]
pub enum SyncError {
    /// The event carries no durable token; it is dropped, never retried.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// The key does not currently map to a live document.
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// A search engine RPC threw or timed out.
    #[error("Search engine error: {0}")]
    Engine(String),

    /// The engine reported success but the read-back disagrees.
    #[error("Verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Errors that abort a whole batch run and trigger the error backoff.
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, SyncError::Engine(_) | SyncError::Database(_))
    }
}

// Implement From for common error types

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigInvalid(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<mailparse::MailParseError> for SyncError {
    fn from(err: mailparse::MailParseError) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<r2d2::Error> for SyncError {
    fn from(err: r2d2::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<String> for SyncError {
    fn from(err: String) -> Self {
        SyncError::Other(err)
    }
}

impl From<&str> for SyncError {
    fn from(err: &str) -> Self {
        SyncError::Other(err.to_string())
    }
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
