//! Search index synchronization for the eddie.chat mail client
//!
//! Keeps the embedded full-text index in step with a mailbox whose
//! messages are added, moved, copied, deleted and relabelled underneath
//! it, and periodically re-verifies and compacts that index.
//!
//! ## Module Organization
//!
//! - `types/`: Domain types and the error taxonomy
//! - `config/`: Indexer configuration (TOML)
//! - `backend/`: Collaborator traits (mailbox, engine, alarms, clock)
//! - `adapters/`: SQLite key-value store
//! - `sync/`: Stable keys, pending queue, batch pipeline, maintenance
//! - `state/`: `IndexerState` lifecycle and status surface

pub mod adapters;
pub mod backend;
pub mod config;
pub mod state;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::SyncConfig;
pub use state::{Collaborators, IndexerState, MaintenanceStatus, QueueStatus};
pub use types::error::{Result, SyncError};
pub use types::MutationEvent;

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber.
///
/// `RUST_LOG` wins when set. Otherwise debug builds log this crate at
/// debug and everything else at info; release builds log info and above.
/// Calling it again after a subscriber is installed does nothing.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("search_sync=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
