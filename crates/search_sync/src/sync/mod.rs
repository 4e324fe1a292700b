//! Incremental index synchronization
//!
//! Host mutations are keyed, merged into the pending queue and drained by
//! the batch pipeline. Maintenance re-verifies the index on a schedule.

pub mod content;
pub mod delayed_task;
pub mod maintenance;
pub mod pending_queue;
pub mod pipeline;
pub mod stable_key;
