//! Indexer state management
//!
//! One `IndexerState` per mailbox owns the queue, the timers and the
//! maintenance scheduler. Hosts construct it, call `start()`, feed events
//! through `event_sender()` and call `stop()` on shutdown.

mod indexer_state;

pub use indexer_state::{
    plan_updates, BatchRun, Collaborators, IndexerState, MaintenanceStatus, PlannedUpdate,
    QueueStatus, TickOutcome,
};
