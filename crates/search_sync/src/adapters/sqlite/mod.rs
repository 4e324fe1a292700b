pub mod pool;
pub mod schema;
pub mod settings;

// Re-export so callers can do `use crate::adapters::sqlite::DbPool`
// instead of `use crate::adapters::sqlite::pool::DbPool`
pub use pool::DbPool;
pub use settings::SqliteKvStore;
