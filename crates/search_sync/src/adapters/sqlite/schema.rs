use rusqlite::Connection;

use crate::types::error::Result;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("
        -- Key-value settings: queue snapshot, tier last-run stamps,
        -- maintenance history and per-tier overrides.
        CREATE TABLE IF NOT EXISTS settings (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL    -- unix epoch ms
        );
    ")?;

    Ok(())
}
