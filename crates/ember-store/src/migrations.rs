use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS records (
            key         TEXT PRIMARY KEY,
            payload     TEXT NOT NULL,
            stored_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_records_stored_at
            ON records(stored_at);
        ",
    )?;

    info!("Store migrations complete");
    Ok(())
}
