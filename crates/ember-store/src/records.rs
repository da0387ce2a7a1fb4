use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::Database;

/// Raw key-value row. Higher layers (message log, response cache) decide what
/// the JSON payload means; this layer only moves rows.
pub struct RecordRow {
    pub payload: String,
    pub stored_at: DateTime<Utc>,
}

impl Database {
    pub fn put_record(&self, key: &str, payload: &str, stored_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            // stored_at never moves backwards for a key, even across a clock
            // step: keep the later of the existing and the new timestamp.
            let effective = match query_stored_at(conn, key)? {
                Some(existing) if existing > stored_at => existing,
                _ => stored_at,
            };
            conn.execute(
                "INSERT INTO records (key, payload, stored_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET payload = ?2, stored_at = ?3",
                rusqlite::params![key, payload, effective.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get_record(&self, key: &str) -> Result<Option<RecordRow>> {
        self.with_conn(|conn| query_record(conn, key))
    }

    pub fn delete_record(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM records WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    /// Bulk invalidation: remove every record under a namespace prefix.
    /// Returns the number of rows removed.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM records WHERE key LIKE ?1 || '%'",
                [prefix],
            )?;
            Ok(removed)
        })
    }

    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM records WHERE key LIKE ?1 || '%' ORDER BY key")?;
            let keys = stmt
                .query_map([prefix], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }
}

fn query_record(conn: &Connection, key: &str) -> Result<Option<RecordRow>> {
    let mut stmt = conn.prepare("SELECT payload, stored_at FROM records WHERE key = ?1")?;

    let row = stmt
        .query_row([key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .optional()?;

    match row {
        Some((payload, stored_at)) => {
            let stored_at = DateTime::parse_from_rfc3339(&stored_at)
                .map_err(|e| anyhow::anyhow!("bad stored_at for {}: {}", key, e))?
                .with_timezone(&Utc);
            Ok(Some(RecordRow { payload, stored_at }))
        }
        None => Ok(None),
    }
}

fn query_stored_at(conn: &Connection, key: &str) -> Result<Option<DateTime<Utc>>> {
    let row: Option<String> = conn
        .query_row("SELECT stored_at FROM records WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;

    match row {
        Some(s) => Ok(Some(
            DateTime::parse_from_rfc3339(&s)
                .map_err(|e| anyhow::anyhow!("bad stored_at for {}: {}", key, e))?
                .with_timezone(&Utc),
        )),
        None => Ok(None),
    }
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.put_record("conv:abc", "{\"x\":1}", now).unwrap();
        let row = db.get_record("conv:abc").unwrap().unwrap();
        assert_eq!(row.payload, "{\"x\":1}");

        db.delete_record("conv:abc").unwrap();
        assert!(db.get_record("conv:abc").unwrap().is_none());
    }

    #[test]
    fn test_stored_at_never_moves_backwards() {
        let db = Database::open_in_memory().unwrap();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(60);

        db.put_record("cache:matches:1", "1", later).unwrap();
        db.put_record("cache:matches:1", "2", earlier).unwrap();

        let row = db.get_record("cache:matches:1").unwrap().unwrap();
        assert_eq!(row.payload, "2");
        assert_eq!(row.stored_at.to_rfc3339(), later.to_rfc3339());
    }

    #[test]
    fn test_delete_prefix_scopes_to_namespace() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.put_record("cache:matches:1", "a", now).unwrap();
        db.put_record("cache:matches:2", "b", now).unwrap();
        db.put_record("cache:profile:1", "c", now).unwrap();
        db.put_record("conv:1", "d", now).unwrap();

        let removed = db.delete_prefix("cache:matches:").unwrap();
        assert_eq!(removed, 2);
        assert!(db.get_record("cache:profile:1").unwrap().is_some());
        assert!(db.get_record("conv:1").unwrap().is_some());

        assert_eq!(db.list_keys("cache:").unwrap(), vec!["cache:profile:1"]);
    }
}
