use std::path::Path;

use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{CaptureRecord, NewCapture};

use super::schema::{DROP_SCHEMA, SCHEMA};

/// Handle to the capture database. Each handle wraps its own connection,
/// so the poller and the controller never share one.
pub struct CaptureStore {
    conn: Connection,
}

impl CaptureStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).await?;
        Ok(Self { conn })
    }

    /// Creates the `requests` table if needed. With `clean`, any existing
    /// table is dropped first. Safe to run on every startup.
    pub async fn prepare_schema(&self, clean: bool) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if clean {
                    tx.execute_batch(DROP_SCHEMA)?;
                }
                tx.execute_batch(SCHEMA)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Writes one capture in its own transaction and returns its rowid.
    pub async fn insert_capture(&self, capture: NewCapture) -> Result<i64> {
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO requests (timestamp, json) VALUES (?1, ?2)",
                    params![capture.timestamp, capture.payload],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    pub async fn count_captures(&self) -> Result<u64> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    #[cfg(test)]
    pub async fn get_all_captures(&self) -> Result<Vec<CaptureRecord>> {
        let captures = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT rowid, timestamp, json FROM requests ORDER BY rowid")?;
                let captures = stmt
                    .query_map([], capture_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(captures)
            })
            .await?;
        Ok(captures)
    }

    pub async fn latest_capture(&self) -> Result<Option<CaptureRecord>> {
        let capture = self
            .conn
            .call(|conn| {
                let capture = conn
                    .query_row(
                        "SELECT rowid, timestamp, json FROM requests ORDER BY rowid DESC LIMIT 1",
                        [],
                        capture_from_row,
                    )
                    .optional()?;
                Ok(capture)
            })
            .await?;
        Ok(capture)
    }

    /// Closes the connection, waiting for queued statements to finish.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

fn capture_from_row(row: &Row) -> rusqlite::Result<CaptureRecord> {
    Ok(CaptureRecord {
        id: row.get(0)?,
        timestamp: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        payload: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
    })
}
