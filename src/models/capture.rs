use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use serde::{Deserialize, Serialize};

/// A timing frame as stored in the `requests` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// SQLite rowid, reflects insertion order
    pub id: i64,
    pub timestamp: String,
    pub payload: String,
}

impl CaptureRecord {
    pub fn captured_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

/// A freshly fetched frame waiting to be written.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub timestamp: String,
    pub payload: String,
}

impl NewCapture {
    /// Stamps the payload with the local wall-clock time, e.g. `2026-10-18T14:03:07+02:00`.
    pub fn now(payload: String) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            payload,
        }
    }
}
