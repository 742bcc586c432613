//! `banter-store` — the fact store: the sole source of truth.
//!
//! Pure persistence over SQLite. Profiles, messages (with FTS5 full-text
//! index), facts with their append-only version history, closed windows,
//! episodes, proactive events, the embedding cache persistent tier, and
//! per-window fact-quality metrics all live here. No other component caches
//! mutable fact state beyond a single event's lifetime.
//!
//! Thread-safe: the connection is behind a `Mutex`; no lock is ever held
//! across an await point (the store API is synchronous by design).

pub mod db;
pub mod embedding;
pub mod episodes;
pub mod error;
pub mod facts;
pub mod messages;
pub mod metrics;
pub mod proactive;
pub mod profiles;
pub mod types;
pub mod windows;

use std::sync::Mutex;

use rusqlite::Connection;

pub use error::{Result, StoreError};

/// Handle to the single process datastore.
pub struct FactStore {
    pub(crate) conn: Mutex<Connection>,
}

impl FactStore {
    /// Open (or create) the datastore at `path`.
    ///
    /// Applies WAL mode and the busy timeout, then runs the idempotent
    /// schema migration.
    pub fn open(path: &str, busy_timeout_secs: u64) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(busy_timeout_secs))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Raw connection access for test fixtures (aging rows, forcing
    /// timestamps). Not part of the store contract.
    #[doc(hidden)]
    pub fn conn_for_tests(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// Serialize an f32 vector as a little-endian BLOB.
pub(crate) fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Deserialize a little-endian BLOB back into an f32 vector.
/// A length that is not a multiple of 4 means the row is corrupt.
pub(crate) fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_blob_round_trip() {
        let v = vec![0.25_f32, -1.5, 3.0, 0.0];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob).unwrap(), v);
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let blob = vec![0u8; 7];
        assert!(matches!(
            blob_to_vec(&blob),
            Err(StoreError::Corrupt(_))
        ));
    }
}
