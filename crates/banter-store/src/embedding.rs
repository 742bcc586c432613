use chrono::Utc;

use crate::{blob_to_vec, vec_to_blob, FactStore, Result};

impl FactStore {
    /// Persistent-tier lookup. Bumps the access counters on hit.
    pub fn get_cached_embedding(
        &self,
        text_sha256: &str,
        model_id: &str,
    ) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock().unwrap();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embedding_cache
                 WHERE text_sha256 = ?1 AND model_id = ?2",
                rusqlite::params![text_sha256, model_id],
                |row| row.get(0),
            )
            .ok();
        let Some(blob) = blob else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE embedding_cache
             SET last_accessed_at = ?3, access_count = access_count + 1
             WHERE text_sha256 = ?1 AND model_id = ?2",
            rusqlite::params![text_sha256, model_id, Utc::now().to_rfc3339()],
        )?;
        Ok(Some(blob_to_vec(&blob)?))
    }

    /// Persistent-tier write-through. Last write wins on key collision.
    pub fn put_cached_embedding(
        &self,
        text_sha256: &str,
        model_id: &str,
        vector: &[f32],
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO embedding_cache
             (text_sha256, model_id, vector, created_at, last_accessed_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 1)
             ON CONFLICT(text_sha256, model_id) DO UPDATE SET
                vector = excluded.vector,
                last_accessed_at = excluded.last_accessed_at,
                access_count = access_count + 1",
            rusqlite::params![text_sha256, model_id, vec_to_blob(vector), now],
        )?;
        Ok(())
    }
}
