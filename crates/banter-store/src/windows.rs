use chrono::{DateTime, Utc};

use crate::types::{parse_ts, parse_ts_opt, ClosureReason, WindowRecord};
use crate::{FactStore, Result, StoreError};

/// Everything the windower knows about a window at the moment it closes.
#[derive(Debug, Clone)]
pub struct NewWindow {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub message_count: i64,
    pub participants: Vec<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub closure_reason: ClosureReason,
    pub dominant_value: String,
}

impl FactStore {
    /// Persist a freshly closed window. Returns its row id.
    pub fn insert_window(&self, w: &NewWindow) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO windows
             (chat_id, thread_id, first_message_id, last_message_id, message_count,
              participants, opened_at, closed_at, closure_reason, dominant_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                w.chat_id,
                w.thread_id,
                w.first_message_id,
                w.last_message_id,
                w.message_count,
                serde_json::to_string(&w.participants)?,
                w.opened_at.to_rfc3339(),
                w.closed_at.to_rfc3339(),
                w.closure_reason.to_string(),
                w.dominant_value,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_window(&self, id: i64) -> Result<WindowRecord> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{WINDOW_SELECT} WHERE id = ?1"))?;
        let w = stmt.query_row([id], row_to_window)??;
        Ok(w)
    }

    /// CLOSED → PROCESSED transition after the quality pipeline commits.
    pub fn mark_window_processed(&self, id: i64) -> Result<()> {
        self.set_window_flag(id, "processed")
    }

    /// Queue admission failed: learning for this window was dropped.
    pub fn mark_window_skipped(&self, id: i64) -> Result<()> {
        self.set_window_flag(id, "skipped")
    }

    /// Two consecutive processing failures: give up permanently.
    pub fn mark_window_failed(&self, id: i64) -> Result<()> {
        self.set_window_flag(id, "failed")
    }

    fn set_window_flag(&self, id: i64, column: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!("UPDATE windows SET {column} = 1 WHERE id = ?1"),
            [id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("window {id}")));
        }
        Ok(())
    }
}

const WINDOW_SELECT: &str = "SELECT id, chat_id, thread_id, first_message_id, last_message_id, \
     message_count, participants, opened_at, closed_at, closure_reason, dominant_value, \
     processed, skipped, failed FROM windows";

fn row_to_window(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<WindowRecord>> {
    let participants: String = row.get(6)?;
    let opened_at: String = row.get(7)?;
    let closed_at: Option<String> = row.get(8)?;
    let reason: String = row.get(9)?;
    Ok((|| {
        Ok(WindowRecord {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            thread_id: row.get(2)?,
            first_message_id: row.get(3)?,
            last_message_id: row.get(4)?,
            message_count: row.get(5)?,
            participants: serde_json::from_str(&participants)?,
            opened_at: parse_ts(opened_at)?,
            closed_at: parse_ts_opt(closed_at)?,
            closure_reason: reason
                .parse()
                .map_err(|e: String| StoreError::Corrupt(e))?,
            dominant_value: row.get(10)?,
            processed: row.get::<_, i64>(11)? != 0,
            skipped: row.get::<_, i64>(12)? != 0,
            failed: row.get::<_, i64>(13)? != 0,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_window() -> NewWindow {
        NewWindow {
            chat_id: -100,
            thread_id: None,
            first_message_id: 1,
            last_message_id: 8,
            message_count: 8,
            participants: vec![42, 7],
            opened_at: Utc::now() - chrono::Duration::seconds(120),
            closed_at: Utc::now(),
            closure_reason: ClosureReason::Size,
            dominant_value: "high".to_string(),
        }
    }

    #[test]
    fn closed_window_round_trips() {
        let store = FactStore::open_in_memory().unwrap();
        let id = store.insert_window(&sample_window()).unwrap();
        let w = store.get_window(id).unwrap();
        assert_eq!(w.message_count, 8);
        assert_eq!(w.participants, vec![42, 7]);
        assert_eq!(w.closure_reason, ClosureReason::Size);
        assert!(w.closed_at.is_some());
        assert!(!w.processed);
    }

    #[test]
    fn processed_transition_sticks() {
        let store = FactStore::open_in_memory().unwrap();
        let id = store.insert_window(&sample_window()).unwrap();
        store.mark_window_processed(id).unwrap();
        assert!(store.get_window(id).unwrap().processed);
    }

    #[test]
    fn missing_window_is_not_found() {
        let store = FactStore::open_in_memory().unwrap();
        assert!(matches!(
            store.mark_window_processed(999),
            Err(StoreError::NotFound(_))
        ));
    }
}
