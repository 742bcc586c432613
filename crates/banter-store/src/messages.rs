use banter_core::text::content_sha256;
use banter_core::types::{ChatScope, InboundMessage};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{parse_ts, StoredMessage};
use crate::{blob_to_vec, FactStore, Result};

impl FactStore {
    /// Persist an inbound message. Idempotent on `(chat_id, message_id)`:
    /// re-ingesting the same platform message is a no-op.
    ///
    /// Returns the row id, or `None` when the message was already stored.
    pub fn insert_message(&self, msg: &InboundMessage) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let media = serde_json::to_string(&msg.media_refs)?;
        let key = content_sha256(&msg.text);
        let n = conn.execute(
            "INSERT OR IGNORE INTO messages
             (chat_id, thread_id, message_id, user_id, author_name, text, media,
              reply_to_message_id, text_sha256, is_from_self, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                msg.chat_id,
                msg.thread_id,
                msg.message_id,
                msg.user_id,
                msg.author_name,
                msg.text,
                media,
                msg.reply_to_message_id,
                key,
                msg.is_from_self as i64,
                msg.timestamp.to_rfc3339(),
            ],
        )?;
        if n == 0 {
            debug!(chat_id = msg.chat_id, message_id = msg.message_id, "duplicate message ignored");
            return Ok(None);
        }
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO messages_fts(rowid, text) VALUES(?1, ?2)",
            rusqlite::params![id, msg.text],
        )?;
        Ok(Some(id))
    }

    pub fn get_message(&self, id: i64) -> Result<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{MESSAGE_SELECT} WHERE id = ?1"))?;
        let msg = stmt.query_row([id], row_to_message)??;
        Ok(msg)
    }

    /// Most recent messages in a (chat, thread), oldest first.
    pub fn recent_in_scope(&self, scope: ChatScope, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT}
             WHERE chat_id = ?1 AND (?2 IS NULL AND thread_id IS NULL OR thread_id = ?2)
             ORDER BY id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![scope.chat_id, scope.thread_id, limit],
            row_to_message,
        )?;
        let mut msgs = collect_rows(rows)?;
        msgs.reverse();
        Ok(msgs)
    }

    /// Most recent messages in the whole chat regardless of thread, oldest
    /// first. Emergency-fallback tier for the context assembler.
    pub fn recent_in_chat(&self, chat_id: i64, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT} WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![chat_id, limit], row_to_message)?;
        let mut msgs = collect_rows(rows)?;
        msgs.reverse();
        Ok(msgs)
    }

    /// All messages of a (chat, thread) between two row ids inclusive —
    /// the span a closed window covers.
    pub fn messages_in_range(
        &self,
        scope: ChatScope,
        first_id: i64,
        last_id: i64,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT}
             WHERE chat_id = ?1 AND (?2 IS NULL AND thread_id IS NULL OR thread_id = ?2)
               AND id >= ?3 AND id <= ?4
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![scope.chat_id, scope.thread_id, first_id, last_id],
            row_to_message,
        )?;
        collect_rows(rows)
    }

    /// Full-text keyword search over message text within a chat.
    ///
    /// Returns `(message, rank)` pairs, best first. The query is rebuilt
    /// from its alphanumeric tokens so user punctuation cannot break the
    /// FTS5 syntax.
    pub fn keyword_search(
        &self,
        chat_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(StoredMessage, f64)>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS}, f.rank
             FROM messages m
             JOIN messages_fts f ON m.id = f.rowid
             WHERE m.chat_id = ?1 AND messages_fts MATCH ?2
             ORDER BY f.rank
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(rusqlite::params![chat_id, fts_query, limit], |row| {
            let msg = row_to_message(row)?;
            let rank: f64 = row.get(13)?;
            Ok((msg, rank))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (msg, rank) = r?;
            out.push((msg?, rank));
        }
        Ok(out)
    }

    /// Recent messages of a chat that have a cached embedding under
    /// `model_id`, newest first, with their vectors. Candidate pool for
    /// semantic retrieval — bounded so the scan stays cheap.
    pub fn semantic_candidates(
        &self,
        chat_id: i64,
        model_id: &str,
        limit: usize,
    ) -> Result<Vec<(StoredMessage, Vec<f32>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS}, e.vector
             FROM messages m
             JOIN embedding_cache e
               ON e.text_sha256 = m.text_sha256 AND e.model_id = ?2
             WHERE m.chat_id = ?1
             ORDER BY m.id DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(rusqlite::params![chat_id, model_id, limit], |row| {
            let msg = row_to_message(row)?;
            let blob: Vec<u8> = row.get(13)?;
            Ok((msg, blob))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (msg, blob) = r?;
            out.push((msg?, blob_to_vec(&blob)?));
        }
        Ok(out)
    }

    /// Delete messages older than `cutoff` without a retention flag.
    /// Returns the number of rows pruned.
    pub fn prune_messages(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = cutoff.to_rfc3339();
        // FTS rows first — the external-content table needs explicit deletes.
        let expired: Vec<(i64, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, text FROM messages
                 WHERE timestamp < ?1 AND retention_flag = 0",
            )?;
            let rows = stmt.query_map([&cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.filter_map(|r| r.ok()).collect()
        };
        for (id, text) in &expired {
            conn.execute(
                "INSERT INTO messages_fts(messages_fts, rowid, text) VALUES('delete', ?1, ?2)",
                rusqlite::params![id, text],
            )?;
        }
        let n = conn.execute(
            "DELETE FROM messages WHERE timestamp < ?1 AND retention_flag = 0",
            [&cutoff],
        )?;
        Ok(n)
    }
}

const MESSAGE_COLS: &str = "m.id, m.chat_id, m.thread_id, m.message_id, m.user_id, \
     m.author_name, m.text, m.media, m.reply_to_message_id, m.text_sha256, \
     m.retention_flag, m.is_from_self, m.timestamp";

const MESSAGE_SELECT: &str = "SELECT m.id, m.chat_id, m.thread_id, m.message_id, m.user_id, \
     m.author_name, m.text, m.media, m.reply_to_message_id, m.text_sha256, \
     m.retention_flag, m.is_from_self, m.timestamp FROM messages m";

/// Quote each alphanumeric token so arbitrary user text is a valid FTS5 query.
fn build_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

type MessageRow = rusqlite::Result<Result<StoredMessage>>;

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<StoredMessage>> {
    let media_json: String = row.get(7)?;
    let ts: String = row.get(12)?;
    Ok((|| {
        Ok(StoredMessage {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            thread_id: row.get(2)?,
            message_id: row.get(3)?,
            user_id: row.get(4)?,
            author_name: row.get(5)?,
            text: row.get(6)?,
            media: serde_json::from_str(&media_json)?,
            reply_to_message_id: row.get(8)?,
            text_sha256: row.get(9)?,
            retention_flag: row.get::<_, i64>(10)? != 0,
            is_from_self: row.get::<_, i64>(11)? != 0,
            timestamp: parse_ts(ts)?,
        })
    })())
}

fn collect_rows(
    rows: impl Iterator<Item = MessageRow>,
) -> Result<Vec<StoredMessage>> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r??);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn inbound(chat_id: i64, message_id: i64, user_id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id,
            thread_id: None,
            message_id,
            user_id,
            author_name: format!("user{user_id}"),
            text: text.to_string(),
            media_refs: vec![],
            has_user_media: false,
            reply_to_message_id: None,
            is_from_self: false,
            addressed: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn insert_is_idempotent_on_platform_id() {
        let store = FactStore::open_in_memory().unwrap();
        let msg = inbound(-100, 1, 42, "hello world");
        let first = store.insert_message(&msg).unwrap();
        assert!(first.is_some());
        let second = store.insert_message(&msg).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn recent_in_scope_is_chronological() {
        let store = FactStore::open_in_memory().unwrap();
        for i in 1..=5 {
            store
                .insert_message(&inbound(-100, i, 42, &format!("message number {i}")))
                .unwrap();
        }
        let msgs = store
            .recent_in_scope(ChatScope::new(-100, None), 3)
            .unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].message_id, 3);
        assert_eq!(msgs[2].message_id, 5);
    }

    #[test]
    fn keyword_search_finds_matching_text() {
        let store = FactStore::open_in_memory().unwrap();
        store
            .insert_message(&inbound(-100, 1, 1, "we deployed the new parser today"))
            .unwrap();
        store
            .insert_message(&inbound(-100, 2, 2, "lunch was great"))
            .unwrap();
        let hits = store.keyword_search(-100, "parser deploy?", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.message_id, 1);
    }

    #[test]
    fn fts_query_survives_punctuation() {
        assert_eq!(build_fts_query("what's up?"), "\"what\" OR \"s\" OR \"up\"");
        assert_eq!(build_fts_query("!!!"), "");
    }

    #[test]
    fn prune_respects_retention_flag() {
        let store = FactStore::open_in_memory().unwrap();
        let mut old = inbound(-100, 1, 1, "old message");
        old.timestamp = Utc::now() - chrono::Duration::days(60);
        store.insert_message(&old).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE messages SET retention_flag = 1 WHERE message_id = 1", [])
                .unwrap();
        }
        let mut old2 = inbound(-100, 2, 1, "another old message");
        old2.timestamp = Utc::now() - chrono::Duration::days(60);
        store.insert_message(&old2).unwrap();

        let pruned = store
            .prune_messages(Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.recent_in_chat(-100, 10).unwrap().len(), 1);
    }

    #[test]
    fn thread_scope_is_isolated() {
        let store = FactStore::open_in_memory().unwrap();
        let mut threaded = inbound(-100, 1, 1, "in a topic");
        threaded.thread_id = Some(7);
        store.insert_message(&threaded).unwrap();
        store.insert_message(&inbound(-100, 2, 1, "main chat")).unwrap();

        let main = store.recent_in_scope(ChatScope::new(-100, None), 10).unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].message_id, 2);
        let topic = store
            .recent_in_scope(ChatScope::new(-100, Some(7)), 10)
            .unwrap();
        assert_eq!(topic.len(), 1);
        assert_eq!(topic[0].message_id, 1);
    }
}
