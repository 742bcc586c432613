use chrono::Utc;

use crate::types::{parse_ts, Episode, Valence};
use crate::{FactStore, Result, StoreError};

/// Fields of an episode the monitor produces at finalization.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub topic: String,
    pub summary: String,
    pub message_ids: Vec<i64>,
    pub participants: Vec<i64>,
    pub importance: f64,
    pub emotional_valence: Valence,
    pub tags: Vec<String>,
}

impl FactStore {
    pub fn insert_episode(&self, e: &NewEpisode) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO episodes
             (chat_id, thread_id, topic, summary, message_ids, participants,
              importance, emotional_valence, tags, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            rusqlite::params![
                e.chat_id,
                e.thread_id,
                e.topic,
                e.summary,
                serde_json::to_string(&e.message_ids)?,
                serde_json::to_string(&e.participants)?,
                e.importance.clamp(0.0, 1.0),
                e.emotional_valence.to_string(),
                serde_json::to_string(&e.tags)?,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recently accessed episodes for a chat — the episodic context tier.
    pub fn recent_episodes(&self, chat_id: i64, limit: usize) -> Result<Vec<Episode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{EPISODE_SELECT} WHERE chat_id = ?1 ORDER BY last_accessed_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![chat_id, limit], row_to_episode)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    /// Bump `last_accessed_at` for episodes the assembler just used.
    pub fn touch_episodes(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        for id in ids {
            conn.execute(
                "UPDATE episodes SET last_accessed_at = ?2 WHERE id = ?1",
                rusqlite::params![id, now],
            )?;
        }
        Ok(())
    }
}

const EPISODE_SELECT: &str = "SELECT id, chat_id, thread_id, topic, summary, message_ids, \
     participants, importance, emotional_valence, tags, created_at, last_accessed_at \
     FROM episodes";

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Episode>> {
    let message_ids: String = row.get(5)?;
    let participants: String = row.get(6)?;
    let valence: String = row.get(8)?;
    let tags: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let last_accessed_at: String = row.get(11)?;
    Ok((|| {
        Ok(Episode {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            thread_id: row.get(2)?,
            topic: row.get(3)?,
            summary: row.get(4)?,
            message_ids: serde_json::from_str(&message_ids)?,
            participants: serde_json::from_str(&participants)?,
            importance: row.get(7)?,
            emotional_valence: valence
                .parse()
                .map_err(|e: String| StoreError::Corrupt(e))?,
            tags: serde_json::from_str(&tags)?,
            created_at: parse_ts(created_at)?,
            last_accessed_at: parse_ts(last_accessed_at)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(topic: &str) -> NewEpisode {
        NewEpisode {
            chat_id: -100,
            thread_id: None,
            topic: topic.to_string(),
            summary: format!("The group discussed {topic} at length."),
            message_ids: vec![1, 2, 3],
            participants: vec![42],
            importance: 0.7,
            emotional_valence: Valence::Positive,
            tags: vec!["planning".to_string()],
        }
    }

    #[test]
    fn episode_round_trips() {
        let store = FactStore::open_in_memory().unwrap();
        let id = store.insert_episode(&sample("release planning")).unwrap();
        let eps = store.recent_episodes(-100, 5).unwrap();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].id, id);
        assert_eq!(eps[0].topic, "release planning");
        assert_eq!(eps[0].emotional_valence, Valence::Positive);
        assert_eq!(eps[0].tags, vec!["planning".to_string()]);
    }

    #[test]
    fn importance_is_clamped() {
        let store = FactStore::open_in_memory().unwrap();
        let mut e = sample("overflow");
        e.importance = 3.0;
        store.insert_episode(&e).unwrap();
        assert_eq!(store.recent_episodes(-100, 1).unwrap()[0].importance, 1.0);
    }

    #[test]
    fn touch_reorders_recency() {
        let store = FactStore::open_in_memory().unwrap();
        let a = store.insert_episode(&sample("first")).unwrap();
        let _b = store.insert_episode(&sample("second")).unwrap();
        // Force distinct timestamps before touching.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE episodes SET last_accessed_at = '2020-01-01T00:00:00+00:00' WHERE id = ?1",
                [a],
            )
            .unwrap();
        }
        store.touch_episodes(&[a]).unwrap();
        let eps = store.recent_episodes(-100, 5).unwrap();
        assert_eq!(eps[0].id, a);
    }
}
