use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::types::{parse_ts, Decision, ProactiveEvent, Reaction};
use crate::{FactStore, Result, StoreError};

/// A proactive decision ready to be recorded.
#[derive(Debug, Clone)]
pub struct NewProactiveEvent {
    pub chat_id: i64,
    pub window_id: i64,
    pub user_id: Option<i64>,
    pub intent_type: String,
    pub intent_confidence: f64,
    pub adjusted_confidence: f64,
    pub block_reason: Option<String>,
    pub response_message_id: Option<i64>,
}

/// Result of a serialized SEND record attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The SEND row was written.
    Recorded(i64),
    /// Another send slipped in inside the cooldown; a SUPPRESS row was
    /// written instead.
    CooldownRaced,
}

/// Aggregated reaction history for one user in one chat.
#[derive(Debug, Clone, Default)]
pub struct ReactionStats {
    pub positive: u32,
    pub negative: u32,
    pub neutral: u32,
    pub ignored: u32,
    /// Ignored streak over the most recent reacted events.
    pub consecutive_ignored: u32,
}

impl ReactionStats {
    pub fn total(&self) -> u32 {
        self.positive + self.negative + self.neutral + self.ignored
    }
}

impl FactStore {
    /// Record a SUPPRESS decision with its block reason.
    pub fn record_suppress(&self, ev: &NewProactiveEvent) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        insert_event(&conn, ev, Decision::Suppress)?;
        Ok(conn.last_insert_rowid())
    }

    /// Record a SEND decision, re-checking the global cooldown inside the
    /// same transaction that writes the row. This serializes SEND decisions
    /// per chat: two workers cannot both record a send within the cooldown.
    pub fn record_send(
        &self,
        ev: &NewProactiveEvent,
        global_cooldown: Duration,
    ) -> Result<SendOutcome> {
        if ev.response_message_id.is_none() {
            return Err(StoreError::Corrupt(
                "SEND event requires a response_message_id".to_string(),
            ));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::from)?;

        let latest: Option<String> = tx
            .query_row(
                "SELECT MAX(created_at) FROM proactive_events
                 WHERE chat_id = ?1 AND decision = 'send'",
                [ev.chat_id],
                |row| row.get(0),
            )
            .ok()
            .flatten();

        if let Some(ts) = latest {
            let last = parse_ts(ts)?;
            if Utc::now() - last < global_cooldown {
                debug!(chat_id = ev.chat_id, "send raced into global cooldown, suppressing");
                let mut suppressed = ev.clone();
                suppressed.block_reason = Some("global_cooldown".to_string());
                suppressed.response_message_id = None;
                insert_event(&tx, &suppressed, Decision::Suppress)?;
                tx.commit().map_err(StoreError::from)?;
                return Ok(SendOutcome::CooldownRaced);
            }
        }

        insert_event(&tx, ev, Decision::Send)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(StoreError::from)?;
        info!(chat_id = ev.chat_id, window_id = ev.window_id, "proactive send recorded");
        Ok(SendOutcome::Recorded(id))
    }

    /// Timestamp of the most recent SENT event in a chat.
    pub fn latest_sent_at(&self, chat_id: i64) -> Result<Option<DateTime<Utc>>> {
        self.latest_sent_where(
            "chat_id = ?1 AND decision = 'send'",
            rusqlite::params![chat_id],
        )
    }

    /// Timestamp of the most recent SENT event targeted at a user.
    pub fn latest_sent_at_for_user(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        self.latest_sent_where(
            "chat_id = ?1 AND user_id = ?2 AND decision = 'send'",
            rusqlite::params![chat_id, user_id],
        )
    }

    /// Timestamp of the most recent SENT event with a given intent in a chat.
    pub fn latest_sent_at_for_intent(
        &self,
        chat_id: i64,
        intent: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.latest_sent_where(
            "chat_id = ?1 AND intent_type = ?2 AND decision = 'send'",
            rusqlite::params![chat_id, intent],
        )
    }

    fn latest_sent_where(
        &self,
        predicate: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let ts: Option<String> = conn
            .query_row(
                &format!("SELECT MAX(created_at) FROM proactive_events WHERE {predicate}"),
                params,
                |row| row.get(0),
            )
            .ok()
            .flatten();
        ts.map(parse_ts).transpose()
    }

    /// Number of SENT events in a chat since `since`.
    pub fn sent_count_since(&self, chat_id: i64, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM proactive_events
             WHERE chat_id = ?1 AND decision = 'send' AND created_at >= ?2",
            rusqlite::params![chat_id, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    /// Reaction history for the preference multiplier. Pending events
    /// (sent, no reaction yet) are excluded.
    pub fn reaction_stats(&self, user_id: i64, chat_id: i64) -> Result<ReactionStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_reaction FROM proactive_events
             WHERE chat_id = ?1 AND user_id = ?2 AND decision = 'send'
               AND user_reaction IS NOT NULL
             ORDER BY created_at DESC",
        )?;
        let reactions: Vec<String> = stmt
            .query_map(rusqlite::params![chat_id, user_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        let mut stats = ReactionStats::default();
        let mut streak_open = true;
        for r in &reactions {
            let reaction: Reaction = r
                .parse()
                .map_err(|e: String| StoreError::Corrupt(e))?;
            match reaction {
                Reaction::Positive => stats.positive += 1,
                Reaction::Negative => stats.negative += 1,
                Reaction::Neutral => stats.neutral += 1,
                Reaction::Ignored => stats.ignored += 1,
            }
            if streak_open {
                if reaction == Reaction::Ignored {
                    stats.consecutive_ignored += 1;
                } else {
                    streak_open = false;
                }
            }
        }
        Ok(stats)
    }

    /// Attach a user reaction to a sent event.
    pub fn record_reaction(
        &self,
        event_id: i64,
        reaction: Reaction,
        delay_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE proactive_events
             SET user_reaction = ?2, reaction_delay_ms = ?3
             WHERE id = ?1 AND decision = 'send' AND user_reaction IS NULL",
            rusqlite::params![event_id, reaction.to_string(), delay_ms],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!(
                "pending sent event {event_id}"
            )));
        }
        Ok(())
    }

    /// The SENT event whose reply message matches, if it is still awaiting
    /// a reaction.
    pub fn find_pending_by_response(
        &self,
        chat_id: i64,
        response_message_id: i64,
    ) -> Result<Option<ProactiveEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{EVENT_SELECT}
             WHERE chat_id = ?1 AND response_message_id = ?2
               AND decision = 'send' AND user_reaction IS NULL
             ORDER BY id DESC LIMIT 1"
        ))?;
        let row = stmt
            .query_row(
                rusqlite::params![chat_id, response_message_id],
                row_to_event,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        row.transpose()
    }

    /// Convert SENT events past the reaction timeout into `ignored`.
    /// Returns the number of events expired.
    pub fn expire_unreacted(&self, timeout: Duration) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - timeout).to_rfc3339();
        let n = conn.execute(
            "UPDATE proactive_events
             SET user_reaction = 'ignored', reaction_delay_ms = NULL
             WHERE decision = 'send' AND user_reaction IS NULL AND created_at < ?1",
            [cutoff],
        )?;
        Ok(n)
    }

    pub fn get_proactive_event(&self, id: i64) -> Result<ProactiveEvent> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{EVENT_SELECT} WHERE id = ?1"))?;
        let ev = stmt.query_row([id], row_to_event)??;
        Ok(ev)
    }
}

fn insert_event(
    conn: &rusqlite::Connection,
    ev: &NewProactiveEvent,
    decision: Decision,
) -> Result<()> {
    conn.execute(
        "INSERT INTO proactive_events
         (chat_id, window_id, user_id, intent_type, intent_confidence,
          adjusted_confidence, decision, block_reason, response_message_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            ev.chat_id,
            ev.window_id,
            ev.user_id,
            ev.intent_type,
            ev.intent_confidence,
            ev.adjusted_confidence,
            decision.to_string(),
            ev.block_reason,
            ev.response_message_id,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

const EVENT_SELECT: &str = "SELECT id, chat_id, window_id, user_id, intent_type, \
     intent_confidence, adjusted_confidence, decision, block_reason, \
     response_message_id, user_reaction, reaction_delay_ms, created_at \
     FROM proactive_events";

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ProactiveEvent>> {
    let decision: String = row.get(7)?;
    let reaction: Option<String> = row.get(10)?;
    let created_at: String = row.get(12)?;
    Ok((|| {
        Ok(ProactiveEvent {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            window_id: row.get(2)?,
            user_id: row.get(3)?,
            intent_type: row.get(4)?,
            intent_confidence: row.get(5)?,
            adjusted_confidence: row.get(6)?,
            decision: decision
                .parse()
                .map_err(|e: String| StoreError::Corrupt(e))?,
            block_reason: row.get(8)?,
            response_message_id: row.get(9)?,
            user_reaction: reaction
                .map(|r| r.parse().map_err(|e: String| StoreError::Corrupt(e)))
                .transpose()?,
            reaction_delay_ms: row.get(11)?,
            created_at: parse_ts(created_at)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(chat_id: i64, window_id: i64) -> NewProactiveEvent {
        NewProactiveEvent {
            chat_id,
            window_id,
            user_id: Some(42),
            intent_type: "question".to_string(),
            intent_confidence: 0.9,
            adjusted_confidence: 0.9,
            block_reason: None,
            response_message_id: Some(500),
        }
    }

    #[test]
    fn send_requires_response_message_id() {
        let store = FactStore::open_in_memory().unwrap();
        let mut ev = event(-100, 1);
        ev.response_message_id = None;
        assert!(matches!(
            store.record_send(&ev, Duration::seconds(300)),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn second_send_within_cooldown_is_suppressed() {
        let store = FactStore::open_in_memory().unwrap();
        let first = store
            .record_send(&event(-100, 1), Duration::seconds(300))
            .unwrap();
        assert!(matches!(first, SendOutcome::Recorded(_)));

        let second = store
            .record_send(&event(-100, 2), Duration::seconds(300))
            .unwrap();
        assert_eq!(second, SendOutcome::CooldownRaced);

        // Only one SENT row exists; the raced attempt is recorded as suppressed.
        assert_eq!(store.sent_count_since(-100, Utc::now() - Duration::hours(1)).unwrap(), 1);
    }

    #[test]
    fn cooldowns_are_scoped_per_chat() {
        let store = FactStore::open_in_memory().unwrap();
        store.record_send(&event(-100, 1), Duration::seconds(300)).unwrap();
        let other_chat = store
            .record_send(&event(-200, 2), Duration::seconds(300))
            .unwrap();
        assert!(matches!(other_chat, SendOutcome::Recorded(_)));
    }

    #[test]
    fn reaction_stats_track_streaks() {
        let store = FactStore::open_in_memory().unwrap();
        for i in 0..4 {
            let mut ev = event(-100, i);
            ev.response_message_id = Some(500 + i);
            let outcome = store.record_send(&ev, Duration::zero()).unwrap();
            let SendOutcome::Recorded(id) = outcome else {
                panic!("expected recorded");
            };
            let reaction = if i == 0 {
                Reaction::Positive
            } else {
                Reaction::Ignored
            };
            store.record_reaction(id, reaction, 1000).unwrap();
        }

        let stats = store.reaction_stats(42, -100).unwrap();
        assert_eq!(stats.positive, 1);
        assert_eq!(stats.ignored, 3);
        assert_eq!(stats.consecutive_ignored, 3);
        assert_eq!(stats.total(), 4);
    }

    #[test]
    fn expire_unreacted_marks_ignored() {
        let store = FactStore::open_in_memory().unwrap();
        store.record_send(&event(-100, 1), Duration::zero()).unwrap();
        // Nothing expires inside the timeout.
        assert_eq!(store.expire_unreacted(Duration::seconds(600)).unwrap(), 0);
        // Everything expires with a zero timeout.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.expire_unreacted(Duration::zero()).unwrap(), 1);
        let stats = store.reaction_stats(42, -100).unwrap();
        assert_eq!(stats.ignored, 1);
    }

    #[test]
    fn pending_event_found_by_response_id() {
        let store = FactStore::open_in_memory().unwrap();
        store.record_send(&event(-100, 1), Duration::zero()).unwrap();
        let found = store.find_pending_by_response(-100, 500).unwrap();
        assert!(found.is_some());
        let ev = found.unwrap();
        store.record_reaction(ev.id, Reaction::Positive, 1500).unwrap();
        // No longer pending.
        assert!(store.find_pending_by_response(-100, 500).unwrap().is_none());
    }
}
