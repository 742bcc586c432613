use banter_core::cosine_similarity;
use chrono::Utc;
use rusqlite::Transaction;
use tracing::debug;

use crate::types::{parse_ts, BatchRef, ChangeType, Fact, FactMutation, FactVersion};
use crate::{blob_to_vec, vec_to_blob, FactStore, Result, StoreError};

impl FactStore {
    /// All active facts for one (user, chat).
    pub fn active_facts(&self, user_id: i64, chat_id: i64) -> Result<Vec<Fact>> {
        self.facts_where(user_id, chat_id, true)
    }

    /// All facts for one (user, chat), active and superseded.
    pub fn all_facts(&self, user_id: i64, chat_id: i64) -> Result<Vec<Fact>> {
        self.facts_where(user_id, chat_id, false)
    }

    fn facts_where(&self, user_id: i64, chat_id: i64, active_only: bool) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().unwrap();
        let sql = if active_only {
            format!("{FACT_SELECT} WHERE user_id = ?1 AND chat_id = ?2 AND is_active = 1 ORDER BY id")
        } else {
            format!("{FACT_SELECT} WHERE user_id = ?1 AND chat_id = ?2 ORDER BY id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![user_id, chat_id], row_to_fact)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    pub fn get_fact(&self, id: i64) -> Result<Fact> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{FACT_SELECT} WHERE id = ?1"))?;
        let fact = stmt.query_row([id], row_to_fact)??;
        Ok(fact)
    }

    /// A previously deactivated fact with this exact identity, if any —
    /// candidate for reactivation instead of a fresh insert.
    pub fn find_inactive_fact(
        &self,
        user_id: i64,
        chat_id: i64,
        fact_type: &str,
        key: &str,
        value_canonical: &str,
    ) -> Result<Option<Fact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{FACT_SELECT}
             WHERE user_id = ?1 AND chat_id = ?2 AND fact_type = ?3
               AND key = ?4 AND value_canonical = ?5 AND is_active = 0
             ORDER BY id DESC LIMIT 1"
        ))?;
        let row = stmt
            .query_row(
                rusqlite::params![user_id, chat_id, fact_type, key, value_canonical],
                row_to_fact,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        row.transpose()
    }

    /// Version history for a fact, oldest first.
    pub fn fact_versions(&self, fact_id: i64) -> Result<Vec<FactVersion>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, fact_id, version_number, change_type, old_value, new_value,
                    old_confidence, new_confidence, delta_confidence, reason, created_at
             FROM fact_versions WHERE fact_id = ?1 ORDER BY version_number",
        )?;
        let rows = stmt.query_map([fact_id], row_to_version)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    /// Nearest active facts by cosine similarity of the stored embeddings,
    /// best first. Facts without an embedding are skipped. Brute-force scan
    /// scoped to one (user, chat) — fact counts per user stay small.
    pub fn nearest_facts(
        &self,
        user_id: i64,
        chat_id: i64,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Fact, f64)>> {
        let facts = self.active_facts(user_id, chat_id)?;
        let mut scored: Vec<(Fact, f64)> = facts
            .into_iter()
            .filter_map(|f| {
                let sim = f.embedding.as_ref().map(|e| cosine_similarity(e, query))?;
                Some((f, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Deactivate a fact without a superseding winner (user-requested
    /// forget). Appends a supersession version.
    pub fn deactivate_fact(&self, fact_id: i64, reason: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::from)?;
        let (conf, value) = fact_state(&tx, fact_id)?;
        tx.execute("UPDATE facts SET is_active = 0 WHERE id = ?1", [fact_id])?;
        append_version(
            &tx,
            fact_id,
            ChangeType::Supersession,
            Some(&value),
            &value,
            Some(conf),
            conf,
            Some(reason),
        )?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    /// Apply a batch of fact mutations in a single transaction.
    ///
    /// Every mutation appends exactly one fact version whose
    /// `new_confidence` matches the post-mutation fact row; version numbers
    /// are strictly increasing per fact. On any failure the whole batch
    /// rolls back.
    ///
    /// Returns the row ids of facts created by the batch, in `Create`
    /// order — the indices [`BatchRef::Created`] refers to.
    pub fn apply_fact_batch(&self, batch: &[FactMutation]) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::from)?;
        let mut created: Vec<i64> = Vec::new();

        for mutation in batch {
            apply_one(&tx, mutation, &mut created)?;
        }

        tx.commit().map_err(StoreError::from)?;
        debug!(mutations = batch.len(), created = created.len(), "fact batch committed");
        Ok(created)
    }
}

fn resolve(target: BatchRef, created: &[i64]) -> Result<i64> {
    match target {
        BatchRef::Existing(id) => Ok(id),
        BatchRef::Created(idx) => created.get(idx).copied().ok_or_else(|| {
            StoreError::Corrupt(format!(
                "batch ref #{idx} points past the {} facts created so far",
                created.len()
            ))
        }),
    }
}

fn apply_one(tx: &Transaction<'_>, mutation: &FactMutation, created: &mut Vec<i64>) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    match mutation {
        FactMutation::Create {
            user_id,
            chat_id,
            fact_type,
            key,
            value_canonical,
            confidence,
            source,
            evidence_message_id,
            embedding,
        } => {
            tx.execute(
                "INSERT INTO facts
                 (user_id, chat_id, fact_type, key, value_canonical, confidence,
                  is_active, evidence_message_id, source, embedding,
                  created_at, last_reinforced_at, last_decayed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?10, ?10, ?10)",
                rusqlite::params![
                    user_id,
                    chat_id,
                    fact_type,
                    key,
                    value_canonical,
                    confidence,
                    evidence_message_id,
                    source.to_string(),
                    embedding.as_deref().map(vec_to_blob),
                    now,
                ],
            )?;
            let fact_id = tx.last_insert_rowid();
            created.push(fact_id);
            // Creation carries delta 0: the version-delta ledger sums to
            // current − initial confidence.
            append_version(
                tx,
                fact_id,
                ChangeType::Creation,
                None,
                value_canonical,
                None,
                *confidence,
                None,
            )?;
        }
        FactMutation::Reinforce {
            target,
            new_confidence,
            reason,
        } => {
            let fact_id = resolve(*target, created)?;
            let (old_conf, value) = fact_state(tx, fact_id)?;
            tx.execute(
                "UPDATE facts SET confidence = ?2, last_reinforced_at = ?3 WHERE id = ?1",
                rusqlite::params![fact_id, new_confidence, now],
            )?;
            append_version(
                tx,
                fact_id,
                ChangeType::Reinforcement,
                Some(&value),
                &value,
                Some(old_conf),
                *new_confidence,
                reason.as_deref(),
            )?;
        }
        FactMutation::Evolve {
            target,
            new_value,
            new_confidence,
            new_embedding,
            reason,
        } => {
            let fact_id = resolve(*target, created)?;
            let (old_conf, old_value) = fact_state(tx, fact_id)?;
            tx.execute(
                "UPDATE facts SET value_canonical = ?2, confidence = ?3,
                        embedding = COALESCE(?4, embedding), last_reinforced_at = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    fact_id,
                    new_value,
                    new_confidence,
                    new_embedding.as_deref().map(vec_to_blob),
                    now
                ],
            )?;
            append_version(
                tx,
                fact_id,
                ChangeType::Evolution,
                Some(&old_value),
                new_value,
                Some(old_conf),
                *new_confidence,
                reason.as_deref(),
            )?;
        }
        FactMutation::Correct {
            target,
            new_confidence,
            reason,
        } => {
            let fact_id = resolve(*target, created)?;
            let (old_conf, value) = fact_state(tx, fact_id)?;
            tx.execute(
                "UPDATE facts SET is_active = 1, superseded_by = NULL,
                        confidence = ?2, last_reinforced_at = ?3
                 WHERE id = ?1",
                rusqlite::params![fact_id, new_confidence, now],
            )?;
            append_version(
                tx,
                fact_id,
                ChangeType::Correction,
                Some(&value),
                &value,
                Some(old_conf),
                *new_confidence,
                reason.as_deref(),
            )?;
        }
        FactMutation::Supersede {
            target,
            winner,
            reason,
        } => {
            let fact_id = resolve(*target, created)?;
            let winner_id = resolve(*winner, created)?;
            let (old_conf, value) = fact_state(tx, fact_id)?;
            tx.execute(
                "UPDATE facts SET is_active = 0, superseded_by = ?2 WHERE id = ?1",
                rusqlite::params![fact_id, winner_id],
            )?;
            let reason = reason
                .clone()
                .unwrap_or_else(|| format!("superseded by fact {winner_id}"));
            append_version(
                tx,
                fact_id,
                ChangeType::Supersession,
                Some(&value),
                &value,
                Some(old_conf),
                old_conf,
                Some(&reason),
            )?;
        }
        FactMutation::Decay {
            target,
            new_confidence,
        } => {
            let fact_id = resolve(*target, created)?;
            let (old_conf, value) = fact_state(tx, fact_id)?;
            tx.execute(
                "UPDATE facts SET confidence = ?2, last_decayed_at = ?3 WHERE id = ?1",
                rusqlite::params![fact_id, new_confidence, now],
            )?;
            append_version(
                tx,
                fact_id,
                ChangeType::Correction,
                Some(&value),
                &value,
                Some(old_conf),
                *new_confidence,
                Some("confidence_decay"),
            )?;
        }
    }
    Ok(())
}

/// Current (confidence, value) of a fact inside the transaction.
fn fact_state(tx: &Transaction<'_>, fact_id: i64) -> Result<(f64, String)> {
    tx.query_row(
        "SELECT confidence, value_canonical FROM facts WHERE id = ?1",
        [fact_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            StoreError::Corrupt(format!("mutation targets missing fact {fact_id}"))
        }
        other => other.into(),
    })
}

#[allow(clippy::too_many_arguments)]
fn append_version(
    tx: &Transaction<'_>,
    fact_id: i64,
    change_type: ChangeType,
    old_value: Option<&str>,
    new_value: &str,
    old_confidence: Option<f64>,
    new_confidence: f64,
    reason: Option<&str>,
) -> Result<()> {
    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM fact_versions WHERE fact_id = ?1",
        [fact_id],
        |row| row.get(0),
    )?;
    let delta = match old_confidence {
        Some(old) => new_confidence - old,
        None => 0.0,
    };
    tx.execute(
        "INSERT INTO fact_versions
         (fact_id, version_number, change_type, old_value, new_value,
          old_confidence, new_confidence, delta_confidence, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            fact_id,
            next,
            change_type.to_string(),
            old_value,
            new_value,
            old_confidence,
            new_confidence,
            delta,
            reason,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

const FACT_SELECT: &str = "SELECT id, user_id, chat_id, fact_type, key, value_canonical, \
     confidence, is_active, evidence_message_id, source, embedding, superseded_by, \
     created_at, last_reinforced_at, last_decayed_at FROM facts";

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Fact>> {
    let source: String = row.get(9)?;
    let embedding: Option<Vec<u8>> = row.get(10)?;
    let created_at: String = row.get(12)?;
    let last_reinforced_at: String = row.get(13)?;
    let last_decayed_at: String = row.get(14)?;
    Ok((|| {
        Ok(Fact {
            id: row.get(0)?,
            user_id: row.get(1)?,
            chat_id: row.get(2)?,
            fact_type: row.get(3)?,
            key: row.get(4)?,
            value_canonical: row.get(5)?,
            confidence: row.get(6)?,
            is_active: row.get::<_, i64>(7)? != 0,
            evidence_message_id: row.get(8)?,
            source: source
                .parse()
                .map_err(|e: String| StoreError::Corrupt(e))?,
            embedding: embedding.as_deref().map(blob_to_vec).transpose()?,
            superseded_by: row.get(11)?,
            created_at: parse_ts(created_at)?,
            last_reinforced_at: parse_ts(last_reinforced_at)?,
            last_decayed_at: parse_ts(last_decayed_at)?,
        })
    })())
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<FactVersion>> {
    let change_type: String = row.get(3)?;
    let created_at: String = row.get(10)?;
    Ok((|| {
        Ok(FactVersion {
            id: row.get(0)?,
            fact_id: row.get(1)?,
            version_number: row.get(2)?,
            change_type: change_type
                .parse()
                .map_err(|e: String| StoreError::Corrupt(e))?,
            old_value: row.get(4)?,
            new_value: row.get(5)?,
            old_confidence: row.get(6)?,
            new_confidence: row.get(7)?,
            delta_confidence: row.get(8)?,
            reason: row.get(9)?,
            created_at: parse_ts(created_at)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FactSource;

    fn create_mutation(value: &str, confidence: f64) -> FactMutation {
        FactMutation::Create {
            user_id: 42,
            chat_id: -100,
            fact_type: "personal".to_string(),
            key: "location".to_string(),
            value_canonical: value.to_string(),
            confidence,
            source: FactSource::Window,
            evidence_message_id: None,
            embedding: None,
        }
    }

    #[test]
    fn create_appends_creation_version_with_zero_delta() {
        let store = FactStore::open_in_memory().unwrap();
        let ids = store.apply_fact_batch(&[create_mutation("kyiv", 0.8)]).unwrap();
        assert_eq!(ids.len(), 1);

        let versions = store.fact_versions(ids[0]).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].change_type, ChangeType::Creation);
        assert_eq!(versions[0].version_number, 1);
        assert_eq!(versions[0].delta_confidence, 0.0);
        assert_eq!(versions[0].new_confidence, 0.8);
    }

    #[test]
    fn batch_ref_resolves_facts_created_in_same_batch() {
        let store = FactStore::open_in_memory().unwrap();
        let ids = store
            .apply_fact_batch(&[
                create_mutation("kyiv", 0.8),
                FactMutation::Reinforce {
                    target: BatchRef::Created(0),
                    new_confidence: 0.9,
                    reason: Some("duplicate in batch".to_string()),
                },
            ])
            .unwrap();
        let fact = store.get_fact(ids[0]).unwrap();
        assert_eq!(fact.confidence, 0.9);
        let versions = store.fact_versions(ids[0]).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].change_type, ChangeType::Reinforcement);
    }

    #[test]
    fn version_deltas_sum_to_confidence_change() {
        let store = FactStore::open_in_memory().unwrap();
        let ids = store.apply_fact_batch(&[create_mutation("kyiv", 0.8)]).unwrap();
        store
            .apply_fact_batch(&[
                FactMutation::Reinforce {
                    target: BatchRef::Existing(ids[0]),
                    new_confidence: 0.9,
                    reason: None,
                },
                FactMutation::Decay {
                    target: BatchRef::Existing(ids[0]),
                    new_confidence: 0.85,
                },
            ])
            .unwrap();

        let fact = store.get_fact(ids[0]).unwrap();
        let versions = store.fact_versions(ids[0]).unwrap();
        let initial = versions[0].new_confidence;
        let delta_sum: f64 = versions.iter().map(|v| v.delta_confidence).sum();
        assert!((delta_sum - (fact.confidence - initial)).abs() < 1e-9);
    }

    #[test]
    fn supersession_deactivates_and_links_winner() {
        let store = FactStore::open_in_memory().unwrap();
        let old = store.apply_fact_batch(&[create_mutation("manager", 0.75)]).unwrap()[0];
        let ids = store
            .apply_fact_batch(&[
                create_mutation("developer", 0.85),
                FactMutation::Supersede {
                    target: BatchRef::Existing(old),
                    winner: BatchRef::Created(0),
                    reason: None,
                },
            ])
            .unwrap();

        let loser = store.get_fact(old).unwrap();
        assert!(!loser.is_active);
        assert_eq!(loser.superseded_by, Some(ids[0]));
        let versions = store.fact_versions(old).unwrap();
        assert_eq!(versions.last().unwrap().change_type, ChangeType::Supersession);

        let active = store.active_facts(42, -100).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].value_canonical, "developer");
    }

    #[test]
    fn correction_reactivates_a_superseded_row() {
        let store = FactStore::open_in_memory().unwrap();
        let old = store.apply_fact_batch(&[create_mutation("kyiv", 0.8)]).unwrap()[0];
        let winner = store
            .apply_fact_batch(&[
                create_mutation("lviv", 0.9),
                FactMutation::Supersede {
                    target: BatchRef::Existing(old),
                    winner: BatchRef::Created(0),
                    reason: None,
                },
            ])
            .unwrap()[0];

        let inactive = store
            .find_inactive_fact(42, -100, "personal", "location", "kyiv")
            .unwrap()
            .unwrap();
        assert_eq!(inactive.id, old);

        store
            .apply_fact_batch(&[
                FactMutation::Supersede {
                    target: BatchRef::Existing(winner),
                    winner: BatchRef::Existing(old),
                    reason: None,
                },
                FactMutation::Correct {
                    target: BatchRef::Existing(old),
                    new_confidence: 0.85,
                    reason: Some("user moved back".to_string()),
                },
            ])
            .unwrap();

        let fact = store.get_fact(old).unwrap();
        assert!(fact.is_active);
        assert_eq!(fact.confidence, 0.85);
        assert!(fact.superseded_by.is_none());
    }

    #[test]
    fn batch_failure_rolls_back_everything() {
        let store = FactStore::open_in_memory().unwrap();
        let result = store.apply_fact_batch(&[
            create_mutation("kyiv", 0.8),
            FactMutation::Reinforce {
                target: BatchRef::Created(5), // out of range
                new_confidence: 0.9,
                reason: None,
            },
        ]);
        assert!(result.is_err());
        assert!(store.active_facts(42, -100).unwrap().is_empty());
    }

    #[test]
    fn nearest_facts_orders_by_similarity() {
        let store = FactStore::open_in_memory().unwrap();
        let mut a = create_mutation("kyiv", 0.8);
        if let FactMutation::Create { embedding, .. } = &mut a {
            *embedding = Some(vec![1.0, 0.0, 0.0]);
        }
        let mut b = create_mutation("javascript", 0.8);
        if let FactMutation::Create {
            key,
            fact_type,
            embedding,
            ..
        } = &mut b
        {
            *key = "language".to_string();
            *fact_type = "skill".to_string();
            *embedding = Some(vec![0.0, 1.0, 0.0]);
        }
        store.apply_fact_batch(&[a, b]).unwrap();

        let hits = store
            .nearest_facts(42, -100, &[0.9, 0.1, 0.0], 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.value_canonical, "kyiv");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn active_uniqueness_is_enforced() {
        let store = FactStore::open_in_memory().unwrap();
        store.apply_fact_batch(&[create_mutation("kyiv", 0.8)]).unwrap();
        // Same identity active twice violates the partial unique index.
        assert!(store.apply_fact_batch(&[create_mutation("kyiv", 0.9)]).is_err());
    }
}
