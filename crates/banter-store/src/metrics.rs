use chrono::Utc;

use crate::{FactStore, Result};

/// Counters the quality pipeline produces for one processed window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityMetrics {
    pub candidates_seen: u32,
    pub facts_created: u32,
    pub facts_reinforced: u32,
    pub conflicts_resolved: u32,
    pub facts_decayed: u32,
}

impl FactStore {
    /// Write the quality metrics row for a window. At most one row per
    /// window: a retry overwrites the earlier attempt.
    pub fn put_quality_metrics(&self, window_id: i64, m: &QualityMetrics) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO fact_quality_metrics
             (window_id, candidates_seen, facts_created, facts_reinforced,
              conflicts_resolved, facts_decayed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(window_id) DO UPDATE SET
                candidates_seen = excluded.candidates_seen,
                facts_created = excluded.facts_created,
                facts_reinforced = excluded.facts_reinforced,
                conflicts_resolved = excluded.conflicts_resolved,
                facts_decayed = excluded.facts_decayed",
            rusqlite::params![
                window_id,
                m.candidates_seen,
                m.facts_created,
                m.facts_reinforced,
                m.conflicts_resolved,
                m.facts_decayed,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_quality_metrics(&self, window_id: i64) -> Result<Option<QualityMetrics>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT candidates_seen, facts_created, facts_reinforced,
                        conflicts_resolved, facts_decayed
                 FROM fact_quality_metrics WHERE window_id = ?1",
                [window_id],
                |row| {
                    Ok(QualityMetrics {
                        candidates_seen: row.get(0)?,
                        facts_created: row.get(1)?,
                        facts_reinforced: row.get(2)?,
                        conflicts_resolved: row.get(3)?,
                        facts_decayed: row.get(4)?,
                    })
                },
            )
            .ok();
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_round_trip_and_overwrite() {
        let store = FactStore::open_in_memory().unwrap();
        let m = QualityMetrics {
            candidates_seen: 5,
            facts_created: 2,
            facts_reinforced: 1,
            conflicts_resolved: 1,
            facts_decayed: 3,
        };
        store.put_quality_metrics(7, &m).unwrap();
        assert_eq!(store.get_quality_metrics(7).unwrap().unwrap(), m);

        // A retry replaces the earlier row instead of duplicating it.
        let m2 = QualityMetrics {
            candidates_seen: 6,
            ..m
        };
        store.put_quality_metrics(7, &m2).unwrap();
        assert_eq!(store.get_quality_metrics(7).unwrap().unwrap(), m2);
    }
}
