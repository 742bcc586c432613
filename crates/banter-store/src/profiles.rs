use chrono::Utc;
use tracing::debug;

use crate::types::{parse_ts, parse_ts_opt, Profile};
use crate::{FactStore, Result};

impl FactStore {
    /// Create the profile on first sight or bump `last_seen` /
    /// `interaction_count` on every subsequent message. A changed display
    /// name is appended to the alias list.
    pub fn upsert_profile(&self, user_id: i64, chat_id: i64, display_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT display_name, aliases FROM profiles
                 WHERE user_id = ?1 AND chat_id = ?2",
                rusqlite::params![user_id, chat_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        match existing {
            Some((current_name, aliases_json)) => {
                let mut aliases: Vec<String> = serde_json::from_str(&aliases_json)?;
                // A renamed user keeps their old name as an alias.
                if current_name != display_name && !aliases.iter().any(|a| a == &current_name) {
                    debug!(user_id, chat_id, old = %current_name, new = display_name, "recording profile alias");
                    aliases.push(current_name.clone());
                }
                conn.execute(
                    "UPDATE profiles
                     SET display_name = ?3, aliases = ?4, last_seen = ?5,
                         interaction_count = interaction_count + 1
                     WHERE user_id = ?1 AND chat_id = ?2",
                    rusqlite::params![
                        user_id,
                        chat_id,
                        display_name,
                        serde_json::to_string(&aliases)?,
                        now
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO profiles
                     (user_id, chat_id, display_name, aliases, first_seen, last_seen,
                      interaction_count)
                     VALUES (?1, ?2, ?3, '[]', ?4, ?4, 1)",
                    rusqlite::params![user_id, chat_id, display_name, now],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_profile(&self, user_id: i64, chat_id: i64) -> Result<Option<Profile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, chat_id, display_name, aliases, first_seen, last_seen,
                    interaction_count, summary_text, summary_version, summary_updated_at,
                    is_active
             FROM profiles WHERE user_id = ?1 AND chat_id = ?2",
        )?;
        let row = stmt
            .query_row(rusqlite::params![user_id, chat_id], row_to_profile)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        row.transpose()
    }

    /// Profiles for a set of users in one chat, used to hand participant
    /// context to the fact extractor.
    pub fn get_profiles(&self, user_ids: &[i64], chat_id: i64) -> Result<Vec<Profile>> {
        let mut out = Vec::with_capacity(user_ids.len());
        for &uid in user_ids {
            if let Some(p) = self.get_profile(uid, chat_id)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    /// Replace the synthesized profile summary and bump its version.
    pub fn set_profile_summary(&self, user_id: i64, chat_id: i64, summary: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = conn.execute(
            "UPDATE profiles
             SET summary_text = ?3, summary_version = summary_version + 1,
                 summary_updated_at = ?4
             WHERE user_id = ?1 AND chat_id = ?2",
            rusqlite::params![user_id, chat_id, summary, now],
        )?;
        if n == 0 {
            return Err(crate::StoreError::NotFound(format!(
                "profile ({user_id}, {chat_id})"
            )));
        }
        Ok(())
    }

    /// Deactivate a profile. Admin-only path: nothing in the pipeline
    /// deactivates profiles.
    pub fn deactivate_profile(&self, user_id: i64, chat_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE profiles SET is_active = 0 WHERE user_id = ?1 AND chat_id = ?2",
            rusqlite::params![user_id, chat_id],
        )?;
        Ok(())
    }
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Profile>> {
    let aliases_json: String = row.get(3)?;
    let first_seen: String = row.get(4)?;
    let last_seen: String = row.get(5)?;
    let summary_updated_at: Option<String> = row.get(9)?;
    Ok((|| {
        Ok(Profile {
            user_id: row.get(0)?,
            chat_id: row.get(1)?,
            display_name: row.get(2)?,
            aliases: serde_json::from_str(&aliases_json)?,
            first_seen: parse_ts(first_seen)?,
            last_seen: parse_ts(last_seen)?,
            interaction_count: row.get(6)?,
            summary_text: row.get(7)?,
            summary_version: row.get(8)?,
            summary_updated_at: parse_ts_opt(summary_updated_at)?,
            is_active: row.get::<_, i64>(10)? != 0,
        })
    })())
}
