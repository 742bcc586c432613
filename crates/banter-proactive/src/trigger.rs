//! The proactive trigger: ordered gates between a classified window and an
//! unsolicited reply.
//!
//! Gates run in a fixed order and the first failure suppresses with its
//! reason. The final gate folds the user's reaction history into a
//! preference multiplier — users who ignore or dislike proactive replies
//! stop getting them.

use std::sync::Arc;

use banter_core::config::ProactiveConfig;
use banter_store::proactive::ReactionStats;
use banter_store::types::{StoredMessage, WindowRecord};
use banter_store::{FactStore, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::intent::{Intent, IntentClassification};

/// Outcome of the gate list for one window.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// All gates passed: a reply should be generated and sent.
    Send {
        /// The window's primary participant (most messages).
        user_id: i64,
        adjusted_confidence: f64,
    },
    Suppress {
        block_reason: String,
        /// Multiplier-adjusted confidence, when evaluation got that far.
        adjusted_confidence: f64,
        user_id: Option<i64>,
    },
}

pub struct ProactiveTrigger {
    store: Arc<FactStore>,
    cfg: ProactiveConfig,
}

impl ProactiveTrigger {
    pub fn new(store: Arc<FactStore>, cfg: ProactiveConfig) -> Self {
        Self { store, cfg }
    }

    /// Run the gates for a closed window. Read-only: recording the
    /// resulting event (and serializing sends) happens at the caller.
    pub fn evaluate(
        &self,
        window: &WindowRecord,
        messages: &[StoredMessage],
        intent: &IntentClassification,
    ) -> Result<TriggerOutcome> {
        let now = Utc::now();
        let suppress = |reason: &str, adjusted: f64, user_id: Option<i64>| {
            debug!(window_id = window.id, reason, "proactive suppressed");
            Ok(TriggerOutcome::Suppress {
                block_reason: reason.to_string(),
                adjusted_confidence: adjusted,
                user_id,
            })
        };

        // 1. Feature gate.
        if !self.cfg.enabled {
            return suppress("disabled", 0.0, None);
        }
        // 2. Enough conversation to react to.
        if (window.message_count as usize) < self.cfg.min_messages {
            return suppress("window_too_small", 0.0, None);
        }
        // 3. The agent stays quiet in windows it already spoke in.
        if messages.iter().any(|m| m.is_from_self) {
            return suppress("agent_participated", 0.0, None);
        }
        // 4. The conversation must still be warm.
        let last_at = messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(window.opened_at);
        if now - last_at > Duration::seconds(self.cfg.max_window_age_seconds as i64) {
            return suppress("window_stale", 0.0, None);
        }
        // 5. The model saw an opening.
        if intent.intent == Intent::None {
            return suppress("no_intent", 0.0, None);
        }
        // 6. Global per-chat cooldown.
        if within(
            self.store.latest_sent_at(window.chat_id)?,
            now,
            self.cfg.global_cooldown_seconds,
        ) {
            return suppress("global_cooldown", 0.0, None);
        }
        // 7. Per-user cooldown for the primary participant.
        let user_id = primary_participant(messages).unwrap_or(0);
        if within(
            self.store.latest_sent_at_for_user(user_id, window.chat_id)?,
            now,
            self.cfg.user_cooldown_seconds,
        ) {
            return suppress("user_cooldown", 0.0, Some(user_id));
        }
        // 8. Per-intent cooldown for the chat.
        if within(
            self.store
                .latest_sent_at_for_intent(window.chat_id, &intent.intent.to_string())?,
            now,
            self.cfg.intent_cooldown_seconds,
        ) {
            return suppress("intent_cooldown", 0.0, Some(user_id));
        }
        // 9. Hourly and daily rate limits.
        let hourly = self
            .store
            .sent_count_since(window.chat_id, now - Duration::hours(1))?;
        if hourly >= self.cfg.hourly_limit {
            return suppress("hourly_limit", 0.0, Some(user_id));
        }
        let daily = self
            .store
            .sent_count_since(window.chat_id, now - Duration::days(1))?;
        if daily >= self.cfg.daily_limit {
            return suppress("daily_limit", 0.0, Some(user_id));
        }
        // 10. Learned preference multiplier.
        let stats = self.store.reaction_stats(user_id, window.chat_id)?;
        if stats.consecutive_ignored >= 3 {
            return suppress("user_ignores", 0.0, Some(user_id));
        }
        let multiplier = preference_multiplier(&stats);
        let adjusted = intent.confidence * multiplier;
        if adjusted < self.cfg.min_confidence {
            return suppress("low_confidence", adjusted, Some(user_id));
        }

        debug!(
            window_id = window.id,
            user_id, adjusted, "proactive gates passed"
        );
        Ok(TriggerOutcome::Send {
            user_id,
            adjusted_confidence: adjusted,
        })
    }
}

fn within(latest: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown_seconds: u64) -> bool {
    latest.is_some_and(|at| now - at < Duration::seconds(cooldown_seconds as i64))
}

/// The non-agent author with the most messages in the window; earliest
/// author wins ties.
fn primary_participant(messages: &[StoredMessage]) -> Option<i64> {
    let mut counts: Vec<(i64, usize)> = Vec::new();
    for m in messages.iter().filter(|m| !m.is_from_self) {
        match counts.iter_mut().find(|(id, _)| *id == m.user_id) {
            Some((_, n)) => *n += 1,
            None => counts.push((m.user_id, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(id, _)| id)
}

/// μ ∈ [0, 2]: starts at 1, moves with the user's reaction history.
fn preference_multiplier(stats: &ReactionStats) -> f64 {
    let total = stats.total();
    if total == 0 {
        return 1.0;
    }
    let total = total as f64;
    let positive = stats.positive as f64 / total;
    let negative = stats.negative as f64 / total;
    let ignored = stats.ignored as f64 / total;

    let mut mu: f64 = 1.0;
    if positive >= 0.5 {
        mu += 0.3;
    } else if positive >= 0.3 {
        mu += 0.1;
    }
    if negative >= 0.2 {
        mu -= 0.5;
    } else if negative >= 0.1 {
        mu -= 0.3;
    }
    if ignored >= 0.6 {
        mu -= 0.4;
    } else if ignored >= 0.4 {
        mu -= 0.2;
    }
    mu.clamp(0.0, 2.0)
}
