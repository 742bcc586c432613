//! Reaction tracking: replies to the agent's proactive messages become
//! positive / negative / neutral signals for the preference multiplier.

use banter_core::types::InboundMessage;
use banter_store::types::Reaction;
use tracing::{debug, warn};

use crate::Pipeline;

/// Words and emoji that read as approval.
const POSITIVE_MARKERS: &[&str] = &[
    "thanks", "thank you", "thx", "nice", "great", "helpful", "exactly", "love it",
    "дякую", "дяки", "клас", "класно", "круто", "супер", "корисно", "точно",
    "👍", "❤", "🔥", "💯", "😂", "🙏",
];

/// Words and emoji that read as pushback.
const NEGATIVE_MARKERS: &[&str] = &[
    "stop", "annoying", "wrong", "nobody asked", "shut up", "not helpful", "go away",
    "не треба", "відчепись", "набридло", "неправильно", "замовкни", "хто питав",
    "👎", "🙄", "💩",
];

impl Pipeline {
    /// If `replied_to` is one of our pending proactive replies, classify
    /// the reply's sentiment and record it.
    pub(crate) fn maybe_record_reaction(&self, msg: &InboundMessage, replied_to: i64) {
        let pending = match self.store.find_pending_by_response(msg.chat_id, replied_to) {
            Ok(Some(ev)) => ev,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "reaction lookup failed");
                return;
            }
        };
        let reaction = classify_reaction(&msg.text);
        let delay_ms = (msg.timestamp - pending.created_at).num_milliseconds().max(0);
        match self.store.record_reaction(pending.id, reaction, delay_ms) {
            Ok(()) => debug!(
                event_id = pending.id,
                reaction = %reaction,
                delay_ms,
                "proactive reaction recorded"
            ),
            Err(e) => warn!(error = %e, event_id = pending.id, "reaction record failed"),
        }
    }
}

/// Cheap lexicon sentiment: positive beats negative beats neutral.
pub(crate) fn classify_reaction(text: &str) -> Reaction {
    let lower = text.to_lowercase();
    if POSITIVE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Reaction::Positive;
    }
    if NEGATIVE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Reaction::Negative;
    }
    Reaction::Neutral
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gratitude_is_positive() {
        assert_eq!(classify_reaction("дякую, саме це!"), Reaction::Positive);
        assert_eq!(classify_reaction("Thanks a lot"), Reaction::Positive);
        assert_eq!(classify_reaction("👍"), Reaction::Positive);
    }

    #[test]
    fn pushback_is_negative() {
        assert_eq!(classify_reaction("stop doing that"), Reaction::Negative);
        assert_eq!(classify_reaction("відчепись"), Reaction::Negative);
        assert_eq!(classify_reaction("Nobody asked 🙄"), Reaction::Negative);
    }

    #[test]
    fn anything_else_is_neutral() {
        assert_eq!(classify_reaction("hm, maybe"), Reaction::Neutral);
        assert_eq!(classify_reaction(""), Reaction::Neutral);
    }
}
