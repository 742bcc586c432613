use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-message value label assigned by the rule classifier.
///
/// Ordering matters: `High > Medium > Low > Noise`, used to pick a window's
/// dominant value and its queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueLabel {
    Noise,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ValueLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Noise => write!(f, "noise"),
        }
    }
}

impl std::str::FromStr for ValueLabel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "noise" => Ok(Self::Noise),
            other => Err(format!("unknown value label: {other}")),
        }
    }
}

/// Queue priority. `P1` is processed first; FIFO within a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Priority {
    /// Derive queue priority from a window's dominant value label.
    pub fn from_label(label: ValueLabel) -> Self {
        match label {
            ValueLabel::High => Priority::P1,
            ValueLabel::Medium => Priority::P2,
            ValueLabel::Low | ValueLabel::Noise => Priority::P3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P1 => write!(f, "p1"),
            Self::P2 => write!(f, "p2"),
            Self::P3 => write!(f, "p3"),
        }
    }
}

/// Key for anything scoped to a single conversation surface:
/// a chat, or a forum topic inside a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatScope {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

impl ChatScope {
    pub fn new(chat_id: i64, thread_id: Option<i64>) -> Self {
        Self { chat_id, thread_id }
    }
}

impl std::fmt::Display for ChatScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.thread_id {
            Some(t) => write!(f, "{}:{}", self.chat_id, t),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

/// Platform-agnostic inbound message record produced by the chat adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    /// Platform message id — unique within the chat.
    pub message_id: i64,
    pub user_id: i64,
    pub author_name: String,
    pub text: String,
    /// Opaque references to attached media (file ids, sticker ids).
    #[serde(default)]
    pub media_refs: Vec<String>,
    /// True when the media was authored by the user (photo, voice note)
    /// rather than forwarded or a sticker.
    #[serde(default)]
    pub has_user_media: bool,
    pub reply_to_message_id: Option<i64>,
    /// True when the message was authored by the agent itself.
    #[serde(default)]
    pub is_from_self: bool,
    /// True when the message targets the agent (mention, reply, keyword).
    /// Set by the adapter — the predicate is configuration-dependent.
    #[serde(default)]
    pub addressed: bool,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn scope(&self) -> ChatScope {
        ChatScope::new(self.chat_id, self.thread_id)
    }
}

/// Outbound send request handed to the chat adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub text: String,
    pub reply_to_message_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_ordering_puts_high_on_top() {
        assert!(ValueLabel::High > ValueLabel::Medium);
        assert!(ValueLabel::Medium > ValueLabel::Low);
        assert!(ValueLabel::Low > ValueLabel::Noise);
    }

    #[test]
    fn priority_from_label() {
        assert_eq!(Priority::from_label(ValueLabel::High), Priority::P1);
        assert_eq!(Priority::from_label(ValueLabel::Medium), Priority::P2);
        assert_eq!(Priority::from_label(ValueLabel::Low), Priority::P3);
        assert_eq!(Priority::from_label(ValueLabel::Noise), Priority::P3);
    }

    #[test]
    fn label_round_trips_through_display() {
        for label in [
            ValueLabel::High,
            ValueLabel::Medium,
            ValueLabel::Low,
            ValueLabel::Noise,
        ] {
            let parsed: ValueLabel = label.to_string().parse().unwrap();
            assert_eq!(parsed, label);
        }
    }

    #[test]
    fn scope_display_includes_thread() {
        assert_eq!(ChatScope::new(-100, None).to_string(), "-100");
        assert_eq!(ChatScope::new(-100, Some(7)).to_string(), "-100:7");
    }
}
