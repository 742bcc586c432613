use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a fact came from. Reliability feeds conflict scoring:
/// addressed statements outrank model inference, which outranks
/// whole-window inference, which outranks bare pattern rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactSource {
    /// Extracted from a message that directly addressed the agent.
    Addressed,
    /// Extracted from a closed conversation window.
    Window,
    /// Produced by the pattern-rule extractor.
    Rule,
    /// Produced by the model extractor.
    Model,
}

impl FactSource {
    pub fn reliability(&self) -> f64 {
        match self {
            FactSource::Addressed => 1.0,
            FactSource::Model => 0.8,
            FactSource::Window => 0.7,
            FactSource::Rule => 0.6,
        }
    }
}

impl std::fmt::Display for FactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Addressed => write!(f, "addressed"),
            Self::Window => write!(f, "window"),
            Self::Rule => write!(f, "rule"),
            Self::Model => write!(f, "model"),
        }
    }
}

impl std::str::FromStr for FactSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "addressed" => Ok(Self::Addressed),
            "window" => Ok(Self::Window),
            "rule" => Ok(Self::Rule),
            "model" => Ok(Self::Model),
            other => Err(format!("unknown fact source: {other}")),
        }
    }
}

/// Kind of change a fact version records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Creation,
    Reinforcement,
    Evolution,
    Correction,
    Supersession,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creation => write!(f, "creation"),
            Self::Reinforcement => write!(f, "reinforcement"),
            Self::Evolution => write!(f, "evolution"),
            Self::Correction => write!(f, "correction"),
            Self::Supersession => write!(f, "supersession"),
        }
    }
}

impl std::str::FromStr for ChangeType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creation" => Ok(Self::Creation),
            "reinforcement" => Ok(Self::Reinforcement),
            "evolution" => Ok(Self::Evolution),
            "correction" => Ok(Self::Correction),
            "supersession" => Ok(Self::Supersession),
            other => Err(format!("unknown change type: {other}")),
        }
    }
}

/// Why a window left the OPEN state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosureReason {
    Size,
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Size => write!(f, "size"),
            Self::Timeout => write!(f, "timeout"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl std::str::FromStr for ClosureReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "size" => Ok(Self::Size),
            "timeout" => Ok(Self::Timeout),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(format!("unknown closure reason: {other}")),
        }
    }
}

/// Outcome of a proactive decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Send,
    Suppress,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Suppress => write!(f, "suppress"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(Self::Send),
            "suppress" => Ok(Self::Suppress),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// How a user reacted to a proactive reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Positive,
    Negative,
    Neutral,
    Ignored,
}

impl std::fmt::Display for Reaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Negative => write!(f, "negative"),
            Self::Neutral => write!(f, "neutral"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

impl std::str::FromStr for Reaction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            "ignored" => Ok(Self::Ignored),
            other => Err(format!("unknown reaction: {other}")),
        }
    }
}

/// Emotional tone of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Valence {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

impl std::fmt::Display for Valence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Negative => write!(f, "negative"),
            Self::Neutral => write!(f, "neutral"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

impl std::str::FromStr for Valence {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!("unknown valence: {other}")),
        }
    }
}

/// A message row. Immutable after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    /// Platform message id, unique within the chat.
    pub message_id: i64,
    pub user_id: i64,
    pub author_name: String,
    pub text: String,
    pub media: Vec<String>,
    pub reply_to_message_id: Option<i64>,
    /// Content key linking this row to the embedding cache.
    pub text_sha256: String,
    pub retention_flag: bool,
    pub is_from_self: bool,
    pub timestamp: DateTime<Utc>,
}

/// One row per (user, chat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: i64,
    pub chat_id: i64,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub interaction_count: i64,
    /// Synthesized human-readable description injected into prompts.
    pub summary_text: Option<String>,
    pub summary_version: i64,
    pub summary_updated_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// A structured, confidence-weighted statement about a user within a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub user_id: i64,
    pub chat_id: i64,
    pub fact_type: String,
    pub key: String,
    pub value_canonical: String,
    pub confidence: f64,
    pub is_active: bool,
    pub evidence_message_id: Option<i64>,
    pub source: FactSource,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub superseded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
    pub last_decayed_at: DateTime<Utc>,
}

/// Append-only record of a change to a fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactVersion {
    pub id: i64,
    pub fact_id: i64,
    pub version_number: i64,
    pub change_type: ChangeType,
    pub old_value: Option<String>,
    pub new_value: String,
    pub old_confidence: Option<f64>,
    pub new_confidence: f64,
    pub delta_confidence: f64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A closed window row. OPEN windows live only in the windower's memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRecord {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub message_count: i64,
    pub participants: Vec<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closure_reason: ClosureReason,
    pub dominant_value: String,
    pub processed: bool,
    pub skipped: bool,
    pub failed: bool,
}

/// A durable summary of a longer conversation segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub topic: String,
    pub summary: String,
    pub message_ids: Vec<i64>,
    pub participants: Vec<i64>,
    pub importance: f64,
    pub emotional_valence: Valence,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Record of one proactive decision, sent or suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveEvent {
    pub id: i64,
    pub chat_id: i64,
    pub window_id: i64,
    /// Primary participant of the window the decision was made for.
    pub user_id: Option<i64>,
    pub intent_type: String,
    pub intent_confidence: f64,
    pub adjusted_confidence: f64,
    pub decision: Decision,
    pub block_reason: Option<String>,
    pub response_message_id: Option<i64>,
    pub user_reaction: Option<Reaction>,
    pub reaction_delay_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A reference to a fact inside a mutation batch: either an existing row
/// or a fact created earlier in the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRef {
    Existing(i64),
    /// Index into the batch's `Create` mutations, in order of appearance.
    Created(usize),
}

/// One mutation in an atomic fact batch. The whole batch commits in a
/// single transaction; every mutation appends exactly one fact version.
///
/// Targets are [`BatchRef`]s so a mutation can point at a fact created
/// earlier in the same batch (duplicate candidates merging into a fact the
/// batch itself introduced).
#[derive(Debug, Clone)]
pub enum FactMutation {
    Create {
        user_id: i64,
        chat_id: i64,
        fact_type: String,
        key: String,
        value_canonical: String,
        confidence: f64,
        source: FactSource,
        evidence_message_id: Option<i64>,
        embedding: Option<Vec<f32>>,
    },
    /// Duplicate candidate merged into an older row: confidence boost.
    Reinforce {
        target: BatchRef,
        new_confidence: f64,
        reason: Option<String>,
    },
    /// Same key, new value with higher confidence.
    Evolve {
        target: BatchRef,
        new_value: String,
        new_confidence: f64,
        new_embedding: Option<Vec<f32>>,
        reason: Option<String>,
    },
    /// Reactivate a previously deactivated row.
    Correct {
        target: BatchRef,
        new_confidence: f64,
        reason: Option<String>,
    },
    /// Conflict loser: deactivate, recording the winner.
    Supersede {
        target: BatchRef,
        winner: BatchRef,
        reason: Option<String>,
    },
    /// Confidence decay with no accompanying change.
    Decay {
        target: BatchRef,
        new_confidence: f64,
    },
}

fn row_get_dt(s: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

/// Parse an RFC 3339 column into a UTC timestamp, flagging corruption.
pub(crate) fn parse_ts(s: String) -> crate::Result<DateTime<Utc>> {
    row_get_dt(&s)
}

/// Parse an optional RFC 3339 column.
pub(crate) fn parse_ts_opt(s: Option<String>) -> crate::Result<Option<DateTime<Utc>>> {
    s.map(|v| row_get_dt(&v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_reliability_ordering() {
        assert!(FactSource::Addressed.reliability() > FactSource::Model.reliability());
        assert!(FactSource::Model.reliability() > FactSource::Window.reliability());
        assert!(FactSource::Window.reliability() > FactSource::Rule.reliability());
    }

    #[test]
    fn enums_round_trip_through_strings() {
        for s in ["addressed", "window", "rule", "model"] {
            assert_eq!(s.parse::<FactSource>().unwrap().to_string(), s);
        }
        for s in [
            "creation",
            "reinforcement",
            "evolution",
            "correction",
            "supersession",
        ] {
            assert_eq!(s.parse::<ChangeType>().unwrap().to_string(), s);
        }
        for s in ["positive", "negative", "neutral", "mixed"] {
            assert_eq!(s.parse::<Valence>().unwrap().to_string(), s);
        }
    }
}
