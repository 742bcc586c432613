//! Fact extractors.
//!
//! A closed window plus participant profiles goes in; candidate facts come
//! out. The rule extractor always runs and costs nothing; the model
//! extractor runs only when the window carries at least one medium-value
//! message; the hybrid composes both deterministically — rule candidates
//! first, model candidates only where they add something new.

use std::sync::Arc;

use async_trait::async_trait;
use banter_core::types::ValueLabel;
use banter_store::types::{FactSource, Profile, StoredMessage};
use banter_agent::Provider;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::classify::classify_text;
use crate::normalize::{
    canonicalize, is_known_city, is_known_language, is_known_profession,
};
use crate::{LearnError, Result};

/// A fact candidate emitted by an extractor. Values are raw — the quality
/// pipeline canonicalizes before matching.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFact {
    pub user_id: i64,
    pub fact_type: String,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub evidence_message_id: Option<i64>,
    pub source: FactSource,
}

/// Extractor capability: window + profiles → candidates.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        messages: &[StoredMessage],
        profiles: &[Profile],
    ) -> Result<Vec<CandidateFact>>;
}

// ── Rule stage ────────────────────────────────────────────────────────────

/// Pattern-driven extraction over each participant's text. Bilingual:
/// the chats this runs in mix English and Ukrainian freely.
#[derive(Default)]
pub struct RuleExtractor;

const LOCATION_PATTERNS: &[&str] = &[
    "i live in", "i'm from", "i am from", "im from", "hi from", "greetings from",
    "я з", "я із", "я живу в", "живу в", "мешкаю в", "переїхав до", "переїхала до",
];

const PROFESSION_EXPLICIT: &[&str] = &["i work as a", "i work as", "працюю як"];
const PROFESSION_LOOSE: &[&str] = &["i'm a", "i am a", "я працюю", "я за професією"];

const LANGUAGE_PATTERNS: &[&str] = &[
    "i speak", "i'm learning", "i am learning", "вчу", "розмовляю", "я говорю",
];

const DISLIKE_PATTERNS: &[&str] = &[
    "i hate", "i dislike", "can't stand", "ненавиджу", "терпіти не можу", "не люблю",
];
const LIKE_PATTERNS: &[&str] = &["i love", "i like", "i enjoy", "люблю", "обожнюю"];

/// Words that disqualify a captured value (pronouns, fillers).
const VALUE_BLOCKLIST: &[&str] = &[
    "you", "it", "this", "that", "him", "her", "them", "тебе", "це", "його", "її", "вас",
];

#[async_trait]
impl Extractor for RuleExtractor {
    async fn extract(
        &self,
        messages: &[StoredMessage],
        _profiles: &[Profile],
    ) -> Result<Vec<CandidateFact>> {
        let mut out = Vec::new();
        for msg in messages {
            if msg.is_from_self {
                continue;
            }
            extract_from_text(msg, &mut out);
        }
        debug!(candidates = out.len(), "rule extraction done");
        Ok(out)
    }
}

fn extract_from_text(msg: &StoredMessage, out: &mut Vec<CandidateFact>) {
    let words = tokenize(&msg.text);
    let push = |out: &mut Vec<CandidateFact>, fact_type: &str, key: &str, value: String, conf: f64| {
        out.push(CandidateFact {
            user_id: msg.user_id,
            fact_type: fact_type.to_string(),
            key: key.to_string(),
            value,
            confidence: conf,
            evidence_message_id: Some(msg.id),
            source: FactSource::Rule,
        });
    };

    // Location from an explicit pattern.
    if let Some(value) = capture_after(&words, LOCATION_PATTERNS) {
        push(out, "personal", "location", value, 0.8);
    } else if words.len() == 1 && is_known_city(&canonicalize(&words[0])) {
        // A bare city mention ("Київ ❤️") still counts, with less weight.
        push(out, "personal", "location", words[0].clone(), 0.7);
    }

    // Profession. Explicit patterns take any value; loose patterns only
    // fire for known professions so "i'm a bit tired" stays silent.
    if let Some(value) = capture_after(&words, PROFESSION_EXPLICIT) {
        push(out, "skill", "profession", value, 0.8);
    } else if let Some(value) = capture_after(&words, PROFESSION_LOOSE) {
        if is_known_profession(&canonicalize(&value)) {
            push(out, "skill", "profession", value, 0.75);
        }
    }

    // Spoken language, only for values the lexicon knows.
    if let Some(value) = capture_after(&words, LANGUAGE_PATTERNS) {
        if is_known_language(&canonicalize(&value)) {
            push(out, "skill", "language", value, 0.8);
        }
    }

    // Dislikes before likes: "не люблю X" must not match the bare "люблю".
    if let Some(value) = capture_after(&words, DISLIKE_PATTERNS) {
        push(out, "preference", "dislikes", value, 0.7);
    } else if let Some(value) = capture_after(&words, LIKE_PATTERNS) {
        push(out, "preference", "likes", value, 0.7);
    }
}

/// Lowercased tokens with surrounding punctuation stripped. Keeps inner
/// apostrophes ("i'm") and symbol suffixes ("c++", "c#").
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '+' || c == '#'))
                .to_string()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Find the first pattern occurrence and capture the token that follows.
fn capture_after(words: &[String], patterns: &[&str]) -> Option<String> {
    for pattern in patterns {
        let pat: Vec<&str> = pattern.split_whitespace().collect();
        if pat.is_empty() || words.len() < pat.len() {
            continue;
        }
        for start in 0..=(words.len() - pat.len()) {
            if words[start..start + pat.len()]
                .iter()
                .zip(&pat)
                .all(|(w, p)| w == p)
            {
                // "не люблю" guard: a negated like is not a like.
                if pat == ["люблю"] && start > 0 && words[start - 1] == "не" {
                    continue;
                }
                let value = words.get(start + pat.len())?;
                if value.is_empty() || VALUE_BLOCKLIST.contains(&value.as_str()) {
                    return None;
                }
                return Some(value.clone());
            }
        }
    }
    None
}

// ── Model stage ───────────────────────────────────────────────────────────

/// Whole-window extraction through the structured-output model call.
pub struct ModelExtractor {
    provider: Arc<dyn Provider>,
}

impl ModelExtractor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "facts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "user_id": { "type": "integer" },
                            "fact_type": { "type": "string" },
                            "key": { "type": "string" },
                            "value": { "type": "string" },
                            "confidence": { "type": "number" }
                        },
                        "required": ["user_id", "fact_type", "key", "value", "confidence"]
                    }
                }
            },
            "required": ["facts"]
        })
    }

    fn prompt(messages: &[StoredMessage], profiles: &[Profile]) -> String {
        let mut transcript = String::new();
        for m in messages {
            transcript.push_str(&format!(
                "[{}] {} ({}): {}\n",
                m.timestamp.format("%H:%M"),
                m.author_name,
                m.user_id,
                m.text
            ));
        }
        let mut known = String::new();
        for p in profiles {
            if let Some(ref s) = p.summary_text {
                known.push_str(&format!("- {} ({}): {}\n", p.display_name, p.user_id, s));
            }
        }
        format!(
            "Extract durable personal facts about the participants of this chat \
             conversation: location, profession, spoken languages, likes, dislikes. \
             Only include facts a participant stated about themselves. \
             fact_type must be one of personal, skill, preference, trait. \
             confidence is your certainty in [0,1].\n\n\
             Known participants:\n{known}\nConversation:\n{transcript}"
        )
    }
}

#[derive(Deserialize)]
struct ModelFacts {
    facts: Vec<ModelFact>,
}

#[derive(Deserialize)]
struct ModelFact {
    user_id: i64,
    fact_type: String,
    key: String,
    value: String,
    confidence: f64,
}

#[async_trait]
impl Extractor for ModelExtractor {
    async fn extract(
        &self,
        messages: &[StoredMessage],
        profiles: &[Profile],
    ) -> Result<Vec<CandidateFact>> {
        let prompt = Self::prompt(messages, profiles);
        let raw = self
            .provider
            .generate_structured(&prompt, &Self::schema())
            .await?;
        let parsed: ModelFacts = serde_json::from_value(raw)
            .map_err(|e| LearnError::BadModelOutput(e.to_string()))?;

        // The agent's own messages are excluded from attribution.
        let self_ids: Vec<i64> = messages
            .iter()
            .filter(|m| m.is_from_self)
            .map(|m| m.user_id)
            .collect();
        let participant_ids: Vec<i64> = messages
            .iter()
            .filter(|m| !m.is_from_self)
            .map(|m| m.user_id)
            .collect();

        let last_message_id = messages.last().map(|m| m.id);
        let out = parsed
            .facts
            .into_iter()
            .filter(|f| {
                participant_ids.contains(&f.user_id) && !self_ids.contains(&f.user_id)
            })
            .filter(|f| !f.key.trim().is_empty() && !f.value.trim().is_empty())
            .map(|f| CandidateFact {
                user_id: f.user_id,
                fact_type: f.fact_type,
                key: f.key,
                value: f.value,
                confidence: f.confidence.clamp(0.5, 0.95),
                evidence_message_id: last_message_id,
                source: FactSource::Model,
            })
            .collect();
        Ok(out)
    }
}

// ── Hybrid ────────────────────────────────────────────────────────────────

/// Rule first; model only when the window has at least one medium-or-high
/// message, and only for candidates the rules did not already produce.
/// Model failure is non-fatal — rule output stands alone.
pub struct HybridExtractor {
    rule: RuleExtractor,
    model: ModelExtractor,
}

/// Whether the hybrid's model stage ran, for breaker accounting upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStage {
    NotAttempted,
    Succeeded,
    Failed,
}

impl HybridExtractor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            rule: RuleExtractor,
            model: ModelExtractor::new(provider),
        }
    }

    /// Like [`Extractor::extract`], also reporting what the model stage did.
    pub async fn extract_with_status(
        &self,
        messages: &[StoredMessage],
        profiles: &[Profile],
    ) -> Result<(Vec<CandidateFact>, ModelStage)> {
        let mut out = self.rule.extract(messages, profiles).await?;

        let worth_model_call = messages.iter().any(|m| {
            !m.is_from_self
                && classify_text(&m.text, false, !m.media.is_empty()).label >= ValueLabel::Medium
        });
        if !worth_model_call {
            return Ok((out, ModelStage::NotAttempted));
        }

        match self.model.extract(messages, profiles).await {
            Ok(model_candidates) => {
                for c in model_candidates {
                    let covered = out.iter().any(|r| {
                        r.user_id == c.user_id
                            && r.key == c.key
                            && canonicalize(&r.value) == canonicalize(&c.value)
                    });
                    if !covered {
                        out.push(c);
                    }
                }
                Ok((out, ModelStage::Succeeded))
            }
            Err(e) => {
                warn!(error = %e, "model extraction failed, keeping rule output");
                Ok((out, ModelStage::Failed))
            }
        }
    }
}

#[async_trait]
impl Extractor for HybridExtractor {
    async fn extract(
        &self,
        messages: &[StoredMessage],
        profiles: &[Profile],
    ) -> Result<Vec<CandidateFact>> {
        let (out, _) = self.extract_with_status(messages, profiles).await?;
        Ok(out)
    }
}
