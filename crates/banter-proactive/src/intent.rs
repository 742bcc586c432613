//! Conversation intent inference over closed windows.

use std::sync::Arc;

use banter_store::types::StoredMessage;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use banter_agent::Provider;

/// What a window's conversation is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Question,
    Request,
    Problem,
    Opportunity,
    None,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Question => write!(f, "question"),
            Self::Request => write!(f, "request"),
            Self::Problem => write!(f, "problem"),
            Self::Opportunity => write!(f, "opportunity"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" => Ok(Self::Question),
            "request" => Ok(Self::Request),
            "problem" => Ok(Self::Problem),
            "opportunity" => Ok(Self::Opportunity),
            "none" => Ok(Self::None),
            other => Err(format!("unknown intent: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentClassification {
    pub intent: Intent,
    pub confidence: f64,
}

impl IntentClassification {
    fn none() -> Self {
        Self {
            intent: Intent::None,
            confidence: 0.0,
        }
    }
}

/// Model-backed intent classifier with a per-window result cache so a
/// retried window reaches the same trigger decision.
pub struct IntentClassifier {
    provider: Arc<dyn Provider>,
    capabilities: Vec<String>,
    cache: DashMap<i64, IntentClassification>,
}

/// What the agent can plausibly help with — advertised to the classifier
/// so "opportunity" means something concrete.
const DEFAULT_CAPABILITIES: &[&str] = &[
    "answering questions from the chat's history",
    "remembering facts about participants",
    "searching past messages",
    "summarizing what was discussed",
];

impl IntentClassifier {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            capabilities: DEFAULT_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            cache: DashMap::new(),
        }
    }

    /// Classify a closed window. Never errors: any provider failure or
    /// malformed output degrades to `None` with zero confidence (uncached,
    /// so a retry may still succeed).
    pub async fn classify(
        &self,
        window_id: i64,
        messages: &[StoredMessage],
    ) -> IntentClassification {
        if let Some(cached) = self.cache.get(&window_id) {
            debug!(window_id, "intent served from cache");
            return *cached;
        }
        if messages.is_empty() {
            return IntentClassification::none();
        }

        let mut transcript = String::new();
        for m in messages {
            transcript.push_str(&format!("{}: {}\n", m.author_name, m.text));
        }
        let capabilities = self.capabilities.join("; ");
        let prompt = format!(
            "You observe a group-chat conversation. The assistant can help with: \
             {capabilities}. Decide whether the conversation currently calls for \
             the assistant to jump in. intent is one of question, request, \
             problem, opportunity, none. confidence is your certainty in [0,1]. \
             Prefer none unless there is a clear opening.\n\n{transcript}"
        );

        let raw = match self.provider.generate_structured(&prompt, &schema()).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(window_id, error = %e, "intent classification failed");
                return IntentClassification::none();
            }
        };

        let parsed: Result<ModelIntent, _> = serde_json::from_value(raw);
        let result = match parsed {
            Ok(m) => match m.intent.parse::<Intent>() {
                Ok(intent) => IntentClassification {
                    intent,
                    confidence: m.confidence.clamp(0.0, 1.0),
                },
                Err(e) => {
                    warn!(window_id, error = %e, "intent label unknown");
                    IntentClassification::none()
                }
            },
            Err(e) => {
                warn!(window_id, error = %e, "intent output malformed");
                IntentClassification::none()
            }
        };

        self.cache.insert(window_id, result);
        result
    }
}

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "intent": { "type": "string" },
            "confidence": { "type": "number" }
        },
        "required": ["intent", "confidence"]
    })
}

#[derive(Deserialize)]
struct ModelIntent {
    intent: String,
    confidence: f64,
}
