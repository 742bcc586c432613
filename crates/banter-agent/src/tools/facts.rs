//! Fact-store tools exposed to the model during addressed replies.
//!
//! The model can read and write the same profile the learning pipeline
//! builds: recall facts about a participant, remember something it was
//! told directly, forget on request, and search past messages.

use std::sync::Arc;

use async_trait::async_trait;
use banter_store::types::{BatchRef, FactMutation, FactSource};
use banter_store::FactStore;
use tracing::info;

use super::{Tool, ToolResult};

/// Build the per-request tool set for an addressed reply in one chat.
pub fn build_fact_tools(store: Arc<FactStore>, chat_id: i64) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(RecallFacts {
            store: Arc::clone(&store),
            chat_id,
        }),
        Box::new(RememberFact {
            store: Arc::clone(&store),
            chat_id,
        }),
        Box::new(ForgetFact {
            store: Arc::clone(&store),
            chat_id,
        }),
        Box::new(SearchMessages {
            store: Arc::clone(&store),
            chat_id,
        }),
        Box::new(UpdateProfileSummary { store, chat_id }),
    ]
}

struct RecallFacts {
    store: Arc<FactStore>,
    chat_id: i64,
}

#[async_trait]
impl Tool for RecallFacts {
    fn name(&self) -> &str {
        "recall_facts"
    }
    fn description(&self) -> &str {
        "List everything known about a chat participant (facts with confidence scores)."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": { "type": "integer", "description": "Participant's user id" }
            },
            "required": ["user_id"]
        })
    }
    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let user_id = input["user_id"].as_i64().unwrap_or(0);
        match self.store.active_facts(user_id, self.chat_id) {
            Ok(facts) => {
                let out: Vec<serde_json::Value> = facts
                    .iter()
                    .map(|f| {
                        serde_json::json!({
                            "type": f.fact_type,
                            "key": f.key,
                            "value": f.value_canonical,
                            "confidence": f.confidence,
                        })
                    })
                    .collect();
                ToolResult::success(serde_json::json!({ "facts": out }).to_string())
            }
            Err(e) => ToolResult::error(format!("fact lookup failed: {e}")),
        }
    }
}

struct RememberFact {
    store: Arc<FactStore>,
    chat_id: i64,
}

#[async_trait]
impl Tool for RememberFact {
    fn name(&self) -> &str {
        "remember_fact"
    }
    fn description(&self) -> &str {
        "Store a fact a participant just told you directly. \
         Use only for clear, user-stated information."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": { "type": "integer" },
                "fact_type": { "type": "string", "description": "personal | skill | preference | trait" },
                "key": { "type": "string", "description": "e.g. location, profession, language" },
                "value": { "type": "string" }
            },
            "required": ["user_id", "fact_type", "key", "value"]
        })
    }
    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let user_id = input["user_id"].as_i64().unwrap_or(0);
        let fact_type = input["fact_type"].as_str().unwrap_or("personal");
        let key = input["key"].as_str().unwrap_or("");
        let value = banter_core::text::normalize(input["value"].as_str().unwrap_or(""));
        if key.is_empty() || value.is_empty() {
            return ToolResult::error("key and value must be non-empty");
        }

        // An identical active fact is reinforced instead of duplicated.
        let existing = match self.store.active_facts(user_id, self.chat_id) {
            Ok(facts) => facts.into_iter().find(|f| {
                f.fact_type == fact_type && f.key == key && f.value_canonical == value
            }),
            Err(e) => return ToolResult::error(format!("fact lookup failed: {e}")),
        };

        let mutation = match &existing {
            Some(f) => FactMutation::Reinforce {
                target: BatchRef::Existing(f.id),
                new_confidence: (f.confidence + 0.1).min(1.0),
                reason: Some("restated to the agent".to_string()),
            },
            None => FactMutation::Create {
                user_id,
                chat_id: self.chat_id,
                fact_type: fact_type.to_string(),
                key: key.to_string(),
                value_canonical: value.clone(),
                confidence: 0.95,
                source: FactSource::Addressed,
                evidence_message_id: None,
                embedding: None,
            },
        };

        match self.store.apply_fact_batch(&[mutation]) {
            Ok(_) => {
                info!(user_id, chat_id = self.chat_id, key, %value, "fact remembered via tool");
                ToolResult::success(serde_json::json!({ "stored": true }).to_string())
            }
            Err(e) => ToolResult::error(format!("fact write failed: {e}")),
        }
    }
}

struct ForgetFact {
    store: Arc<FactStore>,
    chat_id: i64,
}

#[async_trait]
impl Tool for ForgetFact {
    fn name(&self) -> &str {
        "forget_fact"
    }
    fn description(&self) -> &str {
        "Deactivate a stored fact at the participant's request \
         (\"forget that I live in Kyiv\")."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": { "type": "integer" },
                "key": { "type": "string" },
                "value": { "type": "string", "description": "Optional: narrow to one value" }
            },
            "required": ["user_id", "key"]
        })
    }
    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let user_id = input["user_id"].as_i64().unwrap_or(0);
        let key = input["key"].as_str().unwrap_or("");
        let value = input["value"].as_str().map(banter_core::text::normalize);

        let facts = match self.store.active_facts(user_id, self.chat_id) {
            Ok(f) => f,
            Err(e) => return ToolResult::error(format!("fact lookup failed: {e}")),
        };
        let targets: Vec<_> = facts
            .into_iter()
            .filter(|f| f.key == key && value.as_ref().is_none_or(|v| &f.value_canonical == v))
            .collect();
        if targets.is_empty() {
            return ToolResult::error(format!("no active fact with key {key:?}"));
        }

        let mut forgotten = 0;
        for f in &targets {
            if let Err(e) = self
                .store
                .deactivate_fact(f.id, "forgotten on user request")
            {
                return ToolResult::error(format!("fact deactivation failed: {e}"));
            }
            forgotten += 1;
        }
        info!(user_id, chat_id = self.chat_id, key, forgotten, "facts forgotten via tool");
        ToolResult::success(serde_json::json!({ "forgotten": forgotten }).to_string())
    }
}

struct SearchMessages {
    store: Arc<FactStore>,
    chat_id: i64,
}

#[async_trait]
impl Tool for SearchMessages {
    fn name(&self) -> &str {
        "search_messages"
    }
    fn description(&self) -> &str {
        "Full-text search over this chat's message history."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["query"]
        })
    }
    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let query = input["query"].as_str().unwrap_or("");
        let limit = input["limit"].as_u64().unwrap_or(5).min(20) as usize;
        match self.store.keyword_search(self.chat_id, query, limit) {
            Ok(hits) => {
                let out: Vec<serde_json::Value> = hits
                    .iter()
                    .map(|(m, _)| {
                        serde_json::json!({
                            "author": m.author_name,
                            "text": m.text,
                            "timestamp": m.timestamp.to_rfc3339(),
                        })
                    })
                    .collect();
                ToolResult::success(serde_json::json!({ "messages": out }).to_string())
            }
            Err(e) => ToolResult::error(format!("search failed: {e}")),
        }
    }
}

struct UpdateProfileSummary {
    store: Arc<FactStore>,
    chat_id: i64,
}

#[async_trait]
impl Tool for UpdateProfileSummary {
    fn name(&self) -> &str {
        "update_profile_summary"
    }
    fn description(&self) -> &str {
        "Rewrite the one-paragraph description of a participant. Call this \
         after learning something that changes how they should be introduced."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": { "type": "integer" },
                "summary": { "type": "string" }
            },
            "required": ["user_id", "summary"]
        })
    }
    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let user_id = input["user_id"].as_i64().unwrap_or(0);
        let summary = input["summary"].as_str().unwrap_or("").trim();
        if summary.is_empty() {
            return ToolResult::error("summary must be non-empty");
        }
        match self
            .store
            .set_profile_summary(user_id, self.chat_id, summary)
        {
            Ok(()) => {
                info!(user_id, chat_id = self.chat_id, "profile summary updated via tool");
                ToolResult::success(serde_json::json!({ "updated": true }).to_string())
            }
            Err(e) => ToolResult::error(format!("summary update failed: {e}")),
        }
    }
}
