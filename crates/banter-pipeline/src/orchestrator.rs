//! The hot path: everything that happens to one inbound message.

use banter_core::types::{InboundMessage, OutboundMessage};
use banter_learn::classify::classify;
use banter_learn::extract::{CandidateFact, Extractor, RuleExtractor};
use banter_store::types::FactSource;
use tracing::{debug, info, warn};

use banter_agent::tools::{facts::build_fact_tools, tool_loop};
use banter_agent::GenerateRequest;

use crate::{Pipeline, Result};

/// What the user sees when the model is down on an addressed message.
const FALLBACK_REPLY: &str =
    "⚠️ I'm having trouble thinking right now — try again in a minute.";

/// Persona prefix for addressed replies; assembled memory context follows.
const SYSTEM_PERSONA: &str = "You are banter, a helpful member of this group chat. \
     Reply concisely and in the language the user wrote in. Use your tools to \
     recall or store facts about participants when it helps.";

impl Pipeline {
    /// Orchestrate one inbound message. Learning-side failures are logged
    /// and swallowed; an addressed message always gets a reply.
    pub async fn handle_message(&self, msg: &InboundMessage) {
        // Serialize per (chat, thread): the adapter dispatches messages on
        // independent tasks, but this scope's state must advance in
        // arrival order.
        let lock = self
            .scope_locks
            .entry(msg.scope())
            .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _ordering = lock.lock().await;

        // 1. Persist. A duplicate platform message is a no-op.
        let row_id = match self.store.insert_message(msg) {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(chat_id = msg.chat_id, message_id = msg.message_id, "duplicate, skipping");
                return;
            }
            Err(e) => {
                warn!(error = %e, "message persist failed, continuing without learning");
                // Without a store row the learning path is pointless, but an
                // addressed message still deserves an answer.
                if msg.addressed && !msg.is_from_self {
                    self.reply_addressed(msg).await;
                }
                return;
            }
        };

        // 2. Profile upkeep for human authors.
        if !msg.is_from_self {
            if let Err(e) = self
                .store
                .upsert_profile(msg.user_id, msg.chat_id, &msg.author_name)
            {
                warn!(error = %e, user_id = msg.user_id, "profile upsert failed");
            }
        }

        // 2b. A reply to one of our proactive messages is a reaction.
        if let Some(replied_to) = msg.reply_to_message_id {
            self.maybe_record_reaction(msg, replied_to);
        }

        // 3. Classify and feed the learning surfaces.
        let classification = classify(msg);
        debug!(
            chat_id = msg.chat_id,
            label = %classification.label,
            confidence = classification.confidence,
            "message classified"
        );
        if classification.label > banter_core::types::ValueLabel::Noise {
            self.episodes.observe(row_id, msg);
        }
        if let Some(closed) = self.windower.observe(row_id, msg, classification.label) {
            self.dispatch_window(closed).await;
        }

        // 4. Addressed messages get the reply path plus inline learning.
        if msg.addressed && !msg.is_from_self {
            self.reply_addressed(msg).await;
            self.learn_addressed(msg, row_id).await;
        }
    }

    /// Assemble context, run the tool loop, send the reply (or the fixed
    /// fallback), and persist our own turn.
    async fn reply_addressed(&self, msg: &InboundMessage) {
        let text = match self.generate_reply(msg).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => FALLBACK_REPLY.to_string(),
            Err(e) => {
                warn!(error = %e, chat_id = msg.chat_id, "reply generation failed, sending fallback");
                FALLBACK_REPLY.to_string()
            }
        };

        let outbound = OutboundMessage {
            chat_id: msg.chat_id,
            thread_id: msg.thread_id,
            text,
            reply_to_message_id: Some(msg.message_id),
        };
        match self.outbound.send(&outbound).await {
            Ok(sent_id) => {
                info!(chat_id = msg.chat_id, sent_id, "reply sent");
                self.record_own_message(msg.chat_id, msg.thread_id, sent_id, &outbound.text)
                    .await;
            }
            Err(e) => warn!(error = %e, chat_id = msg.chat_id, "reply send failed"),
        }
    }

    async fn generate_reply(&self, msg: &InboundMessage) -> Result<String> {
        let breaker = self.breakers.get("model");
        if !breaker.allow() {
            return Err(banter_agent::ProviderError::Http(
                "model breaker open".to_string(),
            )
            .into());
        }

        let context = self.assembler.assemble(msg).await?;
        let system = if context.system_prefix.is_empty() {
            SYSTEM_PERSONA.to_string()
        } else {
            format!("{SYSTEM_PERSONA}\n\n{}", context.system_prefix)
        };
        let tools = build_fact_tools(std::sync::Arc::clone(&self.store), msg.chat_id);
        let request = GenerateRequest {
            system,
            turns: context.turns,
            tools: banter_agent::tools::to_definitions(&tools),
            max_tokens: self.config.provider.max_tokens,
            raw_messages: None,
        };

        match tool_loop::run_tool_loop(self.provider.as_ref(), request, &tools, None).await {
            Ok(response) => {
                breaker.record_success();
                Ok(response.text)
            }
            Err(e) => {
                if banter_core::error::Classify::kind(&e).is_breaker_eligible() {
                    breaker.record_failure();
                }
                Err(e.into())
            }
        }
    }

    /// Inline fact extraction for an addressed message: rule patterns over
    /// just this message, attributed as directly-stated, through the full
    /// quality pipeline.
    async fn learn_addressed(&self, msg: &InboundMessage, row_id: i64) {
        let stored = match self.store.get_message(row_id) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "addressed learning skipped, message unreadable");
                return;
            }
        };
        let candidates = match RuleExtractor.extract(&[stored], &[]).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "addressed extraction failed");
                return;
            }
        };
        // Directly-told facts carry the highest source reliability.
        let candidates: Vec<CandidateFact> = candidates
            .into_iter()
            .map(|mut c| {
                c.source = FactSource::Addressed;
                c.confidence = (c.confidence + 0.1).min(0.95);
                c
            })
            .collect();
        if candidates.is_empty() {
            return;
        }
        match self.quality.process(msg.chat_id, candidates).await {
            Ok(outcome) => debug!(
                chat_id = msg.chat_id,
                created = outcome.metrics.facts_created,
                reinforced = outcome.metrics.facts_reinforced,
                "addressed facts learned"
            ),
            Err(e) => warn!(error = %e, "addressed fact quality failed"),
        }
    }

    /// Store the agent's own sent message so windows and future context
    /// include it (the platform does not echo our sends back).
    pub(crate) async fn record_own_message(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        message_id: i64,
        text: &str,
    ) {
        let own = InboundMessage {
            chat_id,
            thread_id,
            message_id,
            user_id: 0,
            author_name: self.config.telegram.bot_username.clone(),
            text: text.to_string(),
            media_refs: vec![],
            has_user_media: false,
            reply_to_message_id: None,
            is_from_self: true,
            addressed: false,
            timestamp: chrono::Utc::now(),
        };
        match self.store.insert_message(&own) {
            Ok(Some(row_id)) => {
                // Our turns join windows and episode buffers like anyone
                // else's — the proactive trigger checks for them.
                let label = classify(&own).label;
                if label > banter_core::types::ValueLabel::Noise {
                    self.episodes.observe(row_id, &own);
                }
                if let Some(closed) = self.windower.observe(row_id, &own, label) {
                    Box::pin(self.dispatch_window(closed)).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "own message persist failed"),
        }
    }
}
