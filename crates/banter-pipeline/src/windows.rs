//! The asynchronous window path: persist → queue → extract → quality →
//! intent → proactive trigger.

use std::sync::Arc;

use async_trait::async_trait;
use banter_core::error::Classify;
use banter_core::types::{ChatScope, InboundMessage, OutboundMessage};
use banter_learn::extract::{Extractor, HybridExtractor, ModelStage, RuleExtractor};
use banter_learn::window::ClosedWindow;
use banter_proactive::{IntentClassification, TriggerOutcome};
use banter_queue::{Event, EventHandler, HandlerError, QueueError, QueuedEvent};
use banter_store::proactive::{NewProactiveEvent, SendOutcome};
use banter_store::types::{StoredMessage, WindowRecord};
use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use banter_agent::GenerateRequest;

use crate::{Pipeline, PipelineError, Result};

/// Persona used when the agent joins a conversation uninvited.
const PROACTIVE_PERSONA: &str = "You are banter, a member of this group chat. You noticed the \
     conversation below and decided you can help. Reply to the last message \
     concisely, in its language, without announcing yourself.";

impl Pipeline {
    /// Persist a freshly closed window and hand it to the learning path:
    /// queued when async processing is on, inline otherwise. The hot path
    /// never blocks on a full queue.
    pub(crate) async fn dispatch_window(&self, closed: ClosedWindow) {
        let window_id = match self.store.insert_window(&closed.record) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, scope = %closed.scope, "window persist failed");
                return;
            }
        };
        info!(
            window_id,
            scope = %closed.scope,
            count = closed.record.message_count,
            reason = %closed.record.closure_reason,
            "window closed"
        );

        if self.config.queue.enable_async {
            let event = Event::WindowClosed {
                window_id,
                chat_id: closed.record.chat_id,
                thread_id: closed.record.thread_id,
            };
            match self.queue.push(event, closed.priority) {
                Ok(_) => {}
                Err(QueueError::Full) | Err(QueueError::Closed) => {
                    warn!(window_id, "queue rejected window, learning skipped");
                    if let Err(e) = self.store.mark_window_skipped(window_id) {
                        warn!(error = %e, window_id, "skip flag failed");
                    }
                }
            }
        } else {
            let cancel = CancellationToken::new();
            if let Err(e) = self.process_window(window_id, &cancel).await {
                warn!(error = %e, window_id, "inline window processing failed");
            }
        }
    }

    /// Close idle windows on a timer tick.
    pub async fn sweep_windows(&self) {
        for closed in self.windower.sweep(chrono::Utc::now()) {
            self.dispatch_window(closed).await;
        }
    }

    /// Shutdown: flush every open window as closed and queue what we can.
    pub async fn flush_windows(&self) {
        let flushed = self.windower.flush_all();
        if !flushed.is_empty() {
            info!(count = flushed.len(), "flushing open windows for shutdown");
        }
        for closed in flushed {
            self.dispatch_window(closed).await;
        }
    }

    /// The full learning path for one closed window. Idempotent: a window
    /// already processed (or permanently failed) is left alone.
    pub async fn process_window(&self, window_id: i64, cancel: &CancellationToken) -> Result<()> {
        let window = self.store.get_window(window_id)?;
        if window.processed || window.failed {
            debug!(window_id, "window already settled, skipping");
            return Ok(());
        }
        let scope = ChatScope::new(window.chat_id, window.thread_id);
        let messages = self.store.messages_in_range(
            scope,
            window.first_message_id,
            window.last_message_id,
        )?;
        let profiles = self
            .store
            .get_profiles(&window.participants, window.chat_id)?;

        // Extraction. With the model breaker open, degrade to rules and
        // skip intent + proactive entirely.
        let model_breaker = self.breakers.get("model");
        let degraded = model_breaker.is_open();
        let candidates = if degraded {
            debug!(window_id, "model breaker open, rule-only extraction");
            RuleExtractor.extract(&messages, &profiles).await?
        } else {
            let hybrid = HybridExtractor::new(Arc::clone(&self.provider));
            let (candidates, stage) = hybrid.extract_with_status(&messages, &profiles).await?;
            match stage {
                ModelStage::Succeeded => model_breaker.record_success(),
                ModelStage::Failed => model_breaker.record_failure(),
                ModelStage::NotAttempted => {}
            }
            candidates
        };

        // Quality pipeline: one retry on a transient store failure, then
        // the window is failed permanently.
        let outcome = match self.quality.process(window.chat_id, candidates.clone()).await {
            Ok(o) => o,
            Err(e) if e.kind().is_retryable() => {
                warn!(error = %e, window_id, "fact batch rejected, retrying once");
                match self.quality.process(window.chat_id, candidates).await {
                    Ok(o) => o,
                    Err(e2) => {
                        warn!(error = %e2, window_id, "fact batch failed twice, giving up");
                        self.store.mark_window_failed(window_id)?;
                        return Err(e2.into());
                    }
                }
            }
            Err(e) => {
                self.store.mark_window_failed(window_id)?;
                return Err(e.into());
            }
        };
        self.store.put_quality_metrics(window_id, &outcome.metrics)?;
        self.store.mark_window_processed(window_id)?;
        debug!(
            window_id,
            created = outcome.metrics.facts_created,
            reinforced = outcome.metrics.facts_reinforced,
            "window learned"
        );

        if degraded || cancel.is_cancelled() {
            return Ok(());
        }

        // Intent + proactive trigger.
        let intent = self.intent.classify(window_id, &messages).await;
        match self.trigger.evaluate(&window, &messages, &intent)? {
            TriggerOutcome::Suppress {
                block_reason,
                adjusted_confidence,
                user_id,
            } => {
                self.store.record_suppress(&NewProactiveEvent {
                    chat_id: window.chat_id,
                    window_id,
                    user_id,
                    intent_type: intent.intent.to_string(),
                    intent_confidence: intent.confidence,
                    adjusted_confidence,
                    block_reason: Some(block_reason),
                    response_message_id: None,
                })?;
            }
            TriggerOutcome::Send {
                user_id,
                adjusted_confidence,
            } => {
                if let Err(e) = self
                    .send_proactive(&window, &messages, &intent, user_id, adjusted_confidence)
                    .await
                {
                    warn!(error = %e, window_id, "proactive send failed");
                }
            }
        }
        Ok(())
    }

    /// Generate and deliver an unsolicited reply for a window that passed
    /// every gate, then record the SEND event under the serialized
    /// global-cooldown check.
    async fn send_proactive(
        &self,
        window: &WindowRecord,
        messages: &[StoredMessage],
        intent: &IntentClassification,
        user_id: i64,
        adjusted_confidence: f64,
    ) -> Result<()> {
        // The gates pass on the window row's count; the rows themselves may
        // have been pruned since.
        let Some(last) = messages.last() else {
            return Err(PipelineError::Provider(banter_agent::ProviderError::Parse(
                "window messages no longer in store".to_string(),
            )));
        };

        let breaker = self.breakers.get("model");
        if !breaker.allow() {
            return Err(PipelineError::Provider(banter_agent::ProviderError::Http(
                "model breaker open".to_string(),
            )));
        }

        // Regenerate through the assembler over the window's last message.
        let pseudo = to_inbound(last);
        let context = self.assembler.assemble(&pseudo).await?;
        let system = if context.system_prefix.is_empty() {
            PROACTIVE_PERSONA.to_string()
        } else {
            format!("{PROACTIVE_PERSONA}\n\n{}", context.system_prefix)
        };
        let request = GenerateRequest {
            system,
            turns: context.turns,
            tools: Vec::new(),
            max_tokens: self.config.provider.max_tokens,
            raw_messages: None,
        };
        let response = match self.provider.generate(&request).await {
            Ok(r) => {
                breaker.record_success();
                r
            }
            Err(e) => {
                if e.kind().is_breaker_eligible() {
                    breaker.record_failure();
                }
                return Err(e.into());
            }
        };
        if response.text.trim().is_empty() {
            return Err(PipelineError::Provider(banter_agent::ProviderError::Parse(
                "empty proactive reply".to_string(),
            )));
        }

        let outbound = OutboundMessage {
            chat_id: window.chat_id,
            thread_id: window.thread_id,
            text: response.text,
            reply_to_message_id: Some(last.message_id),
        };
        let sent_id = self
            .outbound
            .send(&outbound)
            .await
            .map_err(PipelineError::Send)?;

        let event = NewProactiveEvent {
            chat_id: window.chat_id,
            window_id: window.id,
            user_id: Some(user_id),
            intent_type: intent.intent.to_string(),
            intent_confidence: intent.confidence,
            adjusted_confidence,
            block_reason: None,
            response_message_id: Some(sent_id),
        };
        let cooldown = Duration::seconds(self.config.proactive.global_cooldown_seconds as i64);
        match self.store.record_send(&event, cooldown)? {
            SendOutcome::Recorded(event_id) => {
                info!(
                    window_id = window.id,
                    event_id, sent_id, intent = %intent.intent, "proactive reply sent"
                );
            }
            SendOutcome::CooldownRaced => {
                // Another worker's send won the race after ours went out.
                // The message is already visible; the suppress row keeps
                // the ledger honest about the cooldown.
                warn!(window_id = window.id, "proactive send raced the global cooldown");
            }
        }
        self.record_own_message(window.chat_id, window.thread_id, sent_id, &outbound.text)
            .await;
        Ok(())
    }
}

fn to_inbound(m: &StoredMessage) -> InboundMessage {
    InboundMessage {
        chat_id: m.chat_id,
        thread_id: m.thread_id,
        message_id: m.message_id,
        user_id: m.user_id,
        author_name: m.author_name.clone(),
        text: m.text.clone(),
        media_refs: m.media.clone(),
        has_user_media: !m.media.is_empty(),
        reply_to_message_id: m.reply_to_message_id,
        is_from_self: m.is_from_self,
        addressed: false,
        timestamp: m.timestamp,
    }
}

#[async_trait]
impl EventHandler for Pipeline {
    async fn handle(
        &self,
        event: QueuedEvent,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), HandlerError> {
        match event.event {
            Event::WindowClosed { window_id, .. } => self
                .process_window(window_id, cancel)
                .await
                .map_err(|e| HandlerError::new(e.kind(), e.to_string())),
            Event::EpisodeTick => {
                self.episodes.sweep().await;
                Ok(())
            }
        }
    }
}
