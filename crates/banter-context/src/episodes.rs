//! Episode monitor: long conversation threads condensed into durable
//! summaries.
//!
//! Every non-noise message lands in a per-(chat, thread) rolling buffer.
//! A buffer finalizes once it goes quiet past the timeout or grows to the
//! message cap; finalization is one structured model call producing topic,
//! summary, valence, importance, and tags. The sweep runs on the episode
//! tick; a failed finalization leaves the buffer in place for the next
//! sweep.

use std::sync::Arc;

use banter_core::config::EpisodesConfig;
use banter_core::types::{ChatScope, InboundMessage};
use banter_store::episodes::NewEpisode;
use banter_store::types::{StoredMessage, Valence};
use banter_store::FactStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use banter_agent::Provider;

use crate::{ContextError, Result};

#[derive(Debug, Clone)]
struct EpisodeBuffer {
    message_row_ids: Vec<i64>,
    participants: Vec<i64>,
    last_activity: DateTime<Utc>,
}

pub struct EpisodeMonitor {
    store: Arc<FactStore>,
    provider: Arc<dyn Provider>,
    buffers: DashMap<ChatScope, EpisodeBuffer>,
    timeout: Duration,
    max_messages: usize,
}

impl EpisodeMonitor {
    pub fn new(store: Arc<FactStore>, provider: Arc<dyn Provider>, cfg: &EpisodesConfig) -> Self {
        Self {
            store,
            provider,
            buffers: DashMap::new(),
            timeout: Duration::seconds(cfg.timeout_seconds as i64),
            max_messages: cfg.max_messages.max(1),
        }
    }

    /// Record a stored message into its thread buffer.
    pub fn observe(&self, row_id: i64, msg: &InboundMessage) {
        let mut buffer = self
            .buffers
            .entry(msg.scope())
            .or_insert_with(|| EpisodeBuffer {
                message_row_ids: Vec::new(),
                participants: Vec::new(),
                last_activity: msg.timestamp,
            });
        buffer.message_row_ids.push(row_id);
        buffer.last_activity = msg.timestamp;
        if !msg.is_from_self && !buffer.participants.contains(&msg.user_id) {
            buffer.participants.push(msg.user_id);
        }
    }

    /// Finalize every buffer that went quiet or overflowed. Returns the
    /// number of episodes persisted.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let due: Vec<ChatScope> = self
            .buffers
            .iter()
            .filter(|e| {
                let b = e.value();
                b.message_row_ids.len() >= self.max_messages
                    || now - b.last_activity >= self.timeout
            })
            .map(|e| *e.key())
            .collect();

        let mut finalized = 0usize;
        for scope in due {
            let Some((_, buffer)) = self.buffers.remove(&scope) else {
                continue;
            };
            // Too thin to summarize — discard silently.
            if buffer.message_row_ids.len() < 2 {
                continue;
            }
            match self.finalize(scope, &buffer).await {
                Ok(episode_id) => {
                    info!(%scope, episode_id, messages = buffer.message_row_ids.len(), "episode persisted");
                    finalized += 1;
                }
                Err(e) => {
                    // Leave the buffer for the next sweep; merge anything
                    // that arrived while we were summarizing.
                    warn!(%scope, error = %e, "episode finalization failed, keeping buffer");
                    self.buffers
                        .entry(scope)
                        .and_modify(|b| {
                            let mut ids = buffer.message_row_ids.clone();
                            ids.extend(b.message_row_ids.iter().copied());
                            b.message_row_ids = ids;
                            for p in &buffer.participants {
                                if !b.participants.contains(p) {
                                    b.participants.push(*p);
                                }
                            }
                        })
                        .or_insert(buffer);
                }
            }
        }
        finalized
    }

    /// Buffered thread count, for logging.
    pub fn buffered_threads(&self) -> usize {
        self.buffers.len()
    }

    async fn finalize(&self, scope: ChatScope, buffer: &EpisodeBuffer) -> Result<i64> {
        let first = *buffer.message_row_ids.first().expect("non-empty buffer");
        let last = *buffer.message_row_ids.last().expect("non-empty buffer");
        let messages = self.store.messages_in_range(scope, first, last)?;
        if messages.is_empty() {
            return Err(ContextError::BadSummary(
                "buffered messages no longer in store".to_string(),
            ));
        }

        let summary = self.summarize(&messages).await?;
        debug!(%scope, topic = %summary.topic, "episode summarized");

        let id = self.store.insert_episode(&NewEpisode {
            chat_id: scope.chat_id,
            thread_id: scope.thread_id,
            topic: summary.topic,
            summary: summary.summary,
            message_ids: buffer.message_row_ids.clone(),
            participants: buffer.participants.clone(),
            importance: summary.importance.clamp(0.0, 1.0),
            emotional_valence: summary
                .emotional_valence
                .parse()
                .unwrap_or(Valence::Neutral),
            tags: summary.tags,
        })?;
        Ok(id)
    }

    async fn summarize(&self, messages: &[StoredMessage]) -> Result<EpisodeSummary> {
        let mut transcript = String::new();
        for m in messages {
            transcript.push_str(&format!(
                "[{}] {}: {}\n",
                m.timestamp.format("%H:%M"),
                m.author_name,
                m.text
            ));
        }
        let prompt = format!(
            "Summarize this group-chat conversation segment. Produce a short topic \
             (a few words), a 1-3 sentence summary, the overall emotional_valence \
             (positive | negative | neutral | mixed), an importance score in [0,1] \
             for how much this is worth remembering, and up to 5 topical tags.\n\n\
             {transcript}"
        );
        let raw = self
            .provider
            .generate_structured(&prompt, &schema())
            .await?;
        serde_json::from_value(raw).map_err(|e| ContextError::BadSummary(e.to_string()))
    }
}

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "topic": { "type": "string" },
            "summary": { "type": "string" },
            "emotional_valence": { "type": "string" },
            "importance": { "type": "number" },
            "tags": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["topic", "summary", "emotional_valence", "importance", "tags"]
    })
}

#[derive(Debug, Deserialize)]
struct EpisodeSummary {
    topic: String,
    summary: String,
    emotional_valence: String,
    importance: f64,
    #[serde(default)]
    tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_agent::testing::ScriptedProvider;

    fn monitor(
        timeout_seconds: u64,
        max_messages: usize,
        provider: Arc<ScriptedProvider>,
    ) -> (EpisodeMonitor, Arc<FactStore>) {
        let store = Arc::new(FactStore::open_in_memory().unwrap());
        let m = EpisodeMonitor::new(
            Arc::clone(&store),
            provider as Arc<dyn Provider>,
            &EpisodesConfig {
                timeout_seconds,
                max_messages,
                sweep_seconds: 60,
            },
        );
        (m, store)
    }

    fn summary_json() -> serde_json::Value {
        serde_json::json!({
            "topic": "weekend plans",
            "summary": "The group planned a hike for Saturday morning.",
            "emotional_valence": "positive",
            "importance": 0.6,
            "tags": ["plans", "hiking"]
        })
    }

    fn inbound(message_id: i64, text: &str, at: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            chat_id: -100,
            thread_id: None,
            message_id,
            user_id: 42,
            author_name: "oksana".to_string(),
            text: text.to_string(),
            media_refs: vec![],
            has_user_media: false,
            reply_to_message_id: None,
            is_from_self: false,
            addressed: false,
            timestamp: at,
        }
    }

    async fn feed(monitor: &EpisodeMonitor, store: &FactStore, count: i64, at: DateTime<Utc>) {
        for i in 1..=count {
            let msg = inbound(i, &format!("planning message {i}"), at);
            let row_id = store.insert_message(&msg).unwrap().unwrap();
            monitor.observe(row_id, &msg);
        }
    }

    #[tokio::test]
    async fn quiet_buffer_finalizes_into_an_episode() {
        let provider = Arc::new(ScriptedProvider::default().with_structured(vec![summary_json()]));
        let (monitor, store) = monitor(120, 500, provider);
        let past = Utc::now() - Duration::seconds(180);
        feed(&monitor, &store, 4, past).await;

        assert_eq!(monitor.sweep().await, 1);
        let episodes = store.recent_episodes(-100, 5).unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].topic, "weekend plans");
        assert_eq!(episodes[0].emotional_valence, Valence::Positive);
        assert_eq!(episodes[0].participants, vec![42]);
        assert_eq!(monitor.buffered_threads(), 0);
    }

    #[tokio::test]
    async fn active_buffer_is_left_alone() {
        let provider = Arc::new(ScriptedProvider::default().with_structured(vec![summary_json()]));
        let (monitor, store) = monitor(120, 500, provider);
        feed(&monitor, &store, 4, Utc::now()).await;

        assert_eq!(monitor.sweep().await, 0);
        assert_eq!(monitor.buffered_threads(), 1);
    }

    #[tokio::test]
    async fn overflowing_buffer_finalizes_despite_recent_activity() {
        let provider = Arc::new(ScriptedProvider::default().with_structured(vec![summary_json()]));
        let (monitor, store) = monitor(120, 3, provider);
        feed(&monitor, &store, 3, Utc::now()).await;

        assert_eq!(monitor.sweep().await, 1);
    }

    #[tokio::test]
    async fn failed_summarization_keeps_the_buffer_for_retry() {
        let provider = Arc::new(ScriptedProvider::default().with_structured(vec![summary_json()]));
        provider.fail_generation(true);
        let (monitor, store) = monitor(120, 500, Arc::clone(&provider));
        let past = Utc::now() - Duration::seconds(180);
        feed(&monitor, &store, 4, past).await;

        assert_eq!(monitor.sweep().await, 0);
        assert_eq!(monitor.buffered_threads(), 1);

        // Provider recovers: the next sweep succeeds with the same buffer.
        provider.fail_generation(false);
        assert_eq!(monitor.sweep().await, 1);
        assert_eq!(store.recent_episodes(-100, 5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn single_message_buffers_are_discarded() {
        let provider = Arc::new(ScriptedProvider::default().with_structured(vec![summary_json()]));
        let (monitor, store) = monitor(120, 500, provider);
        let past = Utc::now() - Duration::seconds(180);
        feed(&monitor, &store, 1, past).await;

        assert_eq!(monitor.sweep().await, 0);
        assert_eq!(monitor.buffered_threads(), 0);
        assert!(store.recent_episodes(-100, 5).unwrap().is_empty());
    }
}
