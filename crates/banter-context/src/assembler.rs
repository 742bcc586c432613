//! Three-tier context assembly under a hard token budget.
//!
//! Tier order and budget shares: episodic summaries (~33%), hybrid
//! retrieval over prior messages (~33%), recent conversation tail
//! (whatever remains). The chars/4 estimator enforces the budget per tier;
//! the total emitted estimate never exceeds it.

use std::collections::HashMap;
use std::sync::Arc;

use banter_core::config::ContextConfig;
use banter_core::cosine_similarity;
use banter_core::text::estimate_tokens;
use banter_core::types::InboundMessage;
use banter_embed::EmbeddingCache;
use banter_store::types::StoredMessage;
use banter_store::FactStore;
use chrono::Utc;
use tracing::{debug, warn};

use banter_agent::{Role, Turn};

use crate::Result;

/// How many episodes the episodic tier may draw from.
const EPISODE_LIMIT: usize = 5;
/// Keyword and semantic candidate pool sizes before merging.
const KEYWORD_POOL: usize = 20;
const SEMANTIC_POOL: usize = 200;
/// Retrieved messages kept after merge and rerank.
const RETRIEVED_TOP_K: usize = 10;
/// Recent-tail candidate pool.
const RECENT_POOL: usize = 50;
/// Emergency fallback size when every tier is empty.
const FALLBACK_MESSAGES: usize = 10;

/// The assembled prompt: a system prefix plus ordered turns. The current
/// message is always the final turn.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_prefix: String,
    pub turns: Vec<Turn>,
    pub token_estimate: usize,
}

pub struct ContextAssembler {
    store: Arc<FactStore>,
    embeddings: Arc<EmbeddingCache>,
    cfg: ContextConfig,
}

impl ContextAssembler {
    pub fn new(store: Arc<FactStore>, embeddings: Arc<EmbeddingCache>, cfg: ContextConfig) -> Self {
        Self {
            store,
            embeddings,
            cfg,
        }
    }

    /// Build the context for replying to `msg`.
    pub async fn assemble(&self, msg: &InboundMessage) -> Result<AssembledContext> {
        let budget = self.cfg.token_budget;
        let mut used = 0usize;

        // Profile summary joins the system prefix ahead of the tiers.
        let mut prefix_sections: Vec<String> = Vec::new();
        if let Some(profile) = self.store.get_profile(msg.user_id, msg.chat_id)? {
            if let Some(summary) = profile.summary_text {
                let fragment = format!("About {}: {}", profile.display_name, summary);
                used += estimate_tokens(&fragment);
                prefix_sections.push(fragment);
            }
        }

        let episodic_budget = (budget as f64 * self.cfg.share_episodic) as usize;
        let retrieved_budget = (budget as f64 * self.cfg.share_retrieved) as usize;

        // Tier 1: episodic.
        let (episodic, episodic_tokens) = self.episodic_tier(msg.chat_id, episodic_budget)?;
        used += episodic_tokens;
        if !episodic.is_empty() {
            prefix_sections.push(format!("Past conversations:\n{}", episodic.join("\n")));
        }

        // Tier 2: retrieved.
        let (retrieved, retrieved_tokens) =
            self.retrieved_tier(msg, retrieved_budget).await?;
        used += retrieved_tokens;
        if !retrieved.is_empty() {
            prefix_sections.push(format!("Possibly relevant history:\n{}", retrieved.join("\n")));
        }

        // Tier 3: recent tail takes everything still unspent.
        let current_turn_tokens = estimate_tokens(&format_turn_text(msg));
        let recent_budget = budget
            .saturating_sub(used)
            .saturating_sub(current_turn_tokens);
        let (mut turns, recent_tokens) = self.recent_tier(msg, recent_budget)?;
        used += recent_tokens;

        // Emergency fallback: no tier produced anything.
        if prefix_sections.is_empty() && turns.is_empty() {
            let (fallback, fallback_tokens) = self.fallback_tier(msg)?;
            used += fallback_tokens;
            turns = fallback;
        }

        turns.push(Turn {
            role: Role::User,
            text: format_turn_text(msg),
        });
        used += current_turn_tokens;

        debug!(
            chat_id = msg.chat_id,
            tokens = used,
            budget,
            turns = turns.len(),
            "context assembled"
        );
        Ok(AssembledContext {
            system_prefix: prefix_sections.join("\n\n"),
            turns,
            token_estimate: used,
        })
    }

    /// Up to five most recently accessed episodes, newest first, within
    /// the tier budget.
    fn episodic_tier(&self, chat_id: i64, budget: usize) -> Result<(Vec<String>, usize)> {
        let episodes = self.store.recent_episodes(chat_id, EPISODE_LIMIT)?;
        let mut lines = Vec::new();
        let mut used = 0usize;
        let mut touched = Vec::new();
        for e in &episodes {
            let line = if e.tags.is_empty() {
                format!("- {}: {}", e.topic, e.summary)
            } else {
                format!("- {}: {} [{}]", e.topic, e.summary, e.tags.join(", "))
            };
            let cost = estimate_tokens(&line);
            if used + cost > budget {
                break;
            }
            used += cost;
            touched.push(e.id);
            lines.push(line);
        }
        self.store.touch_episodes(&touched)?;
        Ok((lines, used))
    }

    /// Hybrid retrieval: keyword rank merged with embedding similarity,
    /// reweighted by recency, deduped by message id, best first.
    async fn retrieved_tier(
        &self,
        msg: &InboundMessage,
        budget: usize,
    ) -> Result<(Vec<String>, usize)> {
        if msg.text.trim().is_empty() {
            return Ok((Vec::new(), 0));
        }

        // Relevance per message id, plus the message itself.
        let mut scored: HashMap<i64, (StoredMessage, f64)> = HashMap::new();

        let keyword_hits = self
            .store
            .keyword_search(msg.chat_id, &msg.text, KEYWORD_POOL)?;
        let n = keyword_hits.len().max(1);
        for (i, (hit, _rank)) in keyword_hits.into_iter().enumerate() {
            // FTS returns best-first; turn position into a [0,1] score.
            let relevance = 1.0 - i as f64 / n as f64;
            scored.insert(hit.id, (hit, relevance));
        }

        // Semantic leg degrades silently when embeddings are down.
        match self.embeddings.embed(&msg.text).await {
            Ok(outcome) => {
                let candidates = self.store.semantic_candidates(
                    msg.chat_id,
                    self.embeddings.model_id(),
                    SEMANTIC_POOL,
                )?;
                for (hit, vector) in candidates {
                    let sim = cosine_similarity(&vector, &outcome.vector).max(0.0);
                    scored
                        .entry(hit.id)
                        .and_modify(|(_, r)| *r = r.max(sim))
                        .or_insert((hit, sim));
                }
            }
            Err(e) => {
                warn!(error = %e, "semantic retrieval degraded to keyword only");
            }
        }

        // Never retrieve the message being replied to.
        scored.retain(|_, (hit, _)| hit.message_id != msg.message_id);

        let now = Utc::now();
        let alpha = self.cfg.recency_alpha;
        let mut ranked: Vec<(StoredMessage, f64)> = scored
            .into_values()
            .map(|(hit, relevance)| {
                let age_hours = (now - hit.timestamp).num_seconds().max(0) as f64 / 3600.0;
                let final_score = alpha * relevance + (1.0 - alpha) * (-age_hours / 168.0).exp();
                (hit, final_score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(RETRIEVED_TOP_K);

        // Lowest-relevance-first truncation: take best while they fit.
        let mut lines = Vec::new();
        let mut used = 0usize;
        for (hit, _) in ranked {
            let line = format!(
                "- [{}] {}: {}",
                hit.timestamp.format("%Y-%m-%d %H:%M"),
                hit.author_name,
                hit.text
            );
            let cost = estimate_tokens(&line);
            if used + cost > budget {
                break;
            }
            used += cost;
            lines.push(line);
        }
        Ok((lines, used))
    }

    /// The contiguous recent tail of the same (chat, thread), chronological,
    /// truncated oldest-first to fit.
    fn recent_tier(&self, msg: &InboundMessage, budget: usize) -> Result<(Vec<Turn>, usize)> {
        let recent = self.store.recent_in_scope(msg.scope(), RECENT_POOL)?;
        let mut picked: Vec<Turn> = Vec::new();
        let mut used = 0usize;
        // Walk newest → oldest so the oldest messages fall off first.
        for m in recent.iter().rev() {
            if m.message_id == msg.message_id {
                continue;
            }
            let turn = to_turn(m);
            let cost = estimate_tokens(&turn.text);
            if used + cost > budget {
                break;
            }
            used += cost;
            picked.push(turn);
        }
        picked.reverse();
        Ok((picked, used))
    }

    /// Most recent messages of the whole chat, ignoring thread scoping.
    fn fallback_tier(&self, msg: &InboundMessage) -> Result<(Vec<Turn>, usize)> {
        let recent = self.store.recent_in_chat(msg.chat_id, FALLBACK_MESSAGES)?;
        let mut used = 0usize;
        let turns: Vec<Turn> = recent
            .iter()
            .filter(|m| m.message_id != msg.message_id)
            .map(|m| {
                let t = to_turn(m);
                used += estimate_tokens(&t.text);
                t
            })
            .collect();
        Ok((turns, used))
    }
}

fn to_turn(m: &StoredMessage) -> Turn {
    if m.is_from_self {
        Turn {
            role: Role::Assistant,
            text: m.text.clone(),
        }
    } else {
        Turn {
            role: Role::User,
            text: format!("{}: {}", m.author_name, m.text),
        }
    }
}

fn format_turn_text(msg: &InboundMessage) -> String {
    format!("{}: {}", msg.author_name, msg.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_agent::testing::ScriptedProvider;
    use banter_core::config::EmbeddingConfig;
    use banter_store::episodes::NewEpisode;
    use banter_store::types::Valence;

    fn assembler_with_budget(budget: usize) -> (ContextAssembler, Arc<FactStore>) {
        let store = Arc::new(FactStore::open_in_memory().unwrap());
        let provider = Arc::new(ScriptedProvider::default());
        let embeddings = Arc::new(EmbeddingCache::new(
            &EmbeddingConfig {
                memory_entries: 64,
                concurrency: 2,
                min_interval_ms: 0,
                timeout_seconds: 5,
            },
            provider as Arc<dyn banter_agent::Provider>,
            Arc::clone(&store),
        ));
        let cfg = ContextConfig {
            token_budget: budget,
            ..ContextConfig::default()
        };
        (
            ContextAssembler::new(Arc::clone(&store), embeddings, cfg),
            store,
        )
    }

    fn inbound(message_id: i64, user_id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: -100,
            thread_id: None,
            message_id,
            user_id,
            author_name: format!("user{user_id}"),
            text: text.to_string(),
            media_refs: vec![],
            has_user_media: false,
            reply_to_message_id: None,
            is_from_self: false,
            addressed: true,
            timestamp: Utc::now(),
        }
    }

    fn seed_messages(store: &FactStore, count: i64) {
        for i in 1..=count {
            store
                .insert_message(&inbound(i, 42, &format!("message number {i} about various things")))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn current_message_is_the_final_turn() {
        let (assembler, store) = assembler_with_budget(8000);
        seed_messages(&store, 3);
        let msg = inbound(4, 42, "what did we decide?");
        store.insert_message(&msg).unwrap();

        let ctx = assembler.assemble(&msg).await.unwrap();
        let last = ctx.turns.last().unwrap();
        assert!(last.text.contains("what did we decide?"));
        assert_eq!(last.role, Role::User);
    }

    #[tokio::test]
    async fn budget_is_never_exceeded() {
        let (assembler, store) = assembler_with_budget(200);
        for i in 1..=40 {
            store
                .insert_message(&inbound(
                    i,
                    42,
                    &format!("a fairly long chat message number {i} with plenty of words in it to cost tokens"),
                ))
                .unwrap();
        }
        let msg = inbound(41, 42, "what was message twelve about exactly?");
        store.insert_message(&msg).unwrap();

        let ctx = assembler.assemble(&msg).await.unwrap();
        assert!(ctx.token_estimate <= 200, "estimate {} over budget", ctx.token_estimate);
    }

    #[tokio::test]
    async fn profile_summary_joins_the_system_prefix() {
        let (assembler, store) = assembler_with_budget(8000);
        store.upsert_profile(42, -100, "oksana").unwrap();
        store
            .set_profile_summary(42, -100, "Backend developer from Kyiv, likes chess.")
            .unwrap();
        seed_messages(&store, 2);
        let msg = inbound(3, 42, "any advice?");
        store.insert_message(&msg).unwrap();

        let ctx = assembler.assemble(&msg).await.unwrap();
        assert!(ctx.system_prefix.contains("Backend developer from Kyiv"));
        assert!(ctx.system_prefix.contains("oksana"));
    }

    #[tokio::test]
    async fn episodes_appear_and_get_touched() {
        let (assembler, store) = assembler_with_budget(8000);
        let id = store
            .insert_episode(&NewEpisode {
                chat_id: -100,
                thread_id: None,
                topic: "release planning".to_string(),
                summary: "The group agreed to ship on Friday.".to_string(),
                message_ids: vec![1, 2],
                participants: vec![42],
                importance: 0.8,
                emotional_valence: Valence::Neutral,
                tags: vec!["work".to_string()],
            })
            .unwrap();
        {
            let conn = store.conn_for_tests();
            conn.execute(
                "UPDATE episodes SET last_accessed_at = '2020-01-01T00:00:00+00:00'",
                [],
            )
            .unwrap();
        }
        seed_messages(&store, 2);
        let msg = inbound(3, 42, "when do we ship?");
        store.insert_message(&msg).unwrap();

        let ctx = assembler.assemble(&msg).await.unwrap();
        assert!(ctx.system_prefix.contains("release planning"));
        // Reading the episode bumped its recency.
        let eps = store.recent_episodes(-100, 5).unwrap();
        assert_eq!(eps[0].id, id);
        assert!(eps[0].last_accessed_at.timestamp() > 1_600_000_000);
    }

    #[tokio::test]
    async fn empty_store_falls_back_to_just_the_current_message() {
        let (assembler, store) = assembler_with_budget(8000);
        let msg = inbound(1, 42, "hello there");
        store.insert_message(&msg).unwrap();

        let ctx = assembler.assemble(&msg).await.unwrap();
        assert_eq!(ctx.turns.len(), 1);
        assert!(ctx.system_prefix.is_empty());
    }

    #[tokio::test]
    async fn retrieval_finds_keyword_matches_from_history() {
        let (assembler, store) = assembler_with_budget(8000);
        store
            .insert_message(&inbound(1, 7, "the database migration finished last night"))
            .unwrap();
        for i in 2..=30 {
            store
                .insert_message(&inbound(i, 42, &format!("unrelated chatter number {i}")))
                .unwrap();
        }
        let msg = inbound(31, 42, "how did the migration go?");
        store.insert_message(&msg).unwrap();

        let ctx = assembler.assemble(&msg).await.unwrap();
        assert!(ctx.system_prefix.contains("database migration finished"));
    }

    #[tokio::test]
    async fn agent_messages_become_assistant_turns() {
        let (assembler, store) = assembler_with_budget(8000);
        let mut reply = inbound(1, 999, "happy to help with that");
        reply.is_from_self = true;
        store.insert_message(&reply).unwrap();
        let msg = inbound(50, 42, "thanks again!");
        store.insert_message(&msg).unwrap();

        let ctx = assembler.assemble(&msg).await.unwrap();
        assert!(ctx
            .turns
            .iter()
            .any(|t| t.role == Role::Assistant && t.text.contains("happy to help")));
    }
}
