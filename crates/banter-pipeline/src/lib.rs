//! `banter-pipeline` — the per-message orchestrator and the asynchronous
//! window-processing path.
//!
//! One [`Pipeline`] instance owns every component: on each inbound message
//! it persists, classifies, windows, and — when addressed — replies through
//! the model with tools; closed windows flow through the queue into
//! extraction, fact quality, intent classification, and the proactive
//! trigger. The hot path recovers from every learning-side failure and
//! always answers addressed messages, with a fixed fallback when the model
//! is down.

mod orchestrator;
mod reaction;
mod windows;

use std::sync::Arc;

use async_trait::async_trait;
use banter_core::config::BanterConfig;
use banter_core::error::{Classify, ErrorKind};
use banter_core::types::{ChatScope, OutboundMessage};
use dashmap::DashMap;
use banter_embed::EmbeddingCache;
use banter_learn::quality::QualityManager;
use banter_learn::window::Windower;
use banter_queue::{BreakerRegistry, EventQueue};
use banter_store::FactStore;
use thiserror::Error;

use banter_agent::Provider;
use banter_context::assembler::ContextAssembler;
use banter_context::episodes::EpisodeMonitor;
use banter_proactive::{IntentClassifier, ProactiveTrigger};

/// Platform send seam. Implemented by the chat adapter; returns the
/// platform message id of the sent message.
#[async_trait]
pub trait ChatOutbound: Send + Sync {
    async fn send(&self, msg: &OutboundMessage) -> std::result::Result<i64, String>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] banter_store::StoreError),

    #[error(transparent)]
    Learn(#[from] banter_learn::LearnError),

    #[error(transparent)]
    Context(#[from] banter_context::ContextError),

    #[error(transparent)]
    Provider(#[from] banter_agent::ProviderError),

    #[error("Send failed: {0}")]
    Send(String),
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Store(e) => e.kind(),
            PipelineError::Learn(e) => e.kind(),
            PipelineError::Context(e) => e.kind(),
            PipelineError::Provider(e) => e.kind(),
            PipelineError::Send(_) => ErrorKind::TransientExternal,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Everything the agent is, wired together.
pub struct Pipeline {
    pub(crate) config: BanterConfig,
    pub(crate) store: Arc<FactStore>,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) outbound: Arc<dyn ChatOutbound>,
    pub(crate) windower: Windower,
    pub(crate) episodes: Arc<EpisodeMonitor>,
    pub(crate) assembler: ContextAssembler,
    pub(crate) quality: QualityManager,
    pub(crate) intent: IntentClassifier,
    pub(crate) trigger: ProactiveTrigger,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) breakers: BreakerRegistry,
    /// Per-(chat, thread) ordering locks: the hot path processes one
    /// message at a time within a scope, in arrival order.
    pub(crate) scope_locks: DashMap<ChatScope, Arc<tokio::sync::Mutex<()>>>,
}

impl Pipeline {
    pub fn new(
        config: BanterConfig,
        store: Arc<FactStore>,
        provider: Arc<dyn Provider>,
        outbound: Arc<dyn ChatOutbound>,
    ) -> Self {
        let embeddings = Arc::new(EmbeddingCache::new(
            &config.embedding,
            Arc::clone(&provider),
            Arc::clone(&store),
        ));
        Self {
            windower: Windower::new(&config.window),
            episodes: Arc::new(EpisodeMonitor::new(
                Arc::clone(&store),
                Arc::clone(&provider),
                &config.episodes,
            )),
            assembler: ContextAssembler::new(
                Arc::clone(&store),
                Arc::clone(&embeddings),
                config.context.clone(),
            ),
            quality: QualityManager::new(
                Arc::clone(&store),
                Arc::clone(&embeddings),
                config.facts.clone(),
            ),
            intent: IntentClassifier::new(Arc::clone(&provider)),
            trigger: ProactiveTrigger::new(Arc::clone(&store), config.proactive.clone()),
            queue: Arc::new(EventQueue::new(config.queue.capacity)),
            breakers: BreakerRegistry::new(config.breaker.clone()),
            scope_locks: DashMap::new(),
            config,
            store,
            provider,
            outbound,
        }
    }

    /// The shared event queue, for wiring the worker pool.
    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    /// Finalize idle episode buffers. The inline (non-queued) counterpart
    /// of the `EpisodeTick` event.
    pub async fn sweep_episodes(&self) -> usize {
        self.episodes.sweep().await
    }

    /// Expire unreacted proactive sends into `ignored`. Driven by a
    /// periodic task in the binary.
    pub fn sweep_reactions(&self) -> Result<usize> {
        let timeout = chrono::Duration::seconds(
            self.config.proactive.reaction_timeout_seconds as i64,
        );
        Ok(self.store.expire_unreacted(timeout)?)
    }

    /// Prune messages past the retention horizon.
    pub fn sweep_retention(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::days(self.config.retention.days as i64);
        Ok(self.store.prune_messages(cutoff)?)
    }
}
