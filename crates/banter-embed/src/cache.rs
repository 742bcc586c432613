use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use banter_core::config::EmbeddingConfig;
use banter_core::text::content_sha256;
use banter_store::FactStore;
use lru::LruCache;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use banter_agent::Provider;

use crate::{EmbedError, Result};

/// An embedding plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOutcome {
    pub vector: Vec<f32>,
    /// True when served from either cache tier without a provider call.
    pub cache_hit: bool,
}

/// Two-tier embedding cache. Cheap to clone via `Arc`.
pub struct EmbeddingCache {
    provider: Arc<dyn Provider>,
    store: Arc<FactStore>,
    memory: Mutex<LruCache<String, Vec<f32>>>,
    /// Bounds concurrent provider calls on miss.
    permits: Semaphore,
    /// Enforces the minimum inter-call delay toward the provider.
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
    call_timeout: Duration,
}

impl EmbeddingCache {
    pub fn new(cfg: &EmbeddingConfig, provider: Arc<dyn Provider>, store: Arc<FactStore>) -> Self {
        let capacity = NonZeroUsize::new(cfg.memory_entries.max(1)).unwrap();
        Self {
            provider,
            store,
            memory: Mutex::new(LruCache::new(capacity)),
            permits: Semaphore::new(cfg.concurrency.max(1)),
            last_call: Mutex::new(None),
            min_interval: Duration::from_millis(cfg.min_interval_ms),
            call_timeout: Duration::from_secs(cfg.timeout_seconds),
        }
    }

    /// Model id the cache keys embeddings under.
    pub fn model_id(&self) -> &str {
        self.provider.embedding_model_id()
    }

    /// Embed a text, consulting both cache tiers before the provider.
    pub async fn embed(&self, text: &str) -> Result<EmbedOutcome> {
        let key = content_sha256(text);

        // Memory tier. Held only for the lookup, never across an await.
        if let Some(vector) = self.memory.lock().unwrap().get(&key).cloned() {
            return Ok(EmbedOutcome {
                vector,
                cache_hit: true,
            });
        }

        // Persistent tier.
        if let Some(vector) = self
            .store
            .get_cached_embedding(&key, self.model_id())?
        {
            self.memory.lock().unwrap().put(key, vector.clone());
            return Ok(EmbedOutcome {
                vector,
                cache_hit: true,
            });
        }

        // Miss: call the provider under the semaphore + pacing delay.
        let vector = self.fetch_remote(text).await?;
        self.store
            .put_cached_embedding(&key, self.model_id(), &vector)?;
        self.memory.lock().unwrap().put(key, vector.clone());
        Ok(EmbedOutcome {
            vector,
            cache_hit: false,
        })
    }

    /// Cache-tier-only lookup: never calls the provider.
    pub fn lookup(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let key = content_sha256(text);
        if let Some(vector) = self.memory.lock().unwrap().get(&key).cloned() {
            return Ok(Some(vector));
        }
        Ok(self.store.get_cached_embedding(&key, self.model_id())?)
    }

    async fn fetch_remote(&self, text: &str) -> Result<Vec<f32>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbedError::Unavailable("semaphore closed".to_string()))?;

        // Pacing: compute how long to wait while holding the lock, sleep
        // after releasing it.
        let wait = {
            let mut last = self.last_call.lock().unwrap();
            let now = Instant::now();
            let wait = match *last {
                Some(prev) => self.min_interval.saturating_sub(now - prev),
                None => Duration::ZERO,
            };
            *last = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        debug!(len = text.len(), "embedding cache miss, calling provider");
        match tokio::time::timeout(self.call_timeout, self.provider.embed(text)).await {
            Ok(Ok(vector)) => Ok(vector),
            Ok(Err(e)) => {
                warn!(error = %e, "embedding provider failed");
                Err(EmbedError::Unavailable(e.to_string()))
            }
            Err(_) => Err(EmbedError::Unavailable(format!(
                "embedding call timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_agent::testing::ScriptedProvider;

    fn cache_with(provider: Arc<ScriptedProvider>) -> EmbeddingCache {
        let cfg = EmbeddingConfig {
            memory_entries: 4,
            concurrency: 2,
            min_interval_ms: 0,
            timeout_seconds: 5,
        };
        let store = Arc::new(FactStore::open_in_memory().unwrap());
        EmbeddingCache::new(&cfg, provider, store)
    }

    #[tokio::test]
    async fn first_call_misses_second_hits() {
        let cache = cache_with(Arc::new(ScriptedProvider::default()));
        let first = cache.embed("hello world").await.unwrap();
        assert!(!first.cache_hit);
        let second = cache.embed("hello world").await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.vector, second.vector);
    }

    #[tokio::test]
    async fn normalization_folds_equivalent_texts() {
        let cache = cache_with(Arc::new(ScriptedProvider::default()));
        cache.embed("Kyiv").await.unwrap();
        let second = cache.embed("  kyiv  ").await.unwrap();
        assert!(second.cache_hit);
    }

    #[tokio::test]
    async fn persistent_tier_survives_memory_eviction() {
        let cache = cache_with(Arc::new(ScriptedProvider::default()));
        cache.embed("first").await.unwrap();
        // Evict "first" out of the 4-entry LRU.
        for i in 0..5 {
            cache.embed(&format!("filler {i}")).await.unwrap();
        }
        assert!(cache.memory.lock().unwrap().peek(&content_sha256("first")).is_none());
        // Still a cache hit via the store tier.
        let again = cache.embed("first").await.unwrap();
        assert!(again.cache_hit);
    }

    #[tokio::test]
    async fn provider_outage_fails_fast_and_serves_cached() {
        let provider = Arc::new(ScriptedProvider::default());
        let cache = cache_with(Arc::clone(&provider));
        cache.embed("known text").await.unwrap();

        provider.fail_embeddings(true);
        // Cached text still works.
        assert!(cache.embed("known text").await.unwrap().cache_hit);
        // New text fails with Unavailable instead of stalling.
        let err = cache.embed("new text").await.unwrap_err();
        assert!(matches!(err, EmbedError::Unavailable(_)));
    }

    #[tokio::test]
    async fn lookup_never_calls_provider() {
        let provider = Arc::new(ScriptedProvider::default());
        let cache = cache_with(Arc::clone(&provider));
        provider.fail_embeddings(true);
        assert!(cache.lookup("never embedded").unwrap().is_none());
    }
}
