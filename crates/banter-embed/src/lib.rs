//! `banter-embed` — content-addressed embedding cache.
//!
//! Two tiers over the model provider's embed call: a bounded in-memory LRU
//! keyed by `sha256(normalized text) + model id`, write-through to the
//! store's persistent tier. Misses call the provider under a concurrency
//! semaphore with a minimum inter-call delay so a burst of new text cannot
//! trample external rate limits.
//!
//! On provider failure the cache fails fast with [`EmbedError::Unavailable`];
//! callers degrade (string-equality dedup, keyword-only retrieval) and
//! never stall.

mod cache;

pub use cache::{EmbedOutcome, EmbeddingCache};

use banter_core::error::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The embedding provider is unreachable, rate limited, or timed out.
    #[error("Embedding unavailable: {0}")]
    Unavailable(String),

    /// The persistent tier rejected the write/read.
    #[error("Embedding cache store error: {0}")]
    Store(#[from] banter_store::StoreError),
}

impl Classify for EmbedError {
    fn kind(&self) -> ErrorKind {
        match self {
            EmbedError::Unavailable(_) => ErrorKind::TransientExternal,
            EmbedError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EmbedError>;
