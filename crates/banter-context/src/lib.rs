//! `banter-context` — layered prompt memory.
//!
//! The [`ContextAssembler`](assembler::ContextAssembler) builds the
//! token-budgeted three-tier context for a reply: episodic summaries,
//! hybrid-retrieved prior messages, and the recent conversation tail. The
//! [`EpisodeMonitor`](episodes::EpisodeMonitor) watches long-running
//! threads and condenses them into durable episodes the assembler reads
//! back.

pub mod assembler;
pub mod episodes;

use banter_core::error::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Store(#[from] banter_store::StoreError),

    #[error("Episode summarization failed: {0}")]
    Summarize(#[from] banter_agent::ProviderError),

    #[error("Episode summary malformed: {0}")]
    BadSummary(String),
}

impl Classify for ContextError {
    fn kind(&self) -> ErrorKind {
        match self {
            ContextError::Store(e) => e.kind(),
            ContextError::Summarize(e) => e.kind(),
            ContextError::BadSummary(_) => ErrorKind::PermanentExternal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;
