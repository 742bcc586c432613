//! `banter-learn` — the continuous learning pipeline.
//!
//! Four pieces, in message order: the rule [`classify`](classify::classify)r
//! labels every message by value; the [`Windower`](window::Windower) groups
//! non-noise messages into bounded windows; the
//! [`Extractor`](extract::Extractor)s turn closed windows into candidate
//! facts; and the [`QualityManager`](quality::QualityManager) dedupes,
//! resolves conflicts, decays, and persists them atomically.

pub mod classify;
pub mod extract;
pub mod normalize;
pub mod quality;
pub mod window;

use banter_core::error::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LearnError {
    #[error(transparent)]
    Store(#[from] banter_store::StoreError),

    #[error(transparent)]
    Embed(#[from] banter_embed::EmbedError),

    #[error("Extractor model call failed: {0}")]
    Model(#[from] banter_agent::ProviderError),

    #[error("Extractor output malformed: {0}")]
    BadModelOutput(String),
}

impl Classify for LearnError {
    fn kind(&self) -> ErrorKind {
        match self {
            LearnError::Store(e) => e.kind(),
            LearnError::Embed(e) => e.kind(),
            LearnError::Model(e) => e.kind(),
            LearnError::BadModelOutput(_) => ErrorKind::PermanentExternal,
        }
    }
}

pub type Result<T> = std::result::Result<T, LearnError>;
