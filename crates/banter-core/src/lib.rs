//! `banter-core` — configuration, error taxonomy, and shared chat types.
//!
//! Everything here is dependency-light so every other crate can use it
//! without cycles: the config tree (`banter.toml` + `BANTER_*` env
//! overrides), the `ErrorKind` classification that drives retry and
//! circuit-breaker policy, and the platform-agnostic message records the
//! pipeline passes around.

pub mod config;
pub mod error;
pub mod similarity;
pub mod text;
pub mod types;

pub use config::BanterConfig;
pub use error::{ErrorKind, Result};
pub use similarity::cosine_similarity;
