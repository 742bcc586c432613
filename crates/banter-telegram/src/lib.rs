//! `banter-telegram` — the Telegram channel adapter.
//!
//! Long-polling teloxide dispatcher on the inbound side, chunked
//! MarkdownV2-with-fallback sends on the outbound side. Everything
//! platform-specific stays here: the pipeline sees only
//! `InboundMessage` / `OutboundMessage`.

pub mod adapter;
pub mod handler;
pub mod send;

pub use adapter::{TelegramAdapter, TelegramOutbound};
