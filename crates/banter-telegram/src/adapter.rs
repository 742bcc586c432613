//! Telegram channel adapter.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling event
//! loop until shutdown. The outbound half implements the pipeline's
//! [`ChatOutbound`] seam so addressed and proactive replies go out the
//! same door.

use std::sync::Arc;

use async_trait::async_trait;
use banter_core::config::TelegramConfig;
use banter_core::types::OutboundMessage;
use banter_pipeline::{ChatOutbound, Pipeline};
use teloxide::prelude::*;
use teloxide::types::{MessageId, ThreadId};
use tracing::info;

use crate::handler::handle_message;
use crate::send;

/// Outbound sender shared with the pipeline.
pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatOutbound for TelegramOutbound {
    async fn send(&self, msg: &OutboundMessage) -> Result<i64, String> {
        let thread = msg.thread_id.map(|t| ThreadId(MessageId(t as i32)));
        let reply = msg.reply_to_message_id.map(|r| MessageId(r as i32));
        let sent = send::deliver(
            &self.bot,
            ChatId(msg.chat_id),
            thread,
            reply,
            &msg.text,
        )
        .await;
        sent.map(|id| id.0 as i64)
            .ok_or_else(|| format!("delivery to chat {} failed", msg.chat_id))
    }
}

/// Long-polling adapter. Runs for the lifetime of the process.
pub struct TelegramAdapter {
    bot: Bot,
    pipeline: Arc<Pipeline>,
    config: TelegramConfig,
}

impl TelegramAdapter {
    pub fn new(bot: Bot, pipeline: Arc<Pipeline>, config: TelegramConfig) -> Self {
        Self {
            bot,
            pipeline,
            config,
        }
    }

    /// Connect and drive the dispatcher until the process shuts down.
    pub async fn run(self) {
        info!("telegram: starting long-polling dispatcher");

        let handler = Update::filter_message().endpoint(handle_message);

        Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![self.pipeline, self.config])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;
    }
}
