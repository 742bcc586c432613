//! Inbound Telegram message handling: platform record → `InboundMessage`,
//! the addressed predicate, and the non-blocking pipeline invocation.

use std::sync::Arc;

use banter_core::config::TelegramConfig;
use banter_core::types::InboundMessage;
use banter_pipeline::Pipeline;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tracing::debug;

/// Main message handler registered in the teloxide Dispatcher.
///
/// Runs for every incoming `Message`:
/// 1. Bot-message filter (other bots are ignored entirely)
/// 2. DM guard
/// 3. Platform record → `InboundMessage` mapping
/// 4. Addressed predicate (mention / reply-to-us / trigger keyword)
/// 5. Non-blocking pipeline invocation with a typing indicator while
///    an addressed reply is being composed
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    pipeline: Arc<Pipeline>,
    config: TelegramConfig,
) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    if msg.chat.is_private() && !config.dm_allowed {
        return Ok(());
    }

    let inbound = map_message(&msg, &config);
    debug!(
        chat_id = inbound.chat_id,
        message_id = inbound.message_id,
        addressed = inbound.addressed,
        "telegram message received"
    );

    // The dispatcher must never wait on the pipeline: long model calls run
    // in their own task, with a typing indicator for addressed replies.
    let addressed = inbound.addressed;
    let chat_id = msg.chat.id;
    tokio::spawn(async move {
        let typing = addressed.then(|| spawn_typing(bot, chat_id));
        pipeline.handle_message(&inbound).await;
        if let Some(handle) = typing {
            handle.abort();
        }
    });

    Ok(())
}

/// Convert a Telegram message into the platform-agnostic record.
fn map_message(msg: &Message, config: &TelegramConfig) -> InboundMessage {
    let from = msg.from.as_ref().expect("caller checked sender");
    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    let mut media_refs = Vec::new();
    let mut has_user_media = false;
    if msg.photo().is_some() {
        media_refs.push("photo".to_string());
        has_user_media = true;
    }
    if msg.video().is_some() {
        media_refs.push("video".to_string());
        has_user_media = true;
    }
    if msg.voice().is_some() {
        media_refs.push("voice".to_string());
        has_user_media = true;
    }
    if msg.audio().is_some() {
        media_refs.push("audio".to_string());
        has_user_media = true;
    }
    if msg.document().is_some() {
        media_refs.push("document".to_string());
        has_user_media = true;
    }
    // Stickers and forwarded media are not user-authored content.
    if msg.sticker().is_some() {
        media_refs.push("sticker".to_string());
    }
    if msg.forward_origin().is_some() {
        has_user_media = false;
    }

    InboundMessage {
        chat_id: msg.chat.id.0,
        thread_id: msg.thread_id.map(|t| t.0 .0 as i64),
        message_id: msg.id.0 as i64,
        user_id: from.id.0 as i64,
        author_name: from.full_name(),
        text: text.clone(),
        media_refs,
        has_user_media,
        reply_to_message_id: msg.reply_to_message().map(|r| r.id.0 as i64),
        is_from_self: false,
        addressed: is_addressed(msg, &text, config),
        timestamp: msg.date,
    }
}

/// The addressed predicate: @-mention of our username, a direct reply to
/// one of our messages, or a configured trigger keyword.
fn is_addressed(msg: &Message, text: &str, config: &TelegramConfig) -> bool {
    // DMs are always addressed to us.
    if msg.chat.is_private() {
        return true;
    }

    let lower = text.to_lowercase();
    if !config.bot_username.is_empty() {
        let mention = format!("@{}", config.bot_username.to_lowercase());
        if lower.contains(&mention) {
            return true;
        }
    }

    if let Some(replied) = msg.reply_to_message() {
        let replied_to_us = replied.from.as_ref().is_some_and(|u| {
            u.is_bot
                && u.username
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(&config.bot_username))
        });
        if replied_to_us {
            return true;
        }
    }

    config
        .trigger_keywords
        .iter()
        .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
}

/// Refresh the typing indicator every 4 seconds (Telegram expires it
/// after ~5) until the returned task is aborted.
fn spawn_typing(bot: Bot, chat_id: ChatId) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
            tokio::time::sleep(std::time::Duration::from_secs(4)).await;
        }
    })
}
