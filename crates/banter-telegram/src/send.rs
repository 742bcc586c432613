//! Message sending helpers.
//!
//! Telegram's message limit is 4096 characters; we use 4090 for safety.
//! Tries MarkdownV2 first and falls back to plain text when Telegram
//! rejects the parse mode. Returns the platform id of the first chunk —
//! that is the message users reply to.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode, ReplyParameters, ThreadId};
use tracing::warn;

/// Maximum characters per Telegram message (limit is 4096; 4090 for safety).
const CHUNK_MAX: usize = 4090;

/// Code-fence-aware splitter. When a split falls inside a fenced block the
/// fence is closed before the boundary and re-opened in the next chunk.
pub fn split_chunks(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > CHUNK_MAX {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(ref lang) = fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current.push('\n');
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after) = trimmed.strip_prefix("```") {
            fence_lang = match fence_lang {
                Some(_) => None,
                None => Some(after.trim().to_string()),
            };
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Safety net: force-split any single line longer than the limit.
    // Cuts land on char boundaries — CHUNK_MAX is a byte offset and can
    // fall mid-codepoint in Cyrillic or emoji text.
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= CHUNK_MAX {
            result.push(chunk);
            continue;
        }
        let mut remaining = chunk.as_str();
        while remaining.len() > CHUNK_MAX {
            let window_end = floor_char_boundary(remaining, CHUNK_MAX);
            let head = &remaining[..window_end];
            let split_at = match head.rfind('\n').or_else(|| head.rfind(' ')) {
                Some(i) if i > 0 => i,
                _ => window_end,
            };
            result.push(remaining[..split_at].to_string());
            remaining = remaining[split_at..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}

/// Largest char boundary at or below `max` bytes into `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Escape special characters for Telegram MarkdownV2.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '#' | '+' | '-' | '=' | '|' | '{'
            | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Send `text` as one or more chunks, optionally as a reply inside a forum
/// topic. Returns the id of the first delivered chunk, or `None` when
/// every attempt failed.
pub async fn deliver(
    bot: &Bot,
    chat_id: ChatId,
    thread_id: Option<ThreadId>,
    reply_to: Option<MessageId>,
    text: &str,
) -> Option<MessageId> {
    let chunks = split_chunks(text);
    let mut first_sent: Option<MessageId> = None;

    for (i, chunk) in chunks.iter().enumerate() {
        // Only the first chunk replies to the trigger message.
        let reply = if i == 0 { reply_to } else { None };
        let sent = send_chunk(bot, chat_id, thread_id, reply, chunk).await;
        match sent {
            Some(id) => {
                if first_sent.is_none() {
                    first_sent = Some(id);
                }
            }
            None => warn!(chunk_index = i, chat_id = chat_id.0, "chunk delivery failed"),
        }
        if i + 1 < chunks.len() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    first_sent
}

async fn send_chunk(
    bot: &Bot,
    chat_id: ChatId,
    thread_id: Option<ThreadId>,
    reply_to: Option<MessageId>,
    chunk: &str,
) -> Option<MessageId> {
    // MarkdownV2 first.
    let escaped = escape_markdown_v2(chunk);
    let mut req = bot
        .send_message(chat_id, &escaped)
        .parse_mode(ParseMode::MarkdownV2);
    if let Some(t) = thread_id {
        req = req.message_thread_id(t);
    }
    if let Some(r) = reply_to {
        req = req.reply_parameters(ReplyParameters::new(r));
    }
    if let Ok(sent) = req.await {
        return Some(sent.id);
    }

    // MarkdownV2 rejected — plain text fallback.
    let mut req = bot.send_message(chat_id, chunk);
    if let Some(t) = thread_id {
        req = req.message_thread_id(t);
    }
    if let Some(r) = reply_to {
        req = req.reply_parameters(ReplyParameters::new(r));
    }
    match req.await {
        Ok(sent) => Some(sent.id),
        Err(e) => {
            warn!(error = %e, chat_id = chat_id.0, "plain-text fallback failed");
            None
        }
    }
}
