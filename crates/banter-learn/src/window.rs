//! Conversation windower.
//!
//! Keeps at most one OPEN window per (chat, thread). Non-noise messages
//! append to the open window or open a fresh one; a window closes on size,
//! inactivity, or shutdown flush. Closing is pure in-memory work — the
//! caller persists the emitted record and enqueues the processing event.

use banter_core::config::WindowConfig;
use banter_core::types::{ChatScope, InboundMessage, Priority, ValueLabel};
use banter_store::types::ClosureReason;
use banter_store::windows::NewWindow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

/// An OPEN window's in-memory state.
#[derive(Debug, Clone)]
struct OpenWindow {
    first_row_id: i64,
    last_row_id: i64,
    message_count: usize,
    participants: Vec<i64>,
    opened_at: DateTime<Utc>,
    dominant: ValueLabel,
}

/// A window the moment it closed, ready for persistence and queueing.
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub scope: ChatScope,
    pub record: NewWindow,
    pub priority: Priority,
}

pub struct Windower {
    open: DashMap<ChatScope, OpenWindow>,
    size: usize,
    timeout: Duration,
    drop_low: bool,
}

impl Windower {
    pub fn new(cfg: &WindowConfig) -> Self {
        Self {
            open: DashMap::new(),
            size: cfg.size.max(1),
            timeout: Duration::seconds(cfg.timeout_seconds as i64),
            drop_low: cfg.enable_filtering,
        }
    }

    /// Feed one stored message through the windower.
    ///
    /// `row_id` is the message's store row id. Returns the closed window
    /// when this message completed one. When both the size and timeout
    /// thresholds hold at once, size wins and the closure reason says so.
    pub fn observe(
        &self,
        row_id: i64,
        msg: &InboundMessage,
        label: ValueLabel,
    ) -> Option<ClosedWindow> {
        if label == ValueLabel::Noise {
            return None;
        }
        if self.drop_low && label == ValueLabel::Low {
            return None;
        }

        let scope = msg.scope();
        let now = msg.timestamp;

        let mut entry = self.open.entry(scope).or_insert_with(|| {
            debug!(%scope, row_id, "opening window");
            OpenWindow {
                first_row_id: row_id,
                last_row_id: row_id,
                message_count: 0,
                participants: Vec::new(),
                opened_at: now,
                dominant: label,
            }
        });

        entry.last_row_id = row_id;
        entry.message_count += 1;
        entry.dominant = entry.dominant.max(label);
        if !entry.participants.contains(&msg.user_id) {
            entry.participants.push(msg.user_id);
        }

        let reason = if entry.message_count >= self.size {
            Some(ClosureReason::Size)
        } else if now - entry.opened_at >= self.timeout {
            Some(ClosureReason::Timeout)
        } else {
            None
        };

        let reason = reason?;
        let window = entry.clone();
        drop(entry);
        self.open.remove(&scope);
        Some(close(scope, window, reason, now))
    }

    /// Close every open window whose inactivity exceeded the timeout.
    /// Driven by a periodic tick so idle windows close without traffic.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ClosedWindow> {
        let expired: Vec<ChatScope> = self
            .open
            .iter()
            .filter(|e| now - e.value().opened_at >= self.timeout)
            .map(|e| *e.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|scope| {
                self.open
                    .remove(&scope)
                    .map(|(_, w)| close(scope, w, ClosureReason::Timeout, now))
            })
            .collect()
    }

    /// Close everything regardless of thresholds. Shutdown path.
    pub fn flush_all(&self) -> Vec<ClosedWindow> {
        let scopes: Vec<ChatScope> = self.open.iter().map(|e| *e.key()).collect();
        let now = Utc::now();
        scopes
            .into_iter()
            .filter_map(|scope| {
                self.open
                    .remove(&scope)
                    .map(|(_, w)| close(scope, w, ClosureReason::Shutdown, now))
            })
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

fn close(
    scope: ChatScope,
    w: OpenWindow,
    reason: ClosureReason,
    now: DateTime<Utc>,
) -> ClosedWindow {
    debug!(%scope, count = w.message_count, %reason, "window closed");
    ClosedWindow {
        scope,
        priority: Priority::from_label(w.dominant),
        record: NewWindow {
            chat_id: scope.chat_id,
            thread_id: scope.thread_id,
            first_message_id: w.first_row_id,
            last_message_id: w.last_row_id,
            message_count: w.message_count as i64,
            participants: w.participants,
            opened_at: w.opened_at,
            closed_at: now,
            closure_reason: reason,
            dominant_value: w.dominant.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windower(size: usize, timeout_seconds: u64) -> Windower {
        Windower::new(&WindowConfig {
            size,
            timeout_seconds,
            enable_filtering: false,
        })
    }

    fn msg(chat_id: i64, message_id: i64, user_id: i64, at: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            chat_id,
            thread_id: None,
            message_id,
            user_id,
            author_name: "u".to_string(),
            text: "some ordinary chat message here".to_string(),
            media_refs: vec![],
            has_user_media: false,
            reply_to_message_id: None,
            is_from_self: false,
            addressed: false,
            timestamp: at,
        }
    }

    #[test]
    fn closes_on_size_with_reason_size() {
        let w = windower(3, 180);
        let t0 = Utc::now();
        assert!(w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Medium).is_none());
        assert!(w.observe(2, &msg(-100, 2, 42, t0), ValueLabel::Medium).is_none());
        let closed = w
            .observe(3, &msg(-100, 3, 7, t0), ValueLabel::High)
            .expect("third message closes");
        assert_eq!(closed.record.message_count, 3);
        assert_eq!(closed.record.closure_reason, ClosureReason::Size);
        assert_eq!(closed.record.first_message_id, 1);
        assert_eq!(closed.record.last_message_id, 3);
        assert_eq!(closed.record.participants, vec![42, 7]);
        assert_eq!(closed.priority, Priority::P1);
        assert_eq!(w.open_count(), 0);
    }

    #[test]
    fn size_wins_when_timeout_also_holds() {
        let w = windower(2, 60);
        let t0 = Utc::now();
        w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Medium);
        // Second message arrives past the timeout AND fills the window.
        let closed = w
            .observe(2, &msg(-100, 2, 42, t0 + Duration::seconds(120)), ValueLabel::Medium)
            .unwrap();
        assert_eq!(closed.record.closure_reason, ClosureReason::Size);
    }

    #[test]
    fn closes_on_timeout_at_append() {
        let w = windower(8, 60);
        let t0 = Utc::now();
        w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Medium);
        let closed = w
            .observe(2, &msg(-100, 2, 42, t0 + Duration::seconds(61)), ValueLabel::Medium)
            .unwrap();
        assert_eq!(closed.record.closure_reason, ClosureReason::Timeout);
        assert_eq!(closed.record.message_count, 2);
    }

    #[test]
    fn sweep_closes_idle_windows() {
        let w = windower(8, 60);
        let t0 = Utc::now();
        w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Medium);
        assert!(w.sweep(t0 + Duration::seconds(30)).is_empty());
        let closed = w.sweep(t0 + Duration::seconds(61));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].record.closure_reason, ClosureReason::Timeout);
        assert_eq!(w.open_count(), 0);
    }

    #[test]
    fn noise_never_enters_a_window() {
        let w = windower(2, 180);
        let t0 = Utc::now();
        assert!(w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Noise).is_none());
        assert_eq!(w.open_count(), 0);
    }

    #[test]
    fn filtering_also_drops_low() {
        let w = Windower::new(&WindowConfig {
            size: 2,
            timeout_seconds: 180,
            enable_filtering: true,
        });
        let t0 = Utc::now();
        assert!(w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Low).is_none());
        assert_eq!(w.open_count(), 0);
    }

    #[test]
    fn threads_have_independent_windows() {
        let w = windower(2, 180);
        let t0 = Utc::now();
        let mut threaded = msg(-100, 1, 42, t0);
        threaded.thread_id = Some(9);
        w.observe(1, &threaded, ValueLabel::Medium);
        w.observe(2, &msg(-100, 2, 42, t0), ValueLabel::Medium);
        assert_eq!(w.open_count(), 2);
    }

    #[test]
    fn flush_closes_everything_with_shutdown_reason() {
        let w = windower(8, 180);
        let t0 = Utc::now();
        w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Medium);
        w.observe(2, &msg(-200, 2, 7, t0), ValueLabel::High);
        let closed = w.flush_all();
        assert_eq!(closed.len(), 2);
        assert!(closed
            .iter()
            .all(|c| c.record.closure_reason == ClosureReason::Shutdown));
    }

    #[test]
    fn priority_tracks_highest_member_label() {
        let w = windower(3, 180);
        let t0 = Utc::now();
        w.observe(1, &msg(-100, 1, 42, t0), ValueLabel::Low);
        w.observe(2, &msg(-100, 2, 42, t0), ValueLabel::Low);
        let closed = w.observe(3, &msg(-100, 3, 42, t0), ValueLabel::Low).unwrap();
        assert_eq!(closed.priority, Priority::P3);
        assert_eq!(closed.record.dominant_value, "low");
    }
}
