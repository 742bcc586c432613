use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use banter_core::types::Priority;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::QueueError;

/// Work items the pool processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A window closed and awaits extraction → quality → proactive.
    WindowClosed {
        window_id: i64,
        chat_id: i64,
        thread_id: Option<i64>,
    },
    /// Periodic episode sweep.
    EpisodeTick,
}

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub event: Event,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// Counters exposed for logging and tests.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub evicted: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped_stale: AtomicU64,
    /// Pushes admitted while past the high-water mark.
    pub pressure: AtomicU64,
}

/// Bounded priority queue: FIFO within a priority, higher priority first.
///
/// Admission control: items are admitted up to capacity; crossing the
/// high-water mark (80%) only raises the pressure counter. At the bound a
/// new item enters by evicting the oldest strictly-lower-priority item —
/// when none exists the push is rejected with [`QueueError::Full`]. The
/// producer never blocks.
pub struct EventQueue {
    lanes: Mutex<Lanes>,
    capacity: usize,
    high_water: usize,
    notify: Notify,
    pub stats: QueueStats,
}

#[derive(Default)]
struct Lanes {
    p1: VecDeque<QueuedEvent>,
    p2: VecDeque<QueuedEvent>,
    p3: VecDeque<QueuedEvent>,
    closed: bool,
}

impl Lanes {
    fn len(&self) -> usize {
        self.p1.len() + self.p2.len() + self.p3.len()
    }

    fn lane_mut(&mut self, p: Priority) -> &mut VecDeque<QueuedEvent> {
        match p {
            Priority::P1 => &mut self.p1,
            Priority::P2 => &mut self.p2,
            Priority::P3 => &mut self.p3,
        }
    }

    /// Evict the oldest item with priority strictly lower than `p`.
    fn evict_below(&mut self, p: Priority) -> Option<QueuedEvent> {
        // Lower priority = later lane; search from the lowest lane up.
        if p < Priority::P3 {
            if let Some(ev) = self.p3.pop_front() {
                return Some(ev);
            }
        }
        if p < Priority::P2 {
            if let Some(ev) = self.p2.pop_front() {
                return Some(ev);
            }
        }
        None
    }
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity,
            high_water: (capacity * 4) / 5,
            notify: Notify::new(),
            stats: QueueStats::default(),
        }
    }

    /// Enqueue an event. Never blocks; fails fast under pressure.
    pub fn push(&self, event: Event, priority: Priority) -> Result<Uuid, QueueError> {
        let item = QueuedEvent {
            id: Uuid::new_v4(),
            event,
            priority,
            enqueued_at: Utc::now(),
        };
        let id = item.id;
        {
            let mut lanes = self.lanes.lock().unwrap();
            if lanes.closed {
                return Err(QueueError::Closed);
            }
            let len = lanes.len();
            if len >= self.capacity {
                match lanes.evict_below(priority) {
                    Some(evicted) => {
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                        warn!(evicted = %evicted.id, priority = %priority, "admission control evicted an older low-priority event");
                    }
                    None => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(QueueError::Full);
                    }
                }
            } else if len >= self.high_water {
                self.stats.pressure.fetch_add(1, Ordering::Relaxed);
                warn!(len, capacity = self.capacity, "queue past high-water mark");
            }
            lanes.lane_mut(priority).push_back(item);
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Dequeue the next event, waiting until one is available or the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<QueuedEvent> {
        loop {
            {
                let mut lanes = self.lanes.lock().unwrap();
                if let Some(ev) = lanes
                    .p1
                    .pop_front()
                    .or_else(|| lanes.p2.pop_front())
                    .or_else(|| lanes.p3.pop_front())
                {
                    debug!(event = %ev.id, priority = %ev.priority, "dequeued");
                    return Some(ev);
                }
                if lanes.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting new events and wake all waiting consumers.
    pub fn close(&self) {
        self.lanes.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_event(window_id: i64) -> Event {
        Event::WindowClosed {
            window_id,
            chat_id: -100,
            thread_id: None,
        }
    }

    #[tokio::test]
    async fn fifo_within_priority_higher_first() {
        let q = EventQueue::new(100);
        q.push(window_event(1), Priority::P2).unwrap();
        q.push(window_event(2), Priority::P2).unwrap();
        q.push(window_event(3), Priority::P1).unwrap();

        let order: Vec<i64> = [q.pop().await, q.pop().await, q.pop().await]
            .into_iter()
            .map(|ev| match ev.unwrap().event {
                Event::WindowClosed { window_id, .. } => window_id,
                _ => panic!("unexpected event"),
            })
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn admission_at_capacity_evicts_oldest_lower_priority() {
        let q = EventQueue::new(10);
        for i in 0..4 {
            q.push(window_event(i), Priority::P3).unwrap();
        }
        for i in 4..10 {
            q.push(window_event(i), Priority::P2).unwrap();
        }
        assert_eq!(q.len(), 10);

        // Full: a P1 push evicts the oldest P3 (window 0).
        q.push(window_event(100), Priority::P1).unwrap();
        assert_eq!(q.len(), 10);
        assert_eq!(q.stats.evicted.load(Ordering::Relaxed), 1);

        // The evicted window 0 is gone: P1 first, then P2 in order.
        let first = q.pop().await.unwrap();
        assert!(matches!(first.event, Event::WindowClosed { window_id: 100, .. }));
    }

    #[test]
    fn admission_rejects_when_nothing_is_lower() {
        let q = EventQueue::new(10);
        for i in 0..10 {
            q.push(window_event(i), Priority::P1).unwrap();
        }
        let err = q.push(window_event(100), Priority::P1).unwrap_err();
        assert!(matches!(err, QueueError::Full));
        assert_eq!(q.stats.rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn crossing_high_water_raises_pressure_but_admits() {
        let q = EventQueue::new(10); // high water at 8
        for i in 0..9 {
            q.push(window_event(i), Priority::P3).unwrap();
        }
        assert_eq!(q.len(), 9);
        assert!(q.stats.pressure.load(Ordering::Relaxed) >= 1);
        assert_eq!(q.stats.rejected.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn full_queue_scenario_keeps_capacity_constant() {
        // 200 P3 + 800 P2 at capacity; a new P1 evicts the oldest P3.
        let q = EventQueue::new(1000);
        for i in 0..200 {
            q.push(window_event(i), Priority::P3).unwrap();
        }
        for i in 200..1000 {
            q.push(window_event(i), Priority::P2).unwrap();
        }
        assert_eq!(q.len(), 1000);
        q.push(window_event(9999), Priority::P1).unwrap();
        assert_eq!(q.len(), 1000);
        assert_eq!(q.stats.evicted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects_pushes_and_drains_pops() {
        let q = EventQueue::new(10);
        q.push(window_event(1), Priority::P2).unwrap();
        q.close();
        assert!(matches!(
            q.push(window_event(2), Priority::P2),
            Err(QueueError::Closed)
        ));
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }
}
