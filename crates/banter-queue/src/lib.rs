//! `banter-queue` — the asynchronous learning backbone.
//!
//! A bounded priority queue with eviction-based admission control, a fixed
//! worker pool that drains it under cooperative cancellation, and
//! per-dependency circuit breakers that turn bursts of transient failures
//! into fast rejections.

pub mod breaker;
pub mod queue;
pub mod worker;

use banter_core::error::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Admission control found nothing to evict.
    #[error("Queue full")]
    Full,

    /// The queue was closed for shutdown.
    #[error("Queue closed")]
    Closed,
}

impl Classify for QueueError {
    fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Full => ErrorKind::ResourceExhausted,
            QueueError::Closed => ErrorKind::Cancelled,
        }
    }
}

pub use breaker::{BreakerRegistry, CircuitBreaker};
pub use queue::{Event, EventQueue, QueueStats, QueuedEvent};
pub use worker::{EventHandler, HandlerError, WorkerPool};
