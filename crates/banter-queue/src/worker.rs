use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use banter_core::error::ErrorKind;
use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{EventQueue, QueuedEvent};

/// An event-handling failure with enough classification for the pool to
/// apply policy.
#[derive(Debug)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// What the workers run for each dequeued event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        event: QueuedEvent,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Fixed pool of workers draining the event queue.
///
/// Failure policy: a single event failure never crashes the pool; a
/// `DataCorrupt` failure aborts the affected worker after a full dump and
/// the supervisor respawns it; stale events are dropped at dequeue.
pub struct WorkerPool {
    queue: Arc<EventQueue>,
    handler: Arc<dyn EventHandler>,
    stale_after: Duration,
    cancel: CancellationToken,
    supervisors: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<EventQueue>,
        handler: Arc<dyn EventHandler>,
        stale_seconds: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            handler,
            stale_after: Duration::seconds(stale_seconds as i64),
            cancel,
            supervisors: Vec::new(),
        }
    }

    /// Spawn `workers` supervised worker tasks.
    pub fn start(&mut self, workers: usize) {
        for worker_id in 0..workers.max(1) {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let stale_after = self.stale_after;
            let cancel = self.cancel.clone();
            self.supervisors.push(tokio::spawn(async move {
                // Supervisor loop: respawn the worker body after a corrupt
                // exit, stop on cancellation or queue drain.
                loop {
                    let exit = run_worker(
                        worker_id,
                        Arc::clone(&queue),
                        Arc::clone(&handler),
                        stale_after,
                        cancel.clone(),
                    )
                    .await;
                    match exit {
                        WorkerExit::Drained | WorkerExit::Cancelled => break,
                        WorkerExit::Corrupt => {
                            error!(worker_id, "worker hit corrupt data, respawning");
                        }
                    }
                }
                info!(worker_id, "worker stopped");
            }));
        }
    }

    /// Wait for all workers to finish. Call after closing the queue or
    /// cancelling the token.
    pub async fn join(self) {
        for handle in self.supervisors {
            let _ = handle.await;
        }
    }
}

enum WorkerExit {
    Drained,
    Cancelled,
    Corrupt,
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<EventQueue>,
    handler: Arc<dyn EventHandler>,
    stale_after: Duration,
    cancel: CancellationToken,
) -> WorkerExit {
    loop {
        let event = tokio::select! {
            ev = queue.pop() => match ev {
                Some(ev) => ev,
                None => return WorkerExit::Drained,
            },
            _ = cancel.cancelled() => return WorkerExit::Cancelled,
        };

        // Staleness: an event that sat in the queue too long is useless.
        let age = Utc::now() - event.enqueued_at;
        if age > stale_after {
            queue.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
            warn!(worker_id, event = %event.id, age_secs = age.num_seconds(), "dropping stale event");
            continue;
        }

        debug!(worker_id, event = %event.id, "handling event");
        let event_dump = format!("{event:?}");
        match handler.handle(event, &cancel).await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::DataCorrupt => {
                error!(worker_id, error = %e, dump = %event_dump, "corrupt data, worker exiting");
                return WorkerExit::Corrupt;
            }
            Err(e) if e.kind == ErrorKind::Cancelled => {
                debug!(worker_id, error = %e, "event cancelled");
            }
            Err(e) => {
                warn!(worker_id, error = %e, "event failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Event;
    use banter_core::types::Priority;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct Recorder {
        handled: Mutex<Vec<i64>>,
        failures: AtomicUsize,
        corrupt_on: Option<i64>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(
            &self,
            event: QueuedEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            let Event::WindowClosed { window_id, .. } = event.event else {
                return Ok(());
            };
            if self.corrupt_on == Some(window_id) {
                return Err(HandlerError::new(ErrorKind::DataCorrupt, "bad row"));
            }
            if window_id < 0 {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(HandlerError::new(ErrorKind::TransientExternal, "flaky"));
            }
            self.handled.lock().unwrap().push(window_id);
            Ok(())
        }
    }

    fn window(window_id: i64) -> Event {
        Event::WindowClosed {
            window_id,
            chat_id: -100,
            thread_id: None,
        }
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops() {
        let queue = Arc::new(EventQueue::new(100));
        let recorder = Arc::new(Recorder {
            handled: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            corrupt_on: None,
        });
        for i in 1..=5 {
            queue.push(window(i), Priority::P2).unwrap();
        }
        queue.close();

        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&recorder) as Arc<dyn EventHandler>,
            60,
            CancellationToken::new(),
        );
        pool.start(3);
        pool.join().await;

        let mut handled = recorder.handled.lock().unwrap().clone();
        handled.sort();
        assert_eq!(handled, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn one_failing_event_does_not_stop_the_rest() {
        let queue = Arc::new(EventQueue::new(100));
        let recorder = Arc::new(Recorder {
            handled: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            corrupt_on: None,
        });
        queue.push(window(-1), Priority::P2).unwrap(); // fails
        queue.push(window(7), Priority::P2).unwrap();
        queue.close();

        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&recorder) as Arc<dyn EventHandler>,
            60,
            CancellationToken::new(),
        );
        pool.start(1);
        pool.join().await;

        assert_eq!(recorder.failures.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.handled.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn corrupt_event_respawns_worker_and_processing_continues() {
        let queue = Arc::new(EventQueue::new(100));
        let recorder = Arc::new(Recorder {
            handled: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            corrupt_on: Some(13),
        });
        queue.push(window(13), Priority::P2).unwrap(); // corrupt
        queue.push(window(8), Priority::P2).unwrap();
        queue.close();

        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&recorder) as Arc<dyn EventHandler>,
            60,
            CancellationToken::new(),
        );
        pool.start(1);
        pool.join().await;

        assert_eq!(*recorder.handled.lock().unwrap(), vec![8]);
    }

    #[tokio::test]
    async fn stale_events_are_dropped_not_handled() {
        let queue = Arc::new(EventQueue::new(100));
        let recorder = Arc::new(Recorder {
            handled: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            corrupt_on: None,
        });
        queue.push(window(1), Priority::P2).unwrap();
        queue.close();

        // Zero staleness budget: everything is already too old.
        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&recorder) as Arc<dyn EventHandler>,
            0,
            CancellationToken::new(),
        );
        pool.start(1);
        pool.join().await;

        assert!(recorder.handled.lock().unwrap().is_empty());
        assert_eq!(queue.stats.dropped_stale.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_workers_promptly() {
        let queue = Arc::new(EventQueue::new(100));
        let recorder = Arc::new(Recorder {
            handled: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            corrupt_on: None,
        });
        let cancel = CancellationToken::new();
        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&recorder) as Arc<dyn EventHandler>,
            60,
            cancel.clone(),
        );
        pool.start(2);
        cancel.cancel();
        pool.join().await;
    }
}
