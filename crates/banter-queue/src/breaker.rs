use std::sync::Mutex;
use std::time::{Duration, Instant};

use banter_core::config::BreakerConfig;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { probe_taken: bool },
}

/// Per-dependency circuit breaker.
///
/// CLOSED counts consecutive failures; at the threshold it OPENs for a
/// fixed interval, rejecting callers fast. After the interval one probe is
/// admitted (HALF_OPEN): success closes the breaker, failure re-opens it.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    open_for: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            threshold: cfg.threshold.max(1),
            open_for: Duration::from_secs(cfg.open_seconds),
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed right now. In HALF_OPEN only the first
    /// caller gets through as the probe.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if Instant::now() >= until {
                    info!(breaker = %self.name, "breaker half-open, admitting probe");
                    *state = State::HalfOpen { probe_taken: true };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_taken } => {
                if probe_taken {
                    false
                } else {
                    *state = State::HalfOpen { probe_taken: true };
                    true
                }
            }
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, State::Closed { consecutive_failures: 0 }) {
            info!(breaker = %self.name, "breaker closed");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    /// Report a breaker-eligible failure (transient external error or
    /// timeout).
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    warn!(breaker = %self.name, failures, "breaker opened");
                    *state = State::Open {
                        until: Instant::now() + self.open_for,
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!(breaker = %self.name, "probe failed, breaker re-opened");
                *state = State::Open {
                    until: Instant::now() + self.open_for,
                };
            }
            State::Open { .. } => {}
        }
    }

    /// True while the breaker rejects ordinary calls.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        match *state {
            State::Open { until } => Instant::now() < until,
            State::HalfOpen { probe_taken } => probe_taken,
            State::Closed { .. } => false,
        }
    }
}

/// Named breakers, one per downstream dependency ("model", "store").
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: DashMap<&'static str, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &'static str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, &self.cfg)))
            .clone()
    }
}
