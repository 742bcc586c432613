//! `banter-proactive` — unsolicited-reply decisions.
//!
//! The [`IntentClassifier`](intent::IntentClassifier) asks the model what a
//! closed window wants (question, request, problem, opportunity, nothing)
//! and caches the answer per window so retries are idempotent. The
//! [`ProactiveTrigger`](trigger::ProactiveTrigger) runs the ordered gate
//! list — size, freshness, cooldowns, rate limits, learned per-user
//! preference — and the first failed gate suppresses with its reason.

pub mod intent;
pub mod trigger;

pub use intent::{Intent, IntentClassification, IntentClassifier};
pub use trigger::{ProactiveTrigger, TriggerOutcome};
