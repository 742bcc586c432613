//! Fact quality pipeline: normalize → dedup → conflict → decay → persist.
//!
//! Takes a window's candidate facts plus the user's existing active facts
//! and turns them into one atomic mutation batch. Duplicates merge into the
//! oldest row with a confidence boost; near-duplicates of the same key are
//! conflicts resolved by scoring; everything touched decays toward the
//! confidence floor; the store write is a single transaction.
//!
//! When the embedding provider is down, dedup degrades to string equality
//! on the canonical value and conflict detection is skipped — the pipeline
//! never stalls on embeddings.

use std::collections::BTreeMap;
use std::sync::Arc;

use banter_core::config::FactsConfig;
use banter_core::cosine_similarity;
use banter_embed::{EmbedError, EmbeddingCache};
use banter_store::metrics::QualityMetrics;
use banter_store::types::{BatchRef, Fact, FactMutation};
use banter_store::FactStore;
use chrono::Utc;
use tracing::{debug, warn};

use crate::extract::CandidateFact;
use crate::normalize::canonicalize;
use crate::Result;

/// Decay-only confidence changes below this are not materialized — they
/// would append a version per window for every stored fact.
const DECAY_EPSILON: f64 = 0.01;

/// What the pipeline did with one window's candidates.
#[derive(Debug, Clone)]
pub struct QualityOutcome {
    pub metrics: QualityMetrics,
    /// Row ids of facts created by this batch.
    pub created: Vec<i64>,
}

pub struct QualityManager {
    store: Arc<FactStore>,
    embeddings: Arc<EmbeddingCache>,
    cfg: FactsConfig,
}

/// One existing active fact and what the batch plans to do with it.
struct ExistingState {
    fact: Fact,
    /// Confidence after decay, before any boost.
    base: f64,
    /// Running confidence after each planned boost.
    boosts: Vec<f64>,
    superseded: bool,
    embedding: Option<Vec<f32>>,
}

impl ExistingState {
    fn current(&self) -> f64 {
        self.boosts.last().copied().unwrap_or(self.base)
    }
}

/// A fact the batch plans to introduce (fresh row or reactivation).
struct PlannedFact {
    user_id: i64,
    chat_id: i64,
    fact_type: String,
    key: String,
    value_canonical: String,
    confidence: f64,
    source: banter_store::types::FactSource,
    evidence_message_id: Option<i64>,
    embedding: Option<Vec<f32>>,
    /// Running confidence after each planned boost.
    boosts: Vec<f64>,
    /// Existing row ids this fact supersedes.
    supersedes: Vec<i64>,
    /// Reactivate this inactive row instead of inserting.
    correct_target: Option<i64>,
    /// Lost a conflict against a later candidate — never materialized.
    cancelled: bool,
}

impl PlannedFact {
    fn current(&self) -> f64 {
        self.boosts.last().copied().unwrap_or(self.confidence)
    }
}

impl QualityManager {
    pub fn new(store: Arc<FactStore>, embeddings: Arc<EmbeddingCache>, cfg: FactsConfig) -> Self {
        Self {
            store,
            embeddings,
            cfg,
        }
    }

    /// Run the full pipeline for one window's candidates and commit the
    /// resulting batch atomically.
    pub async fn process(
        &self,
        chat_id: i64,
        candidates: Vec<CandidateFact>,
    ) -> Result<QualityOutcome> {
        let mut metrics = QualityMetrics::default();
        if candidates.is_empty() {
            return Ok(QualityOutcome {
                metrics,
                created: Vec::new(),
            });
        }

        // Deterministic per-user grouping: dedup is commutative, and a
        // stable order keeps retries byte-identical.
        let mut by_user: BTreeMap<i64, Vec<CandidateFact>> = BTreeMap::new();
        for c in candidates {
            by_user.entry(c.user_id).or_default().push(c);
        }

        let mut planned: Vec<PlannedFact> = Vec::new();
        let mut existing_all: Vec<ExistingState> = Vec::new();

        for (user_id, user_candidates) in by_user {
            let user_planned_start = planned.len();
            let existing_start = existing_all.len();
            for fact in self.store.active_facts(user_id, chat_id)? {
                let base = decayed_confidence(&fact, &self.cfg);
                let embedding = fact.embedding.clone();
                existing_all.push(ExistingState {
                    fact,
                    base,
                    boosts: Vec::new(),
                    superseded: false,
                    embedding,
                });
            }

            for candidate in user_candidates {
                metrics.candidates_seen += 1;
                self.place_candidate(
                    chat_id,
                    candidate,
                    &mut existing_all[existing_start..],
                    &mut planned,
                    user_planned_start,
                    &mut metrics,
                )
                .await?;
            }
        }

        let mutations = materialize(&planned, &existing_all, &mut metrics);

        // `created` contains only true inserts; reactivations are not in it.
        let created = self.store.apply_fact_batch(&mutations)?;
        debug!(
            chat_id,
            candidates = metrics.candidates_seen,
            created = created.len(),
            reinforced = metrics.facts_reinforced,
            conflicts = metrics.conflicts_resolved,
            "quality pipeline committed"
        );
        Ok(QualityOutcome { metrics, created })
    }

    /// Decide what one candidate does: reinforce, conflict, reactivate, or
    /// plan a fresh fact.
    async fn place_candidate(
        &self,
        chat_id: i64,
        candidate: CandidateFact,
        existing: &mut [ExistingState],
        planned: &mut Vec<PlannedFact>,
        user_planned_start: usize,
        metrics: &mut QualityMetrics,
    ) -> Result<()> {
        let vc = canonicalize(&candidate.value);
        let embedding = self.embed_or_degrade(&vc).await?;

        // Make sure comparable existing facts have embeddings too.
        if embedding.is_some() {
            for e in existing.iter_mut() {
                if e.embedding.is_none() && !e.superseded && same_key(&e.fact, &candidate) {
                    e.embedding = self.embed_or_degrade(&e.fact.value_canonical).await?;
                }
            }
        }

        // Dedup against existing rows — the older row wins the merge.
        for e in existing.iter_mut() {
            if e.superseded || !same_key(&e.fact, &candidate) {
                continue;
            }
            if is_duplicate(
                &e.fact.value_canonical,
                e.embedding.as_deref(),
                &vc,
                embedding.as_deref(),
                self.cfg.dedup_similarity,
            ) {
                let boosted = boost(e.current());
                e.boosts.push(boosted);
                metrics.facts_reinforced += 1;
                return Ok(());
            }
        }

        // Dedup against facts this batch already plans to introduce.
        for p in planned[user_planned_start..].iter_mut() {
            if p.cancelled || p.key != candidate.key || p.fact_type != candidate.fact_type {
                continue;
            }
            if is_duplicate(
                &p.value_canonical,
                p.embedding.as_deref(),
                &vc,
                embedding.as_deref(),
                self.cfg.dedup_similarity,
            ) {
                let boosted = boost(p.current());
                p.boosts.push(boosted);
                metrics.facts_reinforced += 1;
                return Ok(());
            }
        }

        // Conflict band — only meaningful with embeddings on both sides.
        if let Some(ref cand_emb) = embedding {
            let cand_score = self.score(
                candidate.confidence,
                0.0,
                &vc,
                candidate.source.reliability(),
            );
            for e in existing.iter_mut() {
                if e.superseded || !same_key(&e.fact, &candidate) {
                    continue;
                }
                let Some(ref e_emb) = e.embedding else {
                    continue;
                };
                let sim = cosine_similarity(e_emb, cand_emb);
                if sim < self.cfg.conflict_similarity_low || sim >= self.cfg.dedup_similarity {
                    continue;
                }
                let age_days = age_in_days(e.fact.last_reinforced_at);
                let e_score =
                    self.score(e.current(), age_days, &e.fact.value_canonical, e.fact.source.reliability());
                metrics.conflicts_resolved += 1;
                if cand_score > e_score {
                    e.superseded = true;
                    planned.push(self.plan(chat_id, &candidate, vc, embedding, vec![e.fact.id])?);
                } else {
                    debug!(key = %candidate.key, "candidate lost conflict, dropped");
                }
                return Ok(());
            }

            // Conflicts between two candidates of the same batch.
            for idx in user_planned_start..planned.len() {
                let p = &planned[idx];
                if p.cancelled || p.key != candidate.key || p.fact_type != candidate.fact_type {
                    continue;
                }
                let Some(ref p_emb) = p.embedding else {
                    continue;
                };
                let sim = cosine_similarity(p_emb, cand_emb);
                if sim < self.cfg.conflict_similarity_low || sim >= self.cfg.dedup_similarity {
                    continue;
                }
                let p_score = self.score(p.current(), 0.0, &p.value_canonical, p.source.reliability());
                metrics.conflicts_resolved += 1;
                if cand_score > p_score {
                    let supersedes = std::mem::take(&mut planned[idx].supersedes);
                    planned[idx].cancelled = true;
                    planned.push(self.plan(chat_id, &candidate, vc, embedding, supersedes)?);
                } else {
                    debug!(key = %candidate.key, "candidate lost in-batch conflict, dropped");
                }
                return Ok(());
            }
        }

        // Nothing matched: fresh fact, or reactivation of a forgotten row.
        planned.push(self.plan(chat_id, &candidate, vc, embedding, Vec::new())?);
        Ok(())
    }

    fn plan(
        &self,
        chat_id: i64,
        candidate: &CandidateFact,
        value_canonical: String,
        embedding: Option<Vec<f32>>,
        supersedes: Vec<i64>,
    ) -> Result<PlannedFact> {
        let correct_target = self
            .store
            .find_inactive_fact(
                candidate.user_id,
                chat_id,
                &candidate.fact_type,
                &candidate.key,
                &value_canonical,
            )?
            .map(|f| f.id);
        Ok(PlannedFact {
            user_id: candidate.user_id,
            chat_id,
            fact_type: candidate.fact_type.clone(),
            key: candidate.key.clone(),
            value_canonical,
            confidence: candidate.confidence,
            source: candidate.source,
            evidence_message_id: candidate.evidence_message_id,
            embedding,
            boosts: Vec::new(),
            supersedes,
            correct_target,
            cancelled: false,
        })
    }

    async fn embed_or_degrade(&self, text: &str) -> Result<Option<Vec<f32>>> {
        match self.embeddings.embed(text).await {
            Ok(outcome) => Ok(Some(outcome.vector)),
            Err(EmbedError::Unavailable(e)) => {
                warn!(error = %e, "embeddings unavailable, degrading to string equality");
                Ok(None)
            }
            Err(EmbedError::Store(e)) => Err(e.into()),
        }
    }

    /// Conflict score: confidence, recency, value detail, source reliability.
    fn score(&self, confidence: f64, age_days: f64, value: &str, reliability: f64) -> f64 {
        let recency = (-age_days / 30.0).exp();
        let detail = detail_sigmoid(value);
        self.cfg.score_w_confidence * confidence
            + self.cfg.score_w_recency * recency
            + self.cfg.score_w_detail * detail
            + self.cfg.score_w_source * reliability
    }
}

/// Length-based detail score in (0, 1).
fn detail_sigmoid(value: &str) -> f64 {
    let len = value.chars().count() as f64;
    1.0 / (1.0 + (-(len - 10.0) / 10.0).exp())
}

fn boost(current: f64) -> f64 {
    (current + (1.0 - current).min(0.1)).min(1.0)
}

fn same_key(fact: &Fact, candidate: &CandidateFact) -> bool {
    fact.fact_type == candidate.fact_type && fact.key == candidate.key
}

fn is_duplicate(
    a_value: &str,
    a_emb: Option<&[f32]>,
    b_value: &str,
    b_emb: Option<&[f32]>,
    threshold: f64,
) -> bool {
    if a_value == b_value {
        return true;
    }
    match (a_emb, b_emb) {
        (Some(a), Some(b)) => cosine_similarity(a, b) >= threshold,
        _ => false,
    }
}

fn age_in_days(ts: chrono::DateTime<Utc>) -> f64 {
    (Utc::now() - ts).num_seconds().max(0) as f64 / 86_400.0
}

/// Exponential half-life decay since the later of the last reinforcement
/// and the last applied decay, floored at the configured minimum.
fn decayed_confidence(fact: &Fact, cfg: &FactsConfig) -> f64 {
    let anchor = fact.last_reinforced_at.max(fact.last_decayed_at);
    let days = age_in_days(anchor);
    let decayed = fact.confidence * (-(std::f64::consts::LN_2) * days / cfg.half_life_days).exp();
    decayed.max(cfg.min_confidence)
}

/// Turn the plan into an ordered mutation batch. Creations come first so
/// `BatchRef::Created` indices line up, then reactivations, boosts,
/// supersessions, and decays.
fn materialize(
    planned: &[PlannedFact],
    existing: &[ExistingState],
    metrics: &mut QualityMetrics,
) -> Vec<FactMutation> {
    let mut mutations: Vec<FactMutation> = Vec::new();
    let mut created_index = 0usize;
    // Target ref for each planned fact, filled as creations are emitted.
    let mut targets: Vec<Option<BatchRef>> = vec![None; planned.len()];

    for (i, p) in planned.iter().enumerate() {
        if p.cancelled {
            continue;
        }
        match p.correct_target {
            Some(fact_id) => {
                mutations.push(FactMutation::Correct {
                    target: BatchRef::Existing(fact_id),
                    new_confidence: p.confidence,
                    reason: Some("restated after being forgotten".to_string()),
                });
                targets[i] = Some(BatchRef::Existing(fact_id));
                metrics.facts_created += 1;
            }
            None => {
                mutations.push(FactMutation::Create {
                    user_id: p.user_id,
                    chat_id: p.chat_id,
                    fact_type: p.fact_type.clone(),
                    key: p.key.clone(),
                    value_canonical: p.value_canonical.clone(),
                    confidence: p.confidence,
                    source: p.source,
                    evidence_message_id: p.evidence_message_id,
                    embedding: p.embedding.clone(),
                });
                targets[i] = Some(BatchRef::Created(created_index));
                created_index += 1;
                metrics.facts_created += 1;
            }
        }
    }

    for (i, p) in planned.iter().enumerate() {
        if p.cancelled {
            continue;
        }
        let target = targets[i].expect("materialized planned fact has a target");
        for conf in &p.boosts {
            mutations.push(FactMutation::Reinforce {
                target,
                new_confidence: *conf,
                reason: Some("duplicate value merged".to_string()),
            });
        }
        for loser in &p.supersedes {
            mutations.push(FactMutation::Supersede {
                target: BatchRef::Existing(*loser),
                winner: target,
                reason: None,
            });
        }
    }

    for e in existing {
        if e.superseded {
            continue;
        }
        if e.boosts.is_empty() {
            if e.fact.confidence - e.base >= DECAY_EPSILON {
                mutations.push(FactMutation::Decay {
                    target: BatchRef::Existing(e.fact.id),
                    new_confidence: e.base,
                });
                metrics.facts_decayed += 1;
            }
        } else {
            for conf in &e.boosts {
                mutations.push(FactMutation::Reinforce {
                    target: BatchRef::Existing(e.fact.id),
                    new_confidence: *conf,
                    reason: Some("duplicate value merged".to_string()),
                });
            }
        }
    }

    mutations
}
