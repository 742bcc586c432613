use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (banter.toml + BANTER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BanterConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub facts: FactsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub episodes: EpisodesConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// SQLite busy timeout — covers the store-call timeout budget.
    #[serde(default = "default_store_timeout")]
    pub timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            timeout_seconds: default_store_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Username the bot answers to in @-mentions (without the leading @).
    #[serde(default)]
    pub bot_username: String,
    /// Extra words that address the bot when they appear in a message.
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    /// When true, direct messages (DMs) are accepted. Defaults to true.
    #[serde(default = "bool_true")]
    pub dm_allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call timeout for generate / generate_structured.
    #[serde(default = "default_call_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Message count that closes a window.
    #[serde(default = "default_window_size")]
    pub size: usize,
    /// Inactivity threshold that closes a window.
    #[serde(default = "default_window_timeout")]
    pub timeout_seconds: u64,
    /// When true, LOW-value messages are dropped from windows as well as NOISE.
    #[serde(default)]
    pub enable_filtering: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: default_window_size(),
            timeout_seconds: default_window_timeout(),
            enable_filtering: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Events older than this at dequeue are dropped.
    #[serde(default = "default_stale_seconds")]
    pub stale_seconds: u64,
    /// When false, window processing runs inline in the orchestrator.
    #[serde(default)]
    pub enable_async: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            capacity: default_queue_capacity(),
            stale_seconds: default_stale_seconds(),
            enable_async: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    /// How long an open breaker stays open before a half-open probe.
    #[serde(default = "default_breaker_open")]
    pub open_seconds: u64,
    /// External-call timeout; a timeout counts as a breaker failure.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            open_seconds: default_breaker_open(),
            call_timeout_seconds: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Bounded in-memory LRU tier size.
    #[serde(default = "default_embed_entries")]
    pub memory_entries: usize,
    /// Concurrent provider calls allowed on cache miss.
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    /// Minimum delay between provider calls.
    #[serde(default = "default_embed_interval")]
    pub min_interval_ms: u64,
    #[serde(default = "default_embed_timeout")]
    pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            memory_entries: default_embed_entries(),
            concurrency: default_embed_concurrency(),
            min_interval_ms: default_embed_interval(),
            timeout_seconds: default_embed_timeout(),
        }
    }
}

/// Fact quality pipeline knobs (§ dedup / conflict / decay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsConfig {
    /// Cosine similarity at or above which two values are duplicates.
    #[serde(default = "default_dedup_similarity")]
    pub dedup_similarity: f64,
    /// Lower bound of the conflict band; upper bound is `dedup_similarity`.
    #[serde(default = "default_conflict_low")]
    pub conflict_similarity_low: f64,
    #[serde(default = "default_half_life")]
    pub half_life_days: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Conflict scoring weights. Kept as config: production values may
    /// differ from the documented ratios.
    #[serde(default = "default_w_confidence")]
    pub score_w_confidence: f64,
    #[serde(default = "default_w_recency")]
    pub score_w_recency: f64,
    #[serde(default = "default_w_detail")]
    pub score_w_detail: f64,
    #[serde(default = "default_w_source")]
    pub score_w_source: f64,
}

impl Default for FactsConfig {
    fn default() -> Self {
        Self {
            dedup_similarity: default_dedup_similarity(),
            conflict_similarity_low: default_conflict_low(),
            half_life_days: default_half_life(),
            min_confidence: default_min_confidence(),
            score_w_confidence: default_w_confidence(),
            score_w_recency: default_w_recency(),
            score_w_detail: default_w_detail(),
            score_w_source: default_w_source(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_share_episodic")]
    pub share_episodic: f64,
    #[serde(default = "default_share_retrieved")]
    pub share_retrieved: f64,
    #[serde(default = "default_share_recent")]
    pub share_recent: f64,
    /// Blend between relevance and recency in retrieved-tier ranking.
    #[serde(default = "default_recency_alpha")]
    pub recency_alpha: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            share_episodic: default_share_episodic(),
            share_retrieved: default_share_retrieved(),
            share_recent: default_share_recent(),
            recency_alpha: default_recency_alpha(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodesConfig {
    /// Inactivity that finalizes an episode buffer.
    #[serde(default = "default_episode_timeout")]
    pub timeout_seconds: u64,
    /// Buffer size that forces finalization.
    #[serde(default = "default_episode_max")]
    pub max_messages: usize,
    /// Sweep cadence.
    #[serde(default = "default_episode_sweep")]
    pub sweep_seconds: u64,
}

impl Default for EpisodesConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_episode_timeout(),
            max_messages: default_episode_max(),
            sweep_seconds: default_episode_sweep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proactive_confidence")]
    pub min_confidence: f64,
    /// Minimum messages in a window before a proactive reply is considered.
    #[serde(default = "default_proactive_min_messages")]
    pub min_messages: usize,
    /// A window whose last message is older than this is stale.
    #[serde(default = "default_proactive_max_age")]
    pub max_window_age_seconds: u64,
    #[serde(default = "default_global_cooldown")]
    pub global_cooldown_seconds: u64,
    #[serde(default = "default_user_cooldown")]
    pub user_cooldown_seconds: u64,
    #[serde(default = "default_intent_cooldown")]
    pub intent_cooldown_seconds: u64,
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: u32,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// A SENT event with no reply within this window is recorded as ignored.
    #[serde(default = "default_reaction_timeout")]
    pub reaction_timeout_seconds: u64,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: default_proactive_confidence(),
            min_messages: default_proactive_min_messages(),
            max_window_age_seconds: default_proactive_max_age(),
            global_cooldown_seconds: default_global_cooldown(),
            user_cooldown_seconds: default_user_cooldown(),
            intent_cooldown_seconds: default_intent_cooldown(),
            hourly_limit: default_hourly_limit(),
            daily_limit: default_daily_limit(),
            reaction_timeout_seconds: default_reaction_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Messages older than this may be pruned unless their retention flag is set.
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.banter/banter.db")
}
fn default_store_timeout() -> u64 {
    10
}
fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_call_timeout() -> u64 {
    30
}
fn default_window_size() -> usize {
    8
}
fn default_window_timeout() -> u64 {
    180
}
fn default_workers() -> usize {
    3
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_stale_seconds() -> u64 {
    60
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_open() -> u64 {
    60
}
fn default_embed_entries() -> usize {
    10_000
}
fn default_embed_concurrency() -> usize {
    5
}
fn default_embed_interval() -> u64 {
    1000
}
fn default_embed_timeout() -> u64 {
    15
}
fn default_dedup_similarity() -> f64 {
    0.85
}
fn default_conflict_low() -> f64 {
    0.70
}
fn default_half_life() -> f64 {
    90.0
}
fn default_min_confidence() -> f64 {
    0.1
}
fn default_w_confidence() -> f64 {
    0.40
}
fn default_w_recency() -> f64 {
    0.30
}
fn default_w_detail() -> f64 {
    0.20
}
fn default_w_source() -> f64 {
    0.10
}
fn default_token_budget() -> usize {
    8000
}
fn default_share_episodic() -> f64 {
    0.33
}
fn default_share_retrieved() -> f64 {
    0.33
}
fn default_share_recent() -> f64 {
    0.34
}
fn default_recency_alpha() -> f64 {
    0.6
}
fn default_episode_timeout() -> u64 {
    120
}
fn default_episode_max() -> usize {
    500
}
fn default_episode_sweep() -> u64 {
    60
}
fn default_proactive_confidence() -> f64 {
    0.75
}
fn default_proactive_min_messages() -> usize {
    3
}
fn default_proactive_max_age() -> u64 {
    300
}
fn default_global_cooldown() -> u64 {
    300
}
fn default_user_cooldown() -> u64 {
    600
}
fn default_intent_cooldown() -> u64 {
    1800
}
fn default_hourly_limit() -> u32 {
    6
}
fn default_daily_limit() -> u32 {
    40
}
fn default_reaction_timeout() -> u64 {
    600
}
fn default_retention_days() -> u32 {
    30
}

impl BanterConfig {
    /// Load config from a TOML file with BANTER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.banter/banter.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: BanterConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BANTER_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.banter/banter.toml")
}
