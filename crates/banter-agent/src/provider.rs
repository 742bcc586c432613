use async_trait::async_trait;
use banter_core::error::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single conversation turn handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Tool definition sent to the model API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from the model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Request for a generation pass.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// System prefix: persona plus assembled memory context.
    pub system: String,
    pub turns: Vec<Turn>,
    /// Tools to expose. Empty disables tool calling.
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    /// Raw JSON messages for the tool loop (overrides `turns` when set).
    /// Lets the loop carry structured tool_use / tool_result blocks that
    /// plain strings cannot represent.
    pub raw_messages: Option<Vec<serde_json::Value>>,
}

/// Response from a generation pass.
#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub text: String,
    /// Tool calls requested by the model. Empty when none.
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Call cancelled")]
    Cancelled,
}

impl Classify for ProviderError {
    fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Http(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Timeout { .. } => ErrorKind::TransientExternal,
            ProviderError::Api { status, .. } if *status >= 500 => ErrorKind::TransientExternal,
            ProviderError::Api { .. } | ProviderError::Parse(_) => ErrorKind::PermanentExternal,
            ProviderError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout { ms: 0 }
        } else {
            ProviderError::Http(e.to_string())
        }
    }
}

/// Common interface for all generative-model backends.
///
/// Three operations, matching what the rest of the system needs:
/// free-form generation with tool calling, embeddings, and
/// schema-constrained structured output.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name for logging and error messages.
    fn name(&self) -> &str;

    /// Identifier of the embedding model — part of the embedding cache key.
    fn embedding_model_id(&self) -> &str;

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ProviderError>;

    /// Embed a single text. Dimension is opaque to callers; cosine
    /// similarity is the only operation performed on the result.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// One-shot structured output: the model must answer with JSON
    /// matching `schema`. Used for intent classification, episode
    /// summarization, and model-stage fact extraction.
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}
