//! `banter-agent` — the generative-model seam.
//!
//! Defines the [`Provider`] trait every model backend implements
//! (generation with tool calling, embeddings, structured JSON output), the
//! production OpenAI-compatible HTTP client, and the tool system: a `Tool`
//! trait, schema-validated dispatch, and the agentic tool loop.

pub mod openai;
pub mod provider;
pub mod tools;

#[doc(hidden)]
pub mod testing;

pub use provider::{
    GenerateRequest, GenerateResponse, Provider, ProviderError, Role, ToolCall, ToolDefinition,
    Turn,
};
