//! OpenAI-compatible HTTP backend: chat completions, embeddings, and
//! JSON-mode structured output against a configurable base URL.

use async_trait::async_trait;
use banter_core::config::ProviderConfig;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::{
    GenerateRequest, GenerateResponse, Provider, ProviderError, ToolCall,
};

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    max_tokens: u32,
    timeout_ms: u64,
}

impl OpenAiProvider {
    pub fn new(cfg: &ProviderConfig) -> Self {
        let timeout = std::time::Duration::from_secs(cfg.timeout_seconds);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            chat_model: cfg.chat_model.clone(),
            embedding_model: cfg.embedding_model.clone(),
            max_tokens: cfg.max_tokens,
            timeout_ms: cfg.timeout_seconds * 1000,
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        ms: self.timeout_ms,
                    }
                } else {
                    ProviderError::Http(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        resp.json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn embedding_model_id(&self) -> &str {
        &self.embedding_model
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let body = build_chat_body(&self.chat_model, self.max_tokens, req);
        debug!(model = %self.chat_model, turns = req.turns.len(), "chat request");
        let raw = self.post_json("/v1/chat/completions", &body).await?;
        let api: ApiResponse =
            serde_json::from_value(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_chat_response(api))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": text,
        });
        let raw = self.post_json("/v1/embeddings", &body).await?;
        let api: EmbeddingResponse =
            serde_json::from_value(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;
        api.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Parse("empty embedding response".to_string()))
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        // JSON mode plus the schema spelled out in the prompt — the widest
        // compatible subset across OpenAI-style backends.
        let body = serde_json::json!({
            "model": self.chat_model,
            "max_tokens": self.max_tokens,
            "response_format": { "type": "json_object" },
            "messages": [
                {
                    "role": "system",
                    "content": format!(
                        "Respond ONLY with a JSON object matching this schema:\n{schema}"
                    ),
                },
                { "role": "user", "content": prompt },
            ],
        });
        let raw = self.post_json("/v1/chat/completions", &body).await?;
        let api: ApiResponse =
            serde_json::from_value(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let content = api
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        serde_json::from_str(&content)
            .map_err(|e| ProviderError::Parse(format!("structured output is not JSON: {e}")))
    }
}

fn build_chat_body(
    model: &str,
    max_tokens: u32,
    req: &GenerateRequest,
) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": req.system,
    })];
    if let Some(ref raw) = req.raw_messages {
        messages.extend(raw.iter().cloned());
    } else {
        for t in &req.turns {
            messages.push(serde_json::json!({
                "role": t.role,
                "content": t.text,
            }));
        }
    }

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": if req.max_tokens > 0 { req.max_tokens } else { max_tokens },
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }
    body
}

fn parse_chat_response(resp: ApiResponse) -> GenerateResponse {
    let choice = resp.choices.into_iter().next();
    let text = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();
    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();
    let stop_reason = choice
        .and_then(|c| c.finish_reason)
        .unwrap_or_else(|| "stop".to_string());
    GenerateResponse {
        text,
        tool_calls,
        stop_reason,
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
