//! Test doubles for the provider seam. Used by this crate's tests and by
//! downstream crates that exercise pipelines without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{GenerateRequest, GenerateResponse, Provider, ProviderError};

/// A provider that replays scripted responses in order and records every
/// request it receives.
///
/// When a script runs dry, `generate` returns an empty final response and
/// `generate_structured` returns `{}` — tests that care script enough.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<GenerateResponse>>,
    structured: Mutex<VecDeque<serde_json::Value>>,
    requests: Mutex<Vec<GenerateRequest>>,
    structured_prompts: Mutex<Vec<String>>,
    fail_generate: AtomicBool,
    fail_embed: AtomicBool,
    fail_structured: AtomicBool,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<GenerateResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn with_structured(self, values: Vec<serde_json::Value>) -> Self {
        *self.structured.lock().unwrap() = values.into();
        self
    }

    /// Append a generation response to the script.
    pub fn push_response(&self, response: GenerateResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Append a structured-output value to the script.
    pub fn push_structured(&self, value: serde_json::Value) {
        self.structured.lock().unwrap().push_back(value);
    }

    /// Make every generate/structured call fail as a transient outage.
    pub fn fail_generation(&self, fail: bool) {
        self.fail_generate.store(fail, Ordering::SeqCst);
        self.fail_structured.store(fail, Ordering::SeqCst);
    }

    /// Make every embed call fail as a transient outage.
    pub fn fail_embeddings(&self, fail: bool) {
        self.fail_embed.store(fail, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request_at(&self, index: usize) -> GenerateRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    pub fn structured_prompt_at(&self, index: usize) -> String {
        self.structured_prompts.lock().unwrap()[index].clone()
    }

    pub fn structured_call_count(&self) -> usize {
        self.structured_prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn embedding_model_id(&self) -> &str {
        "scripted-embed-1"
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(ProviderError::Http("scripted outage".to_string()));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if self.fail_embed.load(Ordering::SeqCst) {
            return Err(ProviderError::Http("scripted embedding outage".to_string()));
        }
        Ok(pseudo_embedding(text))
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        self.structured_prompts
            .lock()
            .unwrap()
            .push(prompt.to_string());
        if self.fail_structured.load(Ordering::SeqCst) {
            return Err(ProviderError::Http("scripted outage".to_string()));
        }
        Ok(self
            .structured
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| serde_json::json!({})))
    }
}

/// Deterministic unit-norm vector derived from the text bytes: identical
/// texts embed identically, distinct texts almost never collide.
pub fn pseudo_embedding(text: &str) -> Vec<f32> {
    let normalized = banter_core::text::normalize(text);
    let mut state: u64 = 0xcbf2_9ce4_8422_2325;
    for b in normalized.as_bytes() {
        state ^= *b as u64;
        state = state.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let mut v = Vec::with_capacity(16);
    for i in 0..16u64 {
        let x = state.wrapping_mul(i.wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        v.push(((x >> 32) as f32 / u32::MAX as f32) - 0.5);
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
