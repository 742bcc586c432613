//! Tool execution loop — the core agentic behavior.
//!
//! Flow: prompt → model → if tool calls → validate + execute → inject
//! results → model → repeat. Stops when the model returns no tool calls,
//! the iteration cap is reached, the cancellation token fires, or the
//! provider errors.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{GenerateRequest, GenerateResponse, Provider, ProviderError, ToolCall};

use super::{validate_input, Tool, ToolResult};

/// Maximum tool loop iterations to prevent runaway agents.
const MAX_ITERATIONS: usize = 10;

/// Run the full tool execution loop.
///
/// Starts from `initial_request` (its `turns` are converted to raw JSON
/// messages on the first pass). Returns the final response — the one with
/// no outstanding tool calls.
pub async fn run_tool_loop(
    provider: &dyn Provider,
    initial_request: GenerateRequest,
    tools: &[Box<dyn Tool>],
    cancel: Option<&CancellationToken>,
) -> Result<GenerateResponse, ProviderError> {
    let mut raw_messages: Vec<serde_json::Value> =
        if let Some(ref raw) = initial_request.raw_messages {
            raw.clone()
        } else {
            initial_request
                .turns
                .iter()
                .map(|t| serde_json::json!({ "role": t.role, "content": t.text }))
                .collect()
        };

    let mut last_response: Option<GenerateResponse> = None;

    for iteration in 0..MAX_ITERATIONS {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(ProviderError::Cancelled);
        }

        let mut req = initial_request.clone();
        req.raw_messages = Some(raw_messages.clone());

        debug!(iteration, "tool loop iteration");

        let response = match cancel {
            Some(token) => {
                tokio::select! {
                    r = provider.generate(&req) => r?,
                    _ = token.cancelled() => return Err(ProviderError::Cancelled),
                }
            }
            None => provider.generate(&req).await?,
        };

        if response.tool_calls.is_empty() {
            info!(iteration, "tool loop complete");
            return Ok(response);
        }

        // Echo the assistant turn with its tool calls back into history.
        raw_messages.push(assistant_turn(&response));

        // Execute each call and append its result as a `tool` turn.
        for call in &response.tool_calls {
            let result = execute_tool(tools, call).await;
            raw_messages.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": result.content,
            }));
        }

        last_response = Some(response);
    }

    warn!(max_iterations = MAX_ITERATIONS, "tool loop hit maximum iterations");

    last_response.ok_or_else(|| {
        ProviderError::Parse(format!(
            "tool loop exceeded {MAX_ITERATIONS} iterations without a final response"
        ))
    })
}

fn assistant_turn(response: &GenerateResponse) -> serde_json::Value {
    let tool_calls: Vec<serde_json::Value> = response
        .tool_calls
        .iter()
        .map(|call| {
            serde_json::json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.input.to_string(),
                }
            })
        })
        .collect();
    serde_json::json!({
        "role": "assistant",
        "content": if response.text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(response.text.clone())
        },
        "tool_calls": tool_calls,
    })
}

/// Find, validate, and execute the named tool. Unknown names and schema
/// violations become error results so the model can recover.
async fn execute_tool(tools: &[Box<dyn Tool>], call: &ToolCall) -> ToolResult {
    let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
        warn!(tool = %call.name, "unknown tool requested");
        return ToolResult::error(format!("unknown tool: {}", call.name));
    };
    if let Err(violation) = validate_input(&tool.input_schema(), &call.input) {
        return ToolResult::error(format!("invalid parameters: {violation}"));
    }
    debug!(tool = %call.name, "executing tool");
    tool.execute(call.input.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "counter"
        }
        fn description(&self) -> &str {
            "Counts invocations"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "tag": { "type": "string" } },
                "required": ["tag"]
            })
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolResult::success("{\"ok\":true}")
        }
    }

    fn tool_call_response(name: &str, input: serde_json::Value) -> GenerateResponse {
        GenerateResponse {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: name.to_string(),
                input,
            }],
            stop_reason: "tool_calls".to_string(),
        }
    }

    fn final_response(text: &str) -> GenerateResponse {
        GenerateResponse {
            text: text.to_string(),
            tool_calls: vec![],
            stop_reason: "stop".to_string(),
        }
    }

    #[tokio::test]
    async fn loop_executes_tools_then_returns_final_text() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(CountingTool {
            calls: Arc::clone(&calls),
        })];
        let provider = ScriptedProvider::new(vec![
            tool_call_response("counter", serde_json::json!({"tag": "a"})),
            final_response("done"),
        ]);

        let out = run_tool_loop(&provider, GenerateRequest::default(), &tools, None)
            .await
            .unwrap();
        assert_eq!(out.text, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result_not_failure() {
        let tools: Vec<Box<dyn Tool>> = vec![];
        let provider = ScriptedProvider::new(vec![
            tool_call_response("no_such_tool", serde_json::json!({})),
            final_response("recovered"),
        ]);

        let out = run_tool_loop(&provider, GenerateRequest::default(), &tools, None)
            .await
            .unwrap();
        assert_eq!(out.text, "recovered");

        // The error result was echoed back to the model as a tool turn.
        let second = provider.request_at(1);
        let raw = second.raw_messages.unwrap();
        let tool_turn = raw
            .iter()
            .find(|m| m["role"] == "tool")
            .expect("tool turn present");
        assert!(tool_turn["content"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected_before_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(CountingTool {
            calls: Arc::clone(&calls),
        })];
        let provider = ScriptedProvider::new(vec![
            // Missing the required "tag" parameter.
            tool_call_response("counter", serde_json::json!({})),
            final_response("ok"),
        ]);

        run_tool_loop(&provider, GenerateRequest::default(), &tools, None)
            .await
            .unwrap();
        // The tool body never ran.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_loop() {
        let tools: Vec<Box<dyn Tool>> = vec![];
        let provider = ScriptedProvider::new(vec![final_response("never seen")]);
        let token = CancellationToken::new();
        token.cancel();

        let out = run_tool_loop(&provider, GenerateRequest::default(), &tools, Some(&token)).await;
        assert!(matches!(out, Err(ProviderError::Cancelled)));
    }
}
