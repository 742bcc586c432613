//! Tool system for agent tool calling.
//!
//! Defines the `Tool` trait all tools implement, parameter validation
//! against each tool's JSON schema, and the execution loop. Unknown tool
//! names and invalid parameters become error tool-results — they never
//! fail the surrounding request.

pub mod facts;
pub mod tool_loop;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// JSON string returned to the model.
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "recall_facts").
    fn name(&self) -> &str;
    /// Human-readable description shown to the model.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with already-validated input.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Convert a slice of tools to API-level tool definitions.
pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}

/// Validate tool input against the declared schema before dispatch.
///
/// Covers the subset the built-in tools use: top-level `type: object`,
/// `required` fields, and primitive `properties` types. Returns a
/// human-readable description of the first violation.
pub fn validate_input(schema: &serde_json::Value, input: &serde_json::Value) -> Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") && !input.is_object() {
        return Err(format!("expected an object, got {input}"));
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if input.get(field).is_none() {
                return Err(format!("missing required parameter: {field}"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, prop_schema) in props {
            let Some(value) = input.get(name) else {
                continue;
            };
            let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!(
                    "parameter {name} should be {expected}, got {value}"
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["key"]
        })
    }

    #[test]
    fn valid_input_passes() {
        let input = serde_json::json!({"key": "location", "limit": 5});
        assert!(validate_input(&schema(), &input).is_ok());
    }

    #[test]
    fn missing_required_is_rejected() {
        let input = serde_json::json!({"limit": 5});
        let err = validate_input(&schema(), &input).unwrap_err();
        assert!(err.contains("key"));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let input = serde_json::json!({"key": "location", "limit": "five"});
        let err = validate_input(&schema(), &input).unwrap_err();
        assert!(err.contains("limit"));
    }

    #[test]
    fn non_object_input_is_rejected() {
        let input = serde_json::json!("just a string");
        assert!(validate_input(&schema(), &input).is_err());
    }
}
