//! Tool bridge for agent integrations
//!
//! The [`ToolBridge`] sits between an agent loop and one [`McpClient`]. It
//! presents tools as provider-neutral function specifications and turns every
//! invocation outcome, success or failure, into an [`AgentToolResult`] that can
//! be fed straight back into the conversation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::client::{CallActor, McpClient};
use super::error::{McpClientError, McpResult};
use super::protocol::Tool;

/// Callable function as presented to a model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

/// A tool invocation requested by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentToolCall {
    /// Provider-assigned call id, echoed back in the result
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl AgentToolCall {
    /// New call with a generated id
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of an agent tool call, always data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentToolResult {
    pub call_id: String,
    pub tool_name: String,
    /// Server result verbatim, or a text explanation when `is_error`
    pub content: Value,
    pub is_error: bool,
}

impl AgentToolResult {
    pub fn success(call: &AgentToolCall, content: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content,
            is_error: false,
        }
    }

    pub fn error(call: &AgentToolCall, explanation: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: Value::String(explanation.into()),
            is_error: true,
        }
    }

    /// Content rendered as text for conversation turns
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Provider-agnostic adapter from agent tool calls to an [`McpClient`]
#[derive(Debug, Clone)]
pub struct ToolBridge {
    client: Arc<McpClient>,
}

impl ToolBridge {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    /// Tools from the client's cache, listing them first if nothing is cached
    /// or the server announced a change
    pub async fn available_tools(&self) -> McpResult<Vec<Tool>> {
        match self.client.cached_tools() {
            Some(tools) if !self.client.tools_stale() => Ok(tools),
            _ => self.client.list_tools().await,
        }
    }

    /// Re-list tools from the server
    pub async fn refresh(&self) -> McpResult<Vec<Tool>> {
        self.client.list_tools().await
    }

    /// Available tools as function specifications
    pub async fn function_specs(&self) -> McpResult<Vec<FunctionSpec>> {
        Ok(self
            .available_tools()
            .await?
            .iter()
            .map(to_function_spec)
            .collect())
    }

    /// Run an agent's tool call; failures come back as error results
    pub async fn invoke(&self, call: &AgentToolCall) -> AgentToolResult {
        let schema = self
            .client
            .cached_tools()
            .and_then(|tools| tools.into_iter().find(|t| t.name == call.name))
            .map(|t| t.input_schema);

        if let Some(schema) = schema {
            if let Err(problems) = validate_arguments(&schema, &call.arguments) {
                tracing::debug!(tool = %call.name, ?problems, "Rejected tool arguments");
                return AgentToolResult::error(
                    call,
                    format!(
                        "Invalid arguments for tool '{}': {}",
                        call.name,
                        problems.join("; ")
                    ),
                );
            }
        }

        let arguments = match &call.arguments {
            Value::Null => json!({}),
            other => other.clone(),
        };
        let record = self
            .client
            .invoke_tool(&call.name, arguments, CallActor::Agent)
            .await;

        match record.outcome {
            Ok(content) => AgentToolResult::success(call, content),
            Err(e) => {
                tracing::info!(tool = %call.name, error = %e, "Tool call failed");
                AgentToolResult::error(call, describe_failure(&call.name, &e))
            }
        }
    }
}

/// Present a tool as a function specification
pub fn to_function_spec(tool: &Tool) -> FunctionSpec {
    FunctionSpec {
        name: tool.name.clone(),
        description: tool.description.clone().unwrap_or_default(),
        parameters: tool.input_schema.clone(),
    }
}

/// Check presence and type of required fields only
///
/// Optional fields and nested schemas are left to the server. A `type` may be
/// a single name or a list of names.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), Vec<String>> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => return Err(vec![format!("arguments must be an object, got {}", json_type(other))]),
    };

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    let properties = schema.get("properties").and_then(Value::as_object);

    let mut problems = Vec::new();
    for field in required {
        let Some(value) = args.get(field) else {
            problems.push(format!("missing required field '{field}'"));
            continue;
        };
        let expected = properties
            .and_then(|props| props.get(field))
            .and_then(|prop| prop.get("type"));
        if let Some(expected) = expected {
            if !type_matches(expected, value) {
                problems.push(format!(
                    "field '{field}' should be {}, got {}",
                    describe_type(expected),
                    json_type(value)
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => matches_type_name(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| matches_type_name(name, value)),
        _ => true,
    }
}

fn matches_type_name(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        // 3.0 is an integer as far as JSON Schema is concerned
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Explain a failed call in words an agent can act on
pub fn describe_failure(tool: &str, error: &McpClientError) -> String {
    match error {
        McpClientError::ToolNotFound(_) => {
            format!("Tool '{tool}' is not available on this server.")
        }
        McpClientError::ToolExecutionError { message, .. } => {
            format!("Tool '{tool}' failed: {message}")
        }
        McpClientError::Timeout(_) => {
            format!("Tool '{tool}' did not respond in time. It may still have run.")
        }
        McpClientError::Cancelled(_) => format!("The call to tool '{tool}' was cancelled."),
        other => format!(
            "Tool '{tool}' could not be called ({}): {other}",
            other.kind()
        ),
    }
}
