//! Agent Loop
//!
//! Drives a conversation between a model-backed [`AgentStrategy`] and the
//! tools of one MCP server. Each turn the strategy either replies, which ends
//! the run, or requests a round of tool calls. Calls within a round are issued
//! concurrently through the [`ToolBridge`] and their results, failures
//! included, are appended to the conversation before the next turn.
//!
//! No provider implementations live here; callers plug in their own strategy.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::mcp::{AgentToolCall, AgentToolResult, FunctionSpec, ToolBridge};

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    /// Calls requested by the assistant in this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<AgentToolCall>,
    /// Call this tool message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ConversationMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(calls: Vec<AgentToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::text(Role::Assistant, "")
        }
    }

    pub fn tool_result(result: &AgentToolResult) -> Self {
        Self {
            tool_call_id: Some(result.call_id.clone()),
            is_error: result.is_error,
            ..Self::text(Role::Tool, result.content_text())
        }
    }
}

/// Ordered message history handed to the strategy each turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(prompt: impl Into<String>) -> Self {
        let mut conversation = Self::new();
        conversation.push(ConversationMessage::system(prompt));
        conversation
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// What the strategy wants to do next
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// Final answer; ends the run
    Reply(String),
    /// Run these tools, then ask again
    ToolCalls(Vec<AgentToolCall>),
}

/// Model-backed decision maker
#[async_trait]
pub trait AgentStrategy: Send + Sync {
    /// Provider name, for logs
    fn provider(&self) -> &str;

    async fn produce_response(
        &self,
        conversation: &Conversation,
        tools: &[FunctionSpec],
    ) -> Result<TurnResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Replied,
    RoundLimit,
}

/// Result of one [`AgentLoop::run`]
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Final reply, absent when the round limit stopped the run
    pub reply: Option<String>,
    pub stop_reason: StopReason,
    /// Tool rounds executed
    pub rounds: usize,
    /// Every tool result, in issue order
    pub tool_results: Vec<AgentToolResult>,
    pub conversation: Conversation,
}

pub struct AgentLoop {
    strategy: Arc<dyn AgentStrategy>,
    bridge: ToolBridge,
    max_tool_rounds: usize,
}

impl AgentLoop {
    pub fn new(strategy: Arc<dyn AgentStrategy>, bridge: ToolBridge) -> Self {
        Self {
            strategy,
            bridge,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Run a single task to completion
    pub async fn run(&self, task: &str) -> Result<AgentOutcome> {
        let mut conversation = Conversation::new();
        conversation.push(ConversationMessage::user(task));
        self.run_conversation(conversation).await
    }

    /// Continue an existing conversation until the strategy replies
    ///
    /// # Errors
    ///
    /// Returns an error if the tool list cannot be fetched or the strategy
    /// fails. Tool failures are not errors; they are fed back as results.
    pub async fn run_conversation(&self, mut conversation: Conversation) -> Result<AgentOutcome> {
        let provider = self.strategy.provider();
        let server = self.bridge.client().name().to_string();
        let mut rounds = 0;
        let mut tool_results = Vec::new();

        info!(provider, server = %server, "Starting agent run");

        loop {
            // Served from the cache unless the server announced a change
            let tools = self
                .bridge
                .function_specs()
                .await
                .with_context(|| format!("Failed to list tools on '{}'", server))?;

            let turn = self
                .strategy
                .produce_response(&conversation, &tools)
                .await
                .with_context(|| format!("Strategy '{}' failed to respond", provider))?;

            let calls = match turn {
                TurnResult::Reply(text) => {
                    conversation.push(ConversationMessage::assistant(text.clone()));
                    info!(provider, rounds, "Agent replied");
                    return Ok(AgentOutcome {
                        reply: Some(text),
                        stop_reason: StopReason::Replied,
                        rounds,
                        tool_results,
                        conversation,
                    });
                }
                TurnResult::ToolCalls(calls) if calls.is_empty() => {
                    anyhow::bail!("Strategy '{}' requested an empty tool round", provider)
                }
                TurnResult::ToolCalls(calls) => calls,
            };

            if rounds >= self.max_tool_rounds {
                warn!(
                    provider,
                    limit = self.max_tool_rounds,
                    "Tool round limit reached, stopping"
                );
                return Ok(AgentOutcome {
                    reply: None,
                    stop_reason: StopReason::RoundLimit,
                    rounds,
                    tool_results,
                    conversation,
                });
            }
            rounds += 1;

            debug!(
                round = rounds,
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Running tool round"
            );
            conversation.push(ConversationMessage::assistant_tool_calls(calls.clone()));

            let results = join_all(calls.iter().map(|call| self.bridge.invoke(call))).await;
            for result in &results {
                conversation.push(ConversationMessage::tool_result(result));
            }
            tool_results.extend(results);
        }
    }
}
