//! MCP Command Module
//!
//! This module encapsulates the operations behind the `toolwire` CLI.
//! It provides a clean abstraction layer between the CLI (main.rs)
//! and the MCP client implementation.
//!
//! # Design
//!
//! - CLI parsing and rendering live in main.rs, everything else here
//! - Every operation returns a structured result, never prints
//! - Clients are built through a [`ConnectionFactory`] so the operations can
//!   be exercised against in-memory servers

use crate::config::Config;
use crate::mcp::{
    CallActor, ConnectionFactory, DefaultConnectionFactory, ErrorKind, GetPromptResult,
    McpClient, Prompt, ReadResourceResult, Resource, ServerDescriptor, Tool, TransportKind,
};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One configured server, as listed by `toolwire servers`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerSummary {
    pub name: String,
    pub transport: TransportKind,
    /// URL or command line
    pub target: String,
    pub description: Option<String>,
    pub is_default: bool,
}

/// A tool with the bits a terminal listing needs
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSummary {
    pub name: String,
    pub description: Option<String>,
    /// Required argument names from the input schema
    pub required: Vec<String>,
}

impl From<&Tool> for ToolSummary {
    fn from(tool: &Tool) -> Self {
        let required = tool
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            required,
        }
    }
}

/// Result of `toolwire call`
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub tool: String,
    pub request_id: Option<u64>,
    pub success: bool,
    /// Server result on success, error text otherwise
    pub content: Value,
    /// Error kind identifier when the call failed
    pub error_kind: Option<&'static str>,
    pub duration_ms: i64,
}

/// Result of `toolwire probe`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub server: String,
    /// Whether every step succeeded
    pub success: bool,
    pub protocol_version: Option<String>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub tool_names: Vec<String>,
    /// `None` when the server does not advertise resources
    pub resource_count: Option<usize>,
    /// `None` when the server does not advertise prompts
    pub prompt_count: Option<usize>,
    pub ping_ms: Option<u128>,
    /// Error message (if failed)
    pub error: Option<String>,
}

/// Summaries of every configured server, sorted by name
pub fn list_servers(config: &Config) -> Result<Vec<ServerSummary>> {
    Ok(config
        .descriptors()?
        .into_iter()
        .map(|descriptor| ServerSummary {
            is_default: config.default_server.as_deref() == Some(descriptor.name.as_str()),
            transport: descriptor.kind(),
            target: descriptor.transport.target(),
            name: descriptor.name,
            description: descriptor.description,
        })
        .collect())
}

/// Resolve a server from the config and connect to it
pub async fn open_client(config: &Config, server: Option<&str>) -> Result<McpClient> {
    let descriptor = config.resolve_server(server)?;
    connect_with(descriptor, Arc::new(DefaultConnectionFactory)).await
}

/// Connect to a server through a specific factory
pub async fn connect_with(
    descriptor: ServerDescriptor,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<McpClient> {
    let name = descriptor.name.clone();
    info!(server = %name, "🔌 Connecting to {}", descriptor.transport.target());

    let client = McpClient::with_factory(descriptor, factory);
    let info = client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to MCP server '{}'", name))?;

    info!(
        server = %name,
        "Connected to {} v{} (protocol {})",
        info.server_info.name,
        info.server_info.version,
        info.protocol_version
    );
    Ok(client)
}

pub async fn list_tools(client: &McpClient) -> Result<Vec<ToolSummary>> {
    let tools = client.list_tools().await.context("Failed to list tools")?;
    Ok(tools.iter().map(ToolSummary::from).collect())
}

/// Parse `--args`: absent means `{}`, otherwise a JSON object
pub fn parse_arguments(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(raw).context("Tool arguments are not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("Tool arguments must be a JSON object, got: {}", raw);
    }
    Ok(value)
}

/// Call one tool; tool-level failures are reported in the outcome
pub async fn call_tool(client: &McpClient, tool: &str, arguments: Value) -> CallOutcome {
    let record = client
        .invoke_tool(tool, arguments, CallActor::Caller)
        .await;
    let duration_ms = record.duration().num_milliseconds();

    match record.outcome {
        Ok(content) => CallOutcome {
            tool: record.tool,
            request_id: record.request_id,
            success: true,
            content,
            error_kind: None,
            duration_ms,
        },
        Err(e) => {
            warn!(tool = %record.tool, error = %e, "⚠️  Tool call failed");
            let kind: ErrorKind = e.kind();
            CallOutcome {
                tool: record.tool,
                request_id: record.request_id,
                success: false,
                content: Value::String(e.to_string()),
                error_kind: Some(kind.as_str()),
                duration_ms,
            }
        }
    }
}

pub async fn list_resources(client: &McpClient) -> Result<Vec<Resource>> {
    client
        .list_resources()
        .await
        .context("Failed to list resources")
}

pub async fn read_resource(client: &McpClient, uri: &str) -> Result<ReadResourceResult> {
    client
        .read_resource(uri)
        .await
        .with_context(|| format!("Failed to read resource {}", uri))
}

pub async fn list_prompts(client: &McpClient) -> Result<Vec<Prompt>> {
    client.list_prompts().await.context("Failed to list prompts")
}

/// Parse `--arg key=value` pairs
pub fn parse_prompt_arguments(pairs: &[String]) -> Result<Option<HashMap<String, String>>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .with_context(|| format!("Prompt argument '{}' is not key=value", pair))
        })
        .collect::<Result<HashMap<_, _>>>()
        .map(Some)
}

pub async fn get_prompt(
    client: &McpClient,
    name: &str,
    arguments: Option<HashMap<String, String>>,
) -> Result<GetPromptResult> {
    client
        .get_prompt(name, arguments)
        .await
        .with_context(|| format!("Failed to get prompt {}", name))
}

pub async fn ping(client: &McpClient) -> Result<Duration> {
    client.ping().await.context("Ping failed")
}

/// Connect, then exercise every read-only operation the server advertises
///
/// Never fails: each problem is recorded in the report.
pub async fn probe(descriptor: ServerDescriptor, factory: Arc<dyn ConnectionFactory>) -> ProbeReport {
    let mut report = ProbeReport {
        server: descriptor.name.clone(),
        ..Default::default()
    };

    let client = McpClient::with_factory(descriptor, factory);
    let info = match client.connect().await {
        Ok(info) => info,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };
    report.protocol_version = Some(info.protocol_version.clone());
    report.server_name = Some(info.server_info.name.clone());
    report.server_version = Some(info.server_info.version.clone());

    if let Err(e) = probe_operations(&client, &info.capabilities, &mut report).await {
        report.error = Some(e.to_string());
    } else {
        report.success = true;
    }

    client.disconnect().await;
    report
}

async fn probe_operations(
    client: &McpClient,
    capabilities: &crate::mcp::ServerCapabilities,
    report: &mut ProbeReport,
) -> Result<()> {
    report.ping_ms = Some(ping(client).await?.as_millis());

    report.tool_names = client
        .list_tools()
        .await
        .context("Failed to list tools")?
        .into_iter()
        .map(|t| t.name)
        .collect();

    if capabilities.resources.is_some() {
        report.resource_count = Some(list_resources(client).await?.len());
    }
    if capabilities.prompts.is_some() {
        report.prompt_count = Some(list_prompts(client).await?.len());
    }
    Ok(())
}
