//! MCP Client Layer
//!
//! This module provides the high-level MCP client that drives one server
//! connection through its lifecycle.
//!
//! # Architecture
//!
//! The client never touches a transport directly. It obtains a [`Session`]
//! from its [`Reconnector`], which picks the transport through a
//! [`ConnectionFactory`] and replays the handshake on every (re)connect.
//! Every operation takes `&self`, so one client can be shared behind an `Arc`
//! and used from many tasks at once.
//!
//! # Usage
//!
//! ```ignore
//! use toolwire::mcp::{McpClient, ServerDescriptor};
//!
//! let client = McpClient::new(ServerDescriptor::stdio(
//!     "filesystem",
//!     "npx",
//!     ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
//! ));
//! client.connect().await?;
//!
//! let tools = client.list_tools().await?;
//! let result = client.call_tool("read_file", json!({"path": "/tmp/file.txt"})).await?;
//! client.disconnect().await;
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::descriptor::ServerDescriptor;
use super::dispatch::ServerEvent;
use super::error::{McpClientError, McpResult};
use super::factory::{ConnectionFactory, DefaultConnectionFactory};
use super::protocol::{
    is_supported_version, CallToolResult, ClientCapabilities, ClientInfo, GetPromptResult,
    InitializeParams, InitializeResult, McpMethod, Prompt, ReadResourceResult, Resource, RpcError,
    Tool, LATEST_PROTOCOL_VERSION,
};
use super::reconnect::Reconnector;
use super::session::{PendingCall, Session};
use super::transport::lock;
use crate::metrics;

const EVENT_CAPACITY: usize = 256;

/// Client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, `connect()` not yet successful
    New,

    /// Handshake completed
    Connected,

    /// `disconnect()` was called
    Disconnected,
}

/// Who asked for a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallActor {
    /// A direct caller such as the CLI
    Caller,

    /// An agent loop acting on a model's request
    Agent,
}

/// Ephemeral record of one tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    /// Correlation id, if the request made it onto the wire
    pub request_id: Option<u64>,
    pub tool: String,
    pub arguments: Value,
    pub actor: CallActor,
    pub outcome: McpResult<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// High-level MCP client
///
/// # Lifecycle
///
/// 1. Create client with `McpClient::new(descriptor)`
/// 2. Handshake with `client.connect()`
/// 3. Use the client (list tools, call tools)
/// 4. `client.disconnect()` when done
///
/// A session that faults while the client is connected is replaced on the
/// next operation. Calls that were in flight at the time fail with
/// `ConnectionLost` and are not re-issued.
pub struct McpClient {
    reconnector: Reconnector,
    client_info: ClientInfo,
    state: Mutex<ClientState>,
    session: Mutex<Option<Arc<Session>>>,
    server_info: Mutex<Option<InitializeResult>>,
    /// Most recently fetched tool list
    tools: Mutex<Option<Vec<Tool>>>,
    /// Set by `notifications/tools/list_changed`
    tools_changed: Arc<AtomicBool>,
    events: broadcast::Sender<ServerEvent>,
    /// Single-flight guard for connect and reconnect
    connecting: tokio::sync::Mutex<()>,
    /// Bumped by every `disconnect()`; a handshake that straddles one is discarded
    disconnects: AtomicU64,
}

impl McpClient {
    /// Create a client using the built-in transports
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self::with_factory(descriptor, Arc::new(DefaultConnectionFactory))
    }

    /// Create a client whose transports come from `factory`
    pub fn with_factory(descriptor: ServerDescriptor, factory: Arc<dyn ConnectionFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tools_changed = Arc::new(AtomicBool::new(false));
        Self {
            reconnector: Reconnector::new(
                descriptor,
                factory,
                events.clone(),
                Arc::clone(&tools_changed),
            ),
            client_info: ClientInfo::default(),
            state: Mutex::new(ClientState::New),
            session: Mutex::new(None),
            server_info: Mutex::new(None),
            tools: Mutex::new(None),
            tools_changed,
            events,
            connecting: tokio::sync::Mutex::new(()),
            disconnects: AtomicU64::new(0),
        }
    }

    /// Identify as someone other than this crate during the handshake
    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = info;
        self
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        self.reconnector.descriptor()
    }

    pub fn name(&self) -> &str {
        &self.descriptor().name
    }

    pub fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Handshake result of the current session
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.server_info).clone()
    }

    /// Tool list from the last `list_tools()`, if any
    pub fn cached_tools(&self) -> Option<Vec<Tool>> {
        lock(&self.tools).clone()
    }

    /// The server announced `notifications/tools/list_changed` since the last listing
    pub fn tools_stale(&self) -> bool {
        self.tools_changed.load(Ordering::SeqCst)
    }

    /// Requests awaiting a response on the current session
    pub fn pending_requests(&self) -> usize {
        self.current_session()
            .map(|s| s.pending_requests())
            .unwrap_or(0)
    }

    /// Observer channel for notifications, server requests and faults
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    /// Connect and perform the initialize handshake
    ///
    /// Connection establishment is retried under the descriptor's retry
    /// policy. Calling `connect()` on a connected client with a healthy
    /// session returns the existing handshake result.
    ///
    /// # Errors
    ///
    /// - `HandshakeFailed` if the server rejects initialize or answers with
    ///   an unsupported protocol version
    /// - `ServerUnavailable` once every attempt failed
    /// - `ClientDisconnected` if `disconnect()` ran before the handshake finished
    pub async fn connect(&self) -> McpResult<InitializeResult> {
        let _guard = self.connecting.lock().await;
        let epoch = self.disconnects.load(Ordering::SeqCst);

        if self.state() == ClientState::Connected {
            if let (Some(session), Some(info)) = (self.current_session(), self.server_info()) {
                if session.is_healthy() {
                    return Ok(info);
                }
            }
        }

        let (session, info) = self
            .reconnector
            .establish(|session| self.handshake(session))
            .await?;
        self.install(session, info.clone(), epoch).await?;

        tracing::info!(
            server = %self.name(),
            "MCP connection initialized: {} v{} (protocol {})",
            info.server_info.name,
            info.server_info.version,
            info.protocol_version
        );
        Ok(info)
    }

    async fn handshake(&self, session: Arc<Session>) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: self.client_info.clone(),
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| McpClientError::MalformedMessage(e.to_string()))?;

        let result = match session
            .request(McpMethod::Initialize.as_str(), Some(params))
            .await
        {
            Ok(result) => result,
            Err(McpClientError::ServerError { code, message, .. }) => {
                return Err(McpClientError::HandshakeFailed(format!(
                    "server rejected initialize: [{code}] {message}"
                )))
            }
            Err(e) => return Err(e),
        };

        let info: InitializeResult = serde_json::from_value(result).map_err(|e| {
            McpClientError::HandshakeFailed(format!("invalid initialize result: {e}"))
        })?;
        if !is_supported_version(&info.protocol_version) {
            return Err(McpClientError::HandshakeFailed(format!(
                "unsupported protocol version {}",
                info.protocol_version
            )));
        }
        session.codec().set_negotiated_version(&info.protocol_version);

        session
            .notify(McpMethod::Initialized.as_str(), None)
            .await?;
        Ok(info)
    }

    /// Make `session` current unless a disconnect happened since `epoch`
    async fn install(
        &self,
        session: Arc<Session>,
        info: InitializeResult,
        epoch: u64,
    ) -> McpResult<()> {
        let installed = {
            let mut state = lock(&self.state);
            if self.disconnects.load(Ordering::SeqCst) == epoch {
                let previous = std::mem::replace(&mut *state, ClientState::Connected);
                let old = lock(&self.session).replace(Arc::clone(&session));
                *lock(&self.server_info) = Some(info);
                Some((previous, old))
            } else {
                None
            }
        };
        let Some((previous, old)) = installed else {
            tracing::info!(server = %self.name(), "Disconnected during handshake, dropping new session");
            session.shutdown(McpClientError::ClientDisconnected).await;
            return Err(McpClientError::ClientDisconnected);
        };

        if previous != ClientState::Connected {
            metrics::MCP_CONNECTIONS_ACTIVE
                .with_label_values(&[self.name()])
                .inc();
        }
        if let Some(old) = old {
            old.shutdown(McpClientError::ConnectionLost(
                "session replaced".to_string(),
            ))
            .await;
        }
        Ok(())
    }

    /// The session to issue a request on, reconnecting a faulted one
    async fn active_session(&self) -> McpResult<Arc<Session>> {
        match self.state() {
            ClientState::New => return Err(McpClientError::NotConnected),
            ClientState::Disconnected => return Err(McpClientError::ClientDisconnected),
            ClientState::Connected => {}
        }
        match self.current_session() {
            Some(session) if session.is_healthy() => Ok(session),
            _ => self.reconnect().await,
        }
    }

    async fn reconnect(&self) -> McpResult<Arc<Session>> {
        let _guard = self.connecting.lock().await;
        let epoch = self.disconnects.load(Ordering::SeqCst);

        // Someone else may have finished reconnecting while we waited
        if self.state() != ClientState::Connected {
            return Err(McpClientError::ClientDisconnected);
        }
        if let Some(session) = self.current_session() {
            if session.is_healthy() {
                return Ok(session);
            }
        }

        tracing::info!(server = %self.name(), "Session lost, reconnecting");
        let (session, info) = self
            .reconnector
            .establish(|session| self.handshake(session))
            .await?;

        self.install(Arc::clone(&session), info, epoch).await?;
        tracing::info!(server = %self.name(), "Reconnected");
        Ok(session)
    }

    /// Follow `nextCursor` until the server stops paginating
    async fn paginate<T: DeserializeOwned>(&self, method: McpMethod, key: &str) -> McpResult<Vec<T>> {
        let session = self.active_session().await?;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let mut result = session.request(method.as_str(), params).await?;

            let page: Vec<T> = match result.get_mut(key).map(Value::take) {
                Some(page) => serde_json::from_value(page).map_err(|e| {
                    McpClientError::MalformedMessage(format!("invalid {method} result: {e}"))
                })?,
                None => Vec::new(),
            };
            items.extend(page);

            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(items)
    }

    /// List available tools and refresh the cached list
    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.tools_changed.store(false, Ordering::SeqCst);
        let tools: Vec<Tool> = self.paginate(McpMethod::ToolsList, "tools").await?;

        tracing::info!(server = %self.name(), "Listed {} tools from MCP server", tools.len());
        for tool in &tools {
            tracing::debug!("  - {}", tool.name);
        }

        *lock(&self.tools) = Some(tools.clone());
        Ok(tools)
    }

    pub async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        self.paginate(McpMethod::ResourcesList, "resources").await
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.paginate(McpMethod::PromptsList, "prompts").await
    }

    /// Read one resource by URI
    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let session = self.active_session().await?;
        let result = session
            .request(McpMethod::ResourcesRead.as_str(), Some(json!({ "uri": uri })))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpClientError::MalformedMessage(format!("invalid resources/read result: {e}")))
    }

    /// Render a prompt template
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        let session = self.active_session().await?;
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = json!(arguments);
        }
        let result = session
            .request(McpMethod::PromptsGet.as_str(), Some(params))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpClientError::MalformedMessage(format!("invalid prompts/get result: {e}")))
    }

    /// Round-trip a `ping` and report how long it took
    pub async fn ping(&self) -> McpResult<Duration> {
        let session = self.active_session().await?;
        let started = Instant::now();
        session.request(McpMethod::Ping.as_str(), None).await?;
        Ok(started.elapsed())
    }

    /// Call a tool and wait for its result
    ///
    /// Returns the `tools/call` result payload unchanged. A result flagged
    /// `isError` becomes `ToolExecutionError`. The call is never retried.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Value> {
        self.start_tool_call(name, arguments).await?.result().await
    }

    /// Send a tool call and return a handle to await or cancel it
    pub async fn start_tool_call(&self, name: &str, arguments: Value) -> McpResult<InFlightToolCall> {
        let session = self.active_session().await?;
        self.validate_tool(name).await?;

        let params = json!({ "name": name, "arguments": arguments });
        tracing::debug!(server = %self.name(), tool = name, "Calling tool");
        let started = Instant::now();
        match session
            .start_request(McpMethod::ToolsCall.as_str(), Some(params))
            .await
        {
            Ok(call) => Ok(InFlightToolCall {
                tool: name.to_string(),
                call,
                started,
            }),
            Err(e) => {
                record_tool_metrics(name, &Err(e.clone()), started);
                Err(e)
            }
        }
    }

    /// Cancel an in-flight request on the current session
    pub async fn cancel(&self, request_id: u64) -> bool {
        match self.current_session() {
            Some(session) => session.cancel(request_id, "cancelled by client").await,
            None => false,
        }
    }

    /// Call a tool and keep a record of who asked and what happened
    pub async fn invoke_tool(&self, name: &str, arguments: Value, actor: CallActor) -> ToolCallRecord {
        let started_at = Utc::now();
        let (request_id, outcome) = match self.start_tool_call(name, arguments.clone()).await {
            Ok(call) => {
                let id = call.id();
                (Some(id), call.result().await)
            }
            Err(e) => (None, Err(e)),
        };
        ToolCallRecord {
            request_id,
            tool: name.to_string(),
            arguments,
            actor,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Check `name` against the most recently fetched tool list
    ///
    /// Without a list the call goes through and the server decides. A name
    /// missing from the list, or any name once the server has announced a
    /// list change, triggers one refresh before the call is rejected.
    async fn validate_tool(&self, name: &str) -> McpResult<()> {
        let known = lock(&self.tools)
            .as_ref()
            .map(|tools| tools.iter().any(|t| t.name == name));

        match known {
            None => Ok(()),
            Some(true) if !self.tools_changed.load(Ordering::SeqCst) => Ok(()),
            Some(_) => {
                let tools = self.list_tools().await?;
                if tools.iter().any(|t| t.name == name) {
                    Ok(())
                } else {
                    Err(McpClientError::ToolNotFound(name.to_string()))
                }
            }
        }
    }

    /// Close the connection and fail everything outstanding
    ///
    /// Idempotent and safe to call from error paths. Pending calls fail with
    /// `ClientDisconnected`.
    pub async fn disconnect(&self) {
        let previous = {
            let mut state = lock(&self.state);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            std::mem::replace(&mut *state, ClientState::Disconnected)
        };
        let session = lock(&self.session).take();

        if let Some(session) = session {
            session.shutdown(McpClientError::ClientDisconnected).await;
        }
        if previous == ClientState::Connected {
            metrics::MCP_CONNECTIONS_ACTIVE
                .with_label_values(&[self.name()])
                .dec();
            tracing::info!(server = %self.name(), "Disconnected from MCP server");
        }
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.name())
            .field("state", &self.state())
            .field("session", &self.current_session())
            .finish()
    }
}

/// A `tools/call` that has been sent
#[derive(Debug)]
pub struct InFlightToolCall {
    tool: String,
    call: PendingCall,
    started: Instant,
}

impl InFlightToolCall {
    /// Correlation id, usable with [`McpClient::cancel`]
    pub fn id(&self) -> u64 {
        self.call.id()
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Wait for the result
    pub async fn result(self) -> McpResult<Value> {
        let outcome = match self.call.response().await {
            Ok(response) => interpret_tool_response(&self.tool, response.into_result()),
            Err(e) => Err(e),
        };
        record_tool_metrics(&self.tool, &outcome, self.started);
        outcome
    }
}

fn record_tool_metrics(tool: &str, outcome: &McpResult<Value>, started: Instant) {
    let status = match outcome {
        Ok(_) => "success",
        Err(e) => e.kind().as_str(),
    };
    metrics::MCP_TOOL_CALLS_TOTAL
        .with_label_values(&[tool, status])
        .inc();
    metrics::MCP_TOOL_CALL_DURATION_SECONDS
        .with_label_values(&[tool])
        .observe(started.elapsed().as_secs_f64());
}

/// Map a `tools/call` outcome onto the error taxonomy
fn interpret_tool_response(tool: &str, outcome: Result<Value, RpcError>) -> McpResult<Value> {
    match outcome {
        Ok(result) if result.get("isError").and_then(Value::as_bool) == Some(true) => {
            let message = serde_json::from_value::<CallToolResult>(result.clone())
                .map(|r| r.text())
                .ok()
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| "tool reported an error".to_string());
            Err(McpClientError::ToolExecutionError {
                tool: tool.to_string(),
                message,
                data: Some(result),
            })
        }
        Ok(result) => Ok(result),
        Err(error) if is_unknown_tool(tool, &error) => Err(McpClientError::ToolNotFound(tool.to_string())),
        Err(error) => Err(McpClientError::ToolExecutionError {
            tool: tool.to_string(),
            message: error.message,
            data: error.data,
        }),
    }
}

fn is_unknown_tool(tool: &str, error: &RpcError) -> bool {
    if error.code == RpcError::METHOD_NOT_FOUND {
        return true;
    }
    if error.code != RpcError::INVALID_PARAMS {
        return false;
    }
    let message = error.message.to_lowercase();
    let tool = tool.to_lowercase();
    let names_tool = message.contains(&format!("tool '{tool}'"))
        || message.contains(&format!("tool \"{tool}\""));
    let missing = ["not found", "not registered", "does not exist", "unknown"]
        .iter()
        .any(|phrase| message.contains(phrase));

    message.contains("unknown tool") || message.contains("tool not found") || (names_tool && missing)
}
