//! In-memory transport and helpers for unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use super::codec::ProtocolCodec;
use super::descriptor::ServerDescriptor;
use super::dispatch::{Dispatcher, ServerEvent};
use super::error::{McpClientError, McpResult};
use super::factory::ConnectionFactory;
use super::pending::PendingRequestTable;
use super::protocol::LATEST_PROTOCOL_VERSION;
use super::transport::{lock, ConnectionState, StateCell, Transport, TransportKind};

/// Codec, table and dispatcher wired together the way a session wires them
pub struct DispatchFixture {
    pub codec: Arc<ProtocolCodec>,
    pub pending: Arc<PendingRequestTable>,
    pub events: broadcast::Receiver<ServerEvent>,
    dispatcher: Arc<Dispatcher>,
}

impl DispatchFixture {
    pub fn new(server: &str) -> Self {
        let codec = Arc::new(ProtocolCodec::new());
        let pending = Arc::new(PendingRequestTable::new(server));
        let (tx, rx) = broadcast::channel(64);
        let dispatcher = Arc::new(Dispatcher::new(
            server,
            Arc::clone(&codec),
            Arc::clone(&pending),
            tx,
            Arc::new(AtomicBool::new(false)),
        ));
        Self {
            codec,
            pending,
            events: rx,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Next observer event, or `None` after five seconds
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .ok()
            .and_then(Result::ok)
    }
}

/// What the scripted server does with a request
pub enum Reply {
    Result(Value),
    Error(i32, String),
    /// Leave the request unanswered; the test answers later via [`MockHandle::inject`]
    Hold,
}

pub type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

#[derive(Default)]
struct MockShared {
    state: StateCell,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    sent: Mutex<Vec<Value>>,
}

/// Test-side view into a [`MockTransport`]
#[derive(Clone, Default)]
pub struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockHandle {
    /// Every frame the client sent, parsed
    pub fn sent(&self) -> Vec<Value> {
        lock(&self.shared.sent).clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| m["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Deliver a frame as if the server had sent it
    pub fn inject(&self, frame: Value) {
        let dispatcher = lock(&self.shared.dispatcher).clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.dispatch_frame(&frame.to_string());
        }
    }

    /// Simulate the connection dropping
    pub fn fault(&self, reason: &str) {
        let dispatcher = lock(&self.shared.dispatcher).clone();
        if let Some(dispatcher) = dispatcher {
            if self.shared.state.fault() {
                dispatcher.fault(McpClientError::ConnectionLost(reason.to_string()));
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }
}

/// Scripted in-memory transport
pub struct MockTransport {
    handler: Handler,
    multiplexed: bool,
    fail_open: Option<McpClientError>,
    handle: MockHandle,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        Self::with_handler(Arc::new(handler))
    }

    pub fn with_handler(handler: Handler) -> Self {
        Self {
            handler,
            multiplexed: true,
            fail_open: None,
            handle: MockHandle::default(),
        }
    }

    pub fn multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    pub fn failing(mut self, error: McpClientError) -> Self {
        self.fail_open = Some(error);
        self
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn state(&self) -> ConnectionState {
        self.handle.shared.state.get()
    }

    fn supports_multiplexing(&self) -> bool {
        self.multiplexed
    }

    async fn open(&self, dispatcher: Arc<Dispatcher>) -> McpResult<()> {
        let state = &self.handle.shared.state;
        state.begin_open()?;
        if let Some(err) = &self.fail_open {
            state.set(ConnectionState::Closed);
            return Err(err.clone());
        }
        *lock(&self.handle.shared.dispatcher) = Some(dispatcher);
        state.set(ConnectionState::Open);
        Ok(())
    }

    async fn send(&self, frame: String) -> McpResult<()> {
        self.handle.shared.state.ensure_open()?;
        let message: Value = serde_json::from_str(&frame)
            .map_err(|e| McpClientError::MalformedMessage(e.to_string()))?;
        lock(&self.handle.shared.sent).push(message.clone());

        let (Some(id), Some(method)) = (message.get("id").cloned(), message["method"].as_str())
        else {
            return Ok(());
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        match (self.handler)(method, &params) {
            Reply::Result(result) => self
                .handle
                .inject(json!({"jsonrpc": "2.0", "id": id, "result": result})),
            Reply::Error(code, message) => self.handle.inject(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            })),
            Reply::Hold => {}
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        if self.handle.shared.state.begin_close() {
            self.handle.shared.state.set(ConnectionState::Closed);
        }
        Ok(())
    }
}

/// Factory producing mock transports; the first `failures` opens are refused
pub struct MockFactory {
    handler: Handler,
    multiplexed: bool,
    failures: AtomicUsize,
    created: AtomicUsize,
    handles: Mutex<Vec<MockHandle>>,
}

impl MockFactory {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            multiplexed: true,
            failures: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    /// Transports created so far (one per connection attempt)
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_handle(&self) -> Option<MockHandle> {
        lock(&self.handles).last().cloned()
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self, _descriptor: &ServerDescriptor) -> McpResult<Arc<dyn Transport>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut transport =
            MockTransport::with_handler(Arc::clone(&self.handler)).multiplexed(self.multiplexed);

        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            transport = transport.failing(McpClientError::ConnectionFailed(
                "mock server refused connection".to_string(),
            ));
        }

        lock(&self.handles).push(transport.handle());
        Ok(Arc::new(transport))
    }
}

/// A small tool server: `search` and `echo`, one resource, one prompt
pub fn demo_handler() -> Handler {
    Arc::new(|method: &str, params: &Value| match method {
        "initialize" => Reply::Result(json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": true}, "resources": {}, "prompts": {}},
            "serverInfo": {"name": "demo", "version": "0.1.0"}
        })),
        "ping" => Reply::Result(json!({})),
        "tools/list" => Reply::Result(json!({"tools": [
            {
                "name": "search",
                "description": "Search the index",
                "inputSchema": {
                    "type": "object",
                    "properties": {"query": {"type": "string"}, "limit": {"type": "integer"}},
                    "required": ["query"]
                }
            },
            {
                "name": "echo",
                "description": "Echo the input",
                "inputSchema": {
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }
            }
        ]})),
        "tools/call" => match params["name"].as_str() {
            Some("echo") => Reply::Result(params["arguments"].clone()),
            Some("search") => Reply::Result(json!({
                "content": [{"type": "text", "text": format!("results for {}", params["arguments"]["query"])}]
            })),
            Some("fail") => Reply::Result(json!({
                "content": [{"type": "text", "text": "disk full"}],
                "isError": true
            })),
            other => Reply::Error(-32602, format!("Unknown tool: {}", other.unwrap_or_default())),
        },
        "resources/list" => Reply::Result(json!({"resources": [
            {"uri": "memory://notes", "name": "notes", "mimeType": "text/plain"}
        ]})),
        "resources/read" => match params["uri"].as_str() {
            Some("memory://notes") => Reply::Result(json!({"contents": [
                {"uri": "memory://notes", "mimeType": "text/plain", "text": "remember the milk"}
            ]})),
            _ => Reply::Error(-32002, "Resource not found".to_string()),
        },
        "prompts/list" => Reply::Result(json!({"prompts": [
            {"name": "greeting", "arguments": [{"name": "name", "required": true}]}
        ]})),
        "prompts/get" => Reply::Result(json!({
            "messages": [{"role": "user", "content": {"type": "text", "text": format!("Hello, {}!", params["arguments"]["name"].as_str().unwrap_or("friend"))}}]
        })),
        other => Reply::Error(-32601, format!("Method not found: {other}")),
    })
}
