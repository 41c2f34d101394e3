//! MCP HTTP Transport Layer
//!
//! Request-channel transport: every outbound frame is one HTTP POST and the
//! response body carries the reply. Because the exchange is paired, the
//! transport never multiplexes and delivers the reply to the dispatcher
//! before `send` returns.
//!
//! # Transport Modes
//!
//! The server may answer a POST with:
//!
//! 1. `application/json`: a single message or a batch
//! 2. `text/event-stream`: streamable HTTP, one message per SSE `data:` event
//! 3. `202 Accepted` with no body (notifications)
//!
//! A session id issued through the `Mcp-Session-Id` header is echoed on every
//! later request and released with a DELETE on close.
//!
//! Transport failures (network errors, non-success status) surface as
//! `SendFailed`/`ReceiveFailed` and leave the connection usable.
//!
//! # Example
//!
//! ```ignore
//! let transport = HttpTransport::new("https://mcp.example.com/mcp")
//!     .with_header("Authorization", "Bearer token")
//!     .with_timeout(Duration::from_secs(60));
//! ```

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use super::dispatch::Dispatcher;
use super::error::{McpClientError, McpResult};
use super::transport::{lock, ConnectionState, StateCell, Transport, TransportKind};

/// Header carrying the server-issued session id
pub const SESSION_HEADER: &str = "mcp-session-id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

struct HttpLink {
    client: reqwest::Client,
    dispatcher: Arc<Dispatcher>,
}

/// HTTP transport for remote MCP servers
pub struct HttpTransport {
    /// MCP server endpoint URL
    url: String,

    /// Caller-supplied headers (e.g. authentication), passed through verbatim
    headers: HashMap<String, String>,

    /// Per-request timeout
    timeout: Duration,

    state: StateCell,

    /// Set once by `open`
    link: OnceLock<HttpLink>,

    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    /// Create a new HTTP transport for the given MCP endpoint
    ///
    /// Nothing touches the network until `open`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            state: StateCell::new(),
            link: OnceLock::new(),
            session_id: Mutex::new(None),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Get the server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Session id issued by the server, if any
    pub fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    fn build_client(&self) -> McpResult<reqwest::Client> {
        reqwest::Url::parse(&self.url).map_err(|e| {
            McpClientError::ConnectionFailed(format!("invalid server URL '{}': {}", self.url, e))
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                McpClientError::ConnectionFailed(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                McpClientError::ConnectionFailed(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }

        reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| McpClientError::ConnectionFailed(format!("failed to build HTTP client: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn supports_multiplexing(&self) -> bool {
        false
    }

    async fn open(&self, dispatcher: Arc<Dispatcher>) -> McpResult<()> {
        self.state.begin_open()?;
        let client = match self.build_client() {
            Ok(client) => client,
            Err(e) => {
                self.state.set(ConnectionState::Closed);
                return Err(e);
            }
        };

        tracing::info!(server = %dispatcher.server(), "Using HTTP endpoint {}", self.url);
        // begin_open guarantees this is the only initialisation
        let _ = self.link.set(HttpLink { client, dispatcher });
        self.state.set(ConnectionState::Open);
        Ok(())
    }

    /// POST one frame and dispatch whatever comes back
    async fn send(&self, frame: String) -> McpResult<()> {
        self.state.ensure_open()?;
        let link = self.link.get().ok_or(McpClientError::NotConnected)?;

        tracing::debug!("Sending HTTP POST to {}: {}", self.url, frame);

        let mut request = link
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_BOTH)
            .body(frame);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| McpClientError::SendFailed {
            message: format!("POST {} failed: {}", self.url, e),
            status: None,
        })?;

        let status = response.status();
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *lock(&self.session_id) = Some(session.to_string());
        }

        if !status.is_success() {
            return Err(McpClientError::SendFailed {
                message: format!("HTTP request failed with status: {status}"),
                status: Some(status.as_u16()),
            });
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| McpClientError::ReceiveFailed(format!("failed to read HTTP response: {e}")))?;

        if is_event_stream {
            for data in sse_data_events(&body) {
                link.dispatcher.dispatch_frame(&data);
            }
        } else if !body.trim().is_empty() {
            link.dispatcher.dispatch_frame(&body);
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        if !self.state.begin_close() {
            return Ok(());
        }

        let session = lock(&self.session_id).take();
        if let (Some(session), Some(link)) = (session, self.link.get()) {
            // Best effort: servers may not support explicit session teardown
            match link
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, session)
                .send()
                .await
            {
                Ok(resp) => tracing::debug!("Session DELETE returned {}", resp.status()),
                Err(e) => tracing::debug!("Session DELETE failed: {}", e),
            }
        }

        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}

/// Extract the `data:` payload of every event in an SSE body
///
/// Multi-line data fields are joined with `\n`; events without data are skipped.
pub fn sse_data_events(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in body.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if !current.is_empty() {
                events.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }
    if !current.is_empty() {
        events.push(current.join("\n"));
    }
    events
}
