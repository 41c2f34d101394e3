//! One live connection to a server
//!
//! A [`Session`] bundles an opened transport with the codec and pending table
//! that belong to it. Sessions are never reused: a reconnect builds a new one
//! with a fresh id counter and an empty table.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::codec::ProtocolCodec;
use super::error::{McpClientError, McpResult};
use super::pending::{PendingRequestTable, WaitHandle};
use super::protocol::{McpMethod, McpResponse};
use super::transport::{Transport, TransportKind};
use crate::metrics;

/// An opened connection plus its correlation state
pub struct Session {
    server: String,
    codec: Arc<ProtocolCodec>,
    pending: Arc<PendingRequestTable>,
    transport: Arc<dyn Transport>,
    /// Single permit when the transport cannot multiplex
    gate: Option<Arc<Semaphore>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.server)
            .field("transport", &self.transport.kind())
            .field("state", &self.transport.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Session {
    pub fn new(
        server: impl Into<String>,
        codec: Arc<ProtocolCodec>,
        pending: Arc<PendingRequestTable>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        let gate = if transport.supports_multiplexing() {
            None
        } else {
            Some(Arc::new(Semaphore::new(1)))
        };
        Self {
            server: server.into(),
            codec,
            pending,
            transport,
            gate,
            request_timeout,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn codec(&self) -> &ProtocolCodec {
        &self.codec
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Open transport and a table that has not been failed
    pub fn is_healthy(&self) -> bool {
        self.transport.is_connected() && !self.pending.is_closed()
    }

    /// Register and send a request without waiting for its response
    ///
    /// On a non-multiplexing transport the returned call holds the only send
    /// permit until it is resolved or dropped.
    pub async fn start_request(&self, method: &str, params: Option<Value>) -> McpResult<PendingCall> {
        let permit = match &self.gate {
            Some(gate) => Some(Arc::clone(gate).acquire_owned().await.map_err(|_| {
                McpClientError::ConnectionLost("session is shutting down".to_string())
            })?),
            None => None,
        };

        let (frame, id) = self.codec.encode_request(method, params)?;
        let handle = self
            .pending
            .register(id, Instant::now() + self.request_timeout)?;

        tracing::debug!(server = %self.server, id, method, "Sending request");
        if let Err(e) = self.transport.send(frame).await {
            metrics::MCP_REQUESTS_TOTAL
                .with_label_values(&[method, e.kind().as_str()])
                .inc();
            return Err(e);
        }

        Ok(PendingCall {
            method: method.to_string(),
            handle,
            _permit: permit,
        })
    }

    /// Send a request and wait for its result
    ///
    /// JSON-RPC errors come back as `ServerError`.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.start_request(method, params).await?.result().await
    }

    /// Send a notification (never answered)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let frame = self.codec.encode_notification(method, params)?;
        tracing::debug!(server = %self.server, method, "Sending notification");
        self.transport.send(frame).await
    }

    /// Cancel an in-flight request
    ///
    /// The waiter is unblocked with `Cancelled` immediately. The server is told
    /// on a best-effort basis; a response that still arrives is dropped.
    pub async fn cancel(&self, id: u64, reason: &str) -> bool {
        if !self.pending.cancel(id) {
            return false;
        }
        let params = json!({"requestId": id, "reason": reason});
        if let Err(e) = self.notify(McpMethod::Cancelled.as_str(), Some(params)).await {
            tracing::debug!(server = %self.server, id, error = %e, "Could not send cancellation");
        }
        true
    }

    /// Fail everything outstanding with `error` and release the transport
    pub async fn shutdown(&self, error: McpClientError) {
        let failed = self.pending.fail_all(error);
        if let Some(gate) = &self.gate {
            gate.close();
        }
        if failed > 0 {
            tracing::info!(server = %self.server, failed, "Failed pending requests on shutdown");
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(server = %self.server, error = %e, "Error closing transport");
        }
    }
}

/// A request that has been sent and is awaiting its response
#[derive(Debug)]
pub struct PendingCall {
    method: String,
    handle: WaitHandle,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Wait for the raw response
    pub async fn response(self) -> McpResult<McpResponse> {
        let method = self.method;
        let outcome = self.handle.wait().await;
        let status = match &outcome {
            Ok(resp) if resp.error.is_some() => "rpc_error",
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        metrics::MCP_REQUESTS_TOTAL
            .with_label_values(&[method.as_str(), status])
            .inc();
        outcome
    }

    /// Wait for the result, mapping a JSON-RPC error to `ServerError`
    pub async fn result(self) -> McpResult<Value> {
        self.response().await?.into_result().map_err(|e| McpClientError::ServerError {
            code: e.code,
            message: e.message,
            data: e.data,
        })
    }
}
