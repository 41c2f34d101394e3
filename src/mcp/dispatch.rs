//! Single inbound dispatch point for a connection
//!
//! Transports hand every inbound text frame to [`Dispatcher::dispatch_frame`].
//! Responses are matched against the pending table by id; notifications and
//! server-initiated requests go out on the observer channel and never touch
//! the table. Server requests are also answered when a reply channel is
//! attached: `ping` with an empty result, anything else with method-not-found.
//! A malformed frame is logged and dropped without faulting the connection.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::codec::ProtocolCodec;
use super::error::McpClientError;
use super::pending::PendingRequestTable;
use super::protocol::{McpMessage, McpMethod, McpNotification, McpRequest, McpResponse, RpcError};
use crate::metrics;

/// Something the server said that nobody asked for
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Notification {
        server: String,
        notification: McpNotification,
    },
    /// Server-initiated request (e.g. sampling)
    Request { server: String, request: McpRequest },
    /// The connection faulted; pending calls have already been failed
    ConnectionLost { server: String, reason: String },
}

/// Routes decoded frames to waiters and observers
pub struct Dispatcher {
    server: String,
    codec: Arc<ProtocolCodec>,
    pending: Arc<PendingRequestTable>,
    events: broadcast::Sender<ServerEvent>,
    tools_changed: Arc<AtomicBool>,
    /// Outbound frames answering server requests
    replies: Option<mpsc::UnboundedSender<String>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        server: impl Into<String>,
        codec: Arc<ProtocolCodec>,
        pending: Arc<PendingRequestTable>,
        events: broadcast::Sender<ServerEvent>,
        tools_changed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            server: server.into(),
            codec,
            pending,
            events,
            tools_changed,
            replies: None,
        }
    }

    /// Answer server-initiated requests by pushing response frames into `replies`
    pub fn with_replies(mut self, replies: mpsc::UnboundedSender<String>) -> Self {
        self.replies = Some(replies);
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    /// Handle one inbound frame (a single message or a JSON-RPC batch)
    pub fn dispatch_frame(&self, frame: &str) {
        let frame = frame.trim();
        if frame.is_empty() {
            return;
        }
        tracing::debug!(server = %self.server, "<- {}", frame);

        let value: Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match value {
            Value::Array(batch) if batch.is_empty() => {
                tracing::warn!(server = %self.server, "Dropping empty batch");
            }
            Value::Array(batch) => batch.into_iter().for_each(|item| self.dispatch_value(item)),
            single => self.dispatch_value(single),
        }
    }

    fn dispatch_value(&self, value: Value) {
        // Keep the id so a response that fails validation can still fail its waiter
        let response_id = if value.get("method").is_none() {
            value.get("id").and_then(Value::as_u64)
        } else {
            None
        };

        match self.codec.decode_value(value) {
            Ok(McpMessage::Response(response)) => {
                self.pending.resolve(response.id, response);
            }
            Ok(McpMessage::Notification(notification)) => self.on_notification(notification),
            Ok(McpMessage::Request(request)) => self.on_request(request),
            Err(err) => match response_id {
                Some(id) if self.pending.contains(id) => {
                    tracing::warn!(server = %self.server, id, error = %err, "Rejecting invalid response");
                    self.pending.fail(id, err);
                }
                _ => {
                    tracing::warn!(server = %self.server, error = %err, "Dropping undecodable message");
                }
            },
        }
    }

    fn on_request(&self, request: McpRequest) {
        tracing::debug!(server = %self.server, id = request.id, method = %request.method, "Server-initiated request");
        if let Some(replies) = &self.replies {
            let response = match McpMethod::from(request.method.as_str()) {
                McpMethod::Ping => McpResponse::ok(request.id, serde_json::json!({})),
                _ => McpResponse::err(request.id, RpcError::method_not_found(&request.method)),
            };
            match serde_json::to_string(&response) {
                Ok(frame) => {
                    if replies.send(frame).is_err() {
                        tracing::debug!(server = %self.server, id = request.id, "Reply channel closed");
                    }
                }
                Err(e) => tracing::warn!(server = %self.server, error = %e, "Could not encode reply"),
            }
        }
        let _ = self.events.send(ServerEvent::Request {
            server: self.server.clone(),
            request,
        });
    }

    fn on_notification(&self, notification: McpNotification) {
        if McpMethod::from(notification.method.as_str()) == McpMethod::ToolsListChanged {
            tracing::info!(server = %self.server, "Server tool list changed");
            self.tools_changed.store(true, Ordering::SeqCst);
        }
        let _ = self.events.send(ServerEvent::Notification {
            server: self.server.clone(),
            notification,
        });
    }

    /// Record a transport fault: fail every waiter and tell observers
    pub fn fault(&self, error: McpClientError) {
        let failed = self.pending.fail_all(error.clone());
        tracing::warn!(server = %self.server, failed, %error, "Connection faulted");
        metrics::MCP_CONNECTION_FAULTS_TOTAL
            .with_label_values(&[self.server.as_str()])
            .inc();
        let _ = self.events.send(ServerEvent::ConnectionLost {
            server: self.server.clone(),
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Fixture {
        dispatcher: Dispatcher,
        pending: Arc<PendingRequestTable>,
        events: broadcast::Receiver<ServerEvent>,
        tools_changed: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let codec = Arc::new(ProtocolCodec::new());
        let pending = Arc::new(PendingRequestTable::new("fixture"));
        let (tx, rx) = broadcast::channel(16);
        let tools_changed = Arc::new(AtomicBool::new(false));
        Fixture {
            dispatcher: Dispatcher::new(
                "fixture",
                codec,
                Arc::clone(&pending),
                tx,
                Arc::clone(&tools_changed),
            ),
            pending,
            events: rx,
            tools_changed,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_responses_routed_by_id_not_order() {
        let fx = fixture();
        let seven = fx.pending.register(7, deadline()).unwrap();
        let eight = fx.pending.register(8, deadline()).unwrap();

        fx.dispatcher
            .dispatch_frame(r#"{"jsonrpc":"2.0","id":8,"result":{"n":8}}"#);
        fx.dispatcher
            .dispatch_frame(r#"{"jsonrpc":"2.0","id":7,"result":{"n":7}}"#);

        assert_eq!(seven.wait().await.unwrap().result, Some(json!({"n": 7})));
        assert_eq!(eight.wait().await.unwrap().result, Some(json!({"n": 8})));
    }

    #[tokio::test]
    async fn test_notification_goes_to_observers_only() {
        let mut fx = fixture();
        let _waiting = fx.pending.register(1, deadline()).unwrap();

        fx.dispatcher.dispatch_frame(
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#,
        );

        match fx.events.try_recv().unwrap() {
            ServerEvent::Notification { notification, .. } => {
                assert_eq!(notification.method, "notifications/message")
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(fx.pending.contains(1));
    }

    #[tokio::test]
    async fn test_list_changed_sets_flag() {
        let fx = fixture();
        fx.dispatcher
            .dispatch_frame(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#);
        assert!(fx.tools_changed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_batch_frames_dispatched() {
        let mut fx = fixture();
        let one = fx.pending.register(1, deadline()).unwrap();

        fx.dispatcher.dispatch_frame(
            r#"[{"jsonrpc":"2.0","method":"notifications/progress"},{"jsonrpc":"2.0","id":1,"result":"done"}]"#,
        );

        assert_eq!(one.wait().await.unwrap().result, Some(json!("done")));
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            ServerEvent::Notification { .. }
        ));
    }

    #[tokio::test]
    async fn test_server_requests_answered_and_surfaced() {
        let mut fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            "fixture",
            Arc::new(ProtocolCodec::new()),
            Arc::clone(&fx.pending),
            fx.dispatcher.events.clone(),
            Arc::clone(&fx.tools_changed),
        )
        .with_replies(tx);

        dispatcher.dispatch_frame(r#"{"jsonrpc":"2.0","id":41,"method":"ping"}"#);
        dispatcher.dispatch_frame(
            r#"{"jsonrpc":"2.0","id":42,"method":"sampling/createMessage","params":{}}"#,
        );

        let pong: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(pong, json!({"jsonrpc": "2.0", "id": 41, "result": {}}));
        let refusal: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(refusal["id"], 42);
        assert_eq!(refusal["error"]["code"], -32601);
        assert!(refusal.get("result").is_none());

        for expected in ["ping", "sampling/createMessage"] {
            match fx.events.try_recv().unwrap() {
                ServerEvent::Request { request, .. } => assert_eq!(request.method, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(fx.pending.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_dropped_without_fault() {
        let mut fx = fixture();
        let waiting = fx.pending.register(3, deadline()).unwrap();

        fx.dispatcher.dispatch_frame("{{ not json");
        fx.dispatcher.dispatch_frame("[]");
        fx.dispatcher.dispatch_frame(r#"{"jsonrpc":"2.0"}"#);
        fx.dispatcher.dispatch_frame("   ");

        assert!(fx.pending.contains(3));
        assert!(!fx.pending.is_closed());
        assert!(fx.events.try_recv().is_err());
        drop(waiting);
    }

    #[tokio::test]
    async fn test_invalid_response_fails_its_waiter() {
        let fx = fixture();
        let waiting = fx.pending.register(4, deadline()).unwrap();

        fx.dispatcher.dispatch_frame(
            r#"{"jsonrpc":"2.0","id":4,"result":{},"error":{"code":1,"message":"x"}}"#,
        );

        assert!(matches!(
            waiting.wait().await.unwrap_err(),
            McpClientError::MalformedMessage(_)
        ));
    }

    #[tokio::test]
    async fn test_fault_fails_pending_and_emits_event() {
        let mut fx = fixture();
        let a = fx.pending.register(1, deadline()).unwrap();
        let b = fx.pending.register(2, deadline()).unwrap();

        fx.dispatcher
            .fault(McpClientError::ConnectionLost("socket closed".into()));

        for handle in [a, b] {
            assert!(matches!(
                handle.wait().await.unwrap_err(),
                McpClientError::ConnectionLost(_)
            ));
        }
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            ServerEvent::ConnectionLost { .. }
        ));
    }
}
