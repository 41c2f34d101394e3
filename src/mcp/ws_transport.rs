//! MCP WebSocket Transport Layer
//!
//! Persistent duplex transport. One background task owns the socket: it
//! drains the outbound queue, pushes every inbound text frame to the
//! dispatcher, answers server pings and probes liveness with its own pings.
//! A missing pong, a send error or the socket closing underneath us faults
//! the connection and fails every pending request with `ConnectionLost`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::dispatch::Dispatcher;
use super::error::{McpClientError, McpResult};
use super::transport::{lock, ConnectionState, StateCell, Transport, TransportKind};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Floor for both the ping interval and the pong timeout
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// WebSocket transport for remote MCP servers
pub struct WebSocketTransport {
    url: String,
    headers: HashMap<String, String>,
    ping_interval: Duration,
    ping_timeout: Duration,
    state: StateCell,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            state: StateCell::new(),
            outbound: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Liveness probe cadence and how long to wait for each pong
    ///
    /// Values below [`MIN_PING_INTERVAL`] are raised to it.
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval.max(MIN_PING_INTERVAL);
        self.ping_timeout = timeout.max(MIN_PING_INTERVAL);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> McpResult<Socket> {
        let mut request = self.url.as_str().into_client_request().map_err(|e| {
            McpClientError::ConnectionFailed(format!("invalid WebSocket URL '{}': {}", self.url, e))
        })?;
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                McpClientError::ConnectionFailed(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                McpClientError::ConnectionFailed(format!("invalid value for header '{name}': {e}"))
            })?;
            request.headers_mut().insert(header, value);
        }

        let (socket, response) = connect_async(request).await.map_err(|e| {
            McpClientError::ConnectionFailed(format!("WebSocket connect to {} failed: {}", self.url, e))
        })?;
        tracing::debug!("WebSocket handshake with {} returned {}", self.url, response.status());
        Ok(socket)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn supports_multiplexing(&self) -> bool {
        true
    }

    async fn open(&self, dispatcher: Arc<Dispatcher>) -> McpResult<()> {
        self.state.begin_open()?;
        tracing::info!(server = %dispatcher.server(), "Connecting to {}", self.url);

        let socket = match self.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                self.state.set(ConnectionState::Closed);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state.set(ConnectionState::Open);

        let pump = SocketPump {
            socket,
            outbound: rx,
            shutdown: shutdown_rx,
            dispatcher,
            state: self.state.clone(),
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
        };
        *lock(&self.outbound) = Some(tx);
        *lock(&self.shutdown) = Some(shutdown_tx);
        *lock(&self.task) = Some(tokio::spawn(pump.run()));
        Ok(())
    }

    async fn send(&self, frame: String) -> McpResult<()> {
        self.state.ensure_open()?;
        let sender = lock(&self.outbound)
            .clone()
            .ok_or(McpClientError::NotConnected)?;

        tracing::debug!("-> {}", frame);
        sender
            .send(frame)
            .await
            .map_err(|_| McpClientError::ConnectionLost("socket task has stopped".to_string()))
    }

    async fn close(&self) -> McpResult<()> {
        if !self.state.begin_close() {
            return Ok(());
        }

        if let Some(shutdown) = lock(&self.shutdown).take() {
            let _ = shutdown.send(true);
        }
        lock(&self.outbound).take();

        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                tracing::debug!("WebSocket task did not stop in time, aborting");
                task.abort();
            }
        }

        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// Socket owner running on its own task
struct SocketPump {
    socket: Socket,
    outbound: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
    dispatcher: Arc<Dispatcher>,
    state: StateCell,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl SocketPump {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut pong_deadline: Option<Instant> = None;

        let fault = loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = self.socket.close(None).await;
                        break None;
                    }
                }
                frame = self.outbound.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = self.socket.send(Message::Text(text)).await {
                            break Some(format!("send failed: {e}"));
                        }
                    }
                    None => {
                        let _ = self.socket.close(None).await;
                        break None;
                    }
                },
                _ = heartbeat.tick() => {
                    if pong_deadline.is_none() {
                        if let Err(e) = self.socket.send(Message::Ping(Vec::new())).await {
                            break Some(format!("ping failed: {e}"));
                        }
                        pong_deadline = Some(Instant::now() + self.ping_timeout);
                    }
                }
                _ = async {
                    match pong_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    break Some(format!("no pong within {:?}", self.ping_timeout));
                }
                incoming = self.socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatcher.dispatch_frame(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.dispatcher.dispatch_frame(text),
                        Err(_) => tracing::warn!(server = %self.dispatcher.server(), "Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = self.socket.send(Message::Pong(payload)).await {
                            break Some(format!("pong failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Close(frame))) => {
                        break Some(match frame {
                            Some(frame) => format!("server closed the socket: {} {}", frame.code, frame.reason),
                            None => "server closed the socket".to_string(),
                        });
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break Some(format!("socket error: {e}")),
                    None => break Some("socket stream ended".to_string()),
                },
            }
        };

        if let Some(reason) = fault {
            if self.state.fault() {
                self.dispatcher.fault(McpClientError::ConnectionLost(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_support::DispatchFixture;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_failed() {
        let (listener, url) = listener().await;
        drop(listener);

        let fx = DispatchFixture::new("refused");
        let transport = WebSocketTransport::new(url);
        let err = transport.open(fx.dispatcher()).await.unwrap_err();

        assert!(matches!(err, McpClientError::ConnectionFailed(_)));
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // Collect two requests, then answer in reverse order with an interleaved notification
            let mut ids = Vec::new();
            while ids.len() < 2 {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    ids.push(value["id"].as_u64().unwrap());
                }
            }
            for id in ids.into_iter().rev() {
                ws.send(Message::Text(
                    json!({"jsonrpc": "2.0", "method": "notifications/progress"}).to_string(),
                ))
                .await
                .unwrap();
                ws.send(Message::Text(
                    json!({"jsonrpc": "2.0", "id": id, "result": {"for": id}}).to_string(),
                ))
                .await
                .unwrap();
            }
            // Keep the socket open until the client closes it
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let fx = DispatchFixture::new("duplex");
        let transport = WebSocketTransport::new(url);
        transport.open(fx.dispatcher()).await.unwrap();

        // Advance the counter so the concurrent calls carry ids 7 and 8
        for _ in 0..6 {
            fx.codec.next_id();
        }
        let (frame7, id7) = fx.codec.encode_request("tools/call", Some(json!({"name": "a"}))).unwrap();
        let (frame8, id8) = fx.codec.encode_request("tools/call", Some(json!({"name": "b"}))).unwrap();
        assert_eq!((id7, id8), (7, 8));

        let seven = fx.pending.register(id7, deadline()).unwrap();
        let eight = fx.pending.register(id8, deadline()).unwrap();
        transport.send(frame7).await.unwrap();
        transport.send(frame8).await.unwrap();

        let (r7, r8) = tokio::join!(seven.wait(), eight.wait());
        assert_eq!(r7.unwrap().result, Some(json!({"for": 7})));
        assert_eq!(r8.unwrap().result, Some(json!({"for": 8})));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_pong_faults_connection() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            // Never read, so pings are never answered
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(ws);
        });

        let mut fx = DispatchFixture::new("silent");
        let transport = WebSocketTransport::new(url)
            .with_ping(Duration::from_millis(50), Duration::from_millis(100));
        transport.open(fx.dispatcher()).await.unwrap();

        let waiting = fx.pending.register(1, deadline()).unwrap();
        let err = waiting.wait().await.unwrap_err();

        assert!(matches!(err, McpClientError::ConnectionLost(ref reason) if reason.contains("pong")), "got {err:?}");
        assert_eq!(transport.state(), ConnectionState::Faulted);
        assert!(fx.next_event().await.is_some());

        transport.close().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_zero_ping_settings_are_raised_to_floor() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        ws.send(Message::Text(
                            json!({"jsonrpc": "2.0", "id": value["id"], "result": {}}).to_string(),
                        ))
                        .await
                        .unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        let fx = DispatchFixture::new("eager");
        let transport = WebSocketTransport::new(url).with_ping(Duration::ZERO, Duration::ZERO);
        assert_eq!(transport.ping_interval, MIN_PING_INTERVAL);
        assert_eq!(transport.ping_timeout, MIN_PING_INTERVAL);
        transport.open(fx.dispatcher()).await.unwrap();

        // Several heartbeats pass and the socket keeps working
        tokio::time::sleep(MIN_PING_INTERVAL * 3).await;
        let (frame, id) = fx.codec.encode_request("ping", None).unwrap();
        let waiting = fx.pending.register(id, deadline()).unwrap();
        transport.send(frame).await.unwrap();

        assert_eq!(waiting.wait().await.unwrap().result, Some(json!({})));
        assert_eq!(transport.state(), ConnectionState::Open);

        transport.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_close_faults_connection() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let fx = DispatchFixture::new("closing");
        let transport = WebSocketTransport::new(url);
        transport.open(fx.dispatcher()).await.unwrap();

        let (frame, id) = fx.codec.encode_request("ping", None).unwrap();
        let waiting = fx.pending.register(id, deadline()).unwrap();
        transport.send(frame).await.unwrap();

        assert!(matches!(
            waiting.wait().await.unwrap_err(),
            McpClientError::ConnectionLost(_)
        ));
        transport.close().await.unwrap();
    }
}
