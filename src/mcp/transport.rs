//! MCP Transport Layer
//!
//! This module defines the connection abstraction shared by every transport
//! and the stdio (child-process pipe) implementation.
//!
//! - **stdio**: newline-delimited JSON over a spawned server's stdin/stdout
//! - **HTTP**: see [`super::http_transport`]
//! - **WebSocket**: see [`super::ws_transport`]
//!
//! # Architecture
//!
//! Transports only move text frames. Outbound frames arrive already encoded;
//! inbound frames are handed to the connection's [`Dispatcher`], which owns
//! correlation. Transports that can receive unsolicited traffic (stdio and
//! WebSocket) run a reader task that pushes frames as they arrive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::dispatch::Dispatcher;
use super::error::{McpClientError, McpResult};

/// How long a stdio server gets to exit on its own after stdin closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Outbound frames buffered ahead of the writer task
const OUTBOUND_QUEUE: usize = 64;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport variant selected for a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Request/response over HTTP POST
    Http,
    /// Persistent full-duplex WebSocket
    #[serde(alias = "ws")]
    WebSocket,
    /// Child process speaking over stdin/stdout
    Stdio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::Stdio => "stdio",
        })
    }
}

/// Connection lifecycle
///
/// `Unconnected → Connecting → Open → Closing → Closed`, with `Faulted`
/// reachable only from `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Faulted,
}

/// Shared, cloneable connection state
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<Mutex<ConnectionState>>);

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        *lock(&self.0)
    }

    pub fn set(&self, state: ConnectionState) {
        *lock(&self.0) = state;
    }

    /// `Unconnected → Connecting`; a transport is opened at most once
    pub fn begin_open(&self) -> McpResult<()> {
        let mut state = lock(&self.0);
        match *state {
            ConnectionState::Unconnected => {
                *state = ConnectionState::Connecting;
                Ok(())
            }
            other => Err(McpClientError::ConnectionFailed(format!(
                "transport cannot be opened from state {other:?}"
            ))),
        }
    }

    /// `Open → Faulted`; returns whether this call made the transition
    pub fn fault(&self) -> bool {
        let mut state = lock(&self.0);
        if *state == ConnectionState::Open {
            *state = ConnectionState::Faulted;
            true
        } else {
            false
        }
    }

    /// Enter `Closing`; returns `false` if a close already ran
    pub fn begin_close(&self) -> bool {
        let mut state = lock(&self.0);
        match *state {
            ConnectionState::Closing | ConnectionState::Closed => false,
            _ => {
                *state = ConnectionState::Closing;
                true
            }
        }
    }

    /// Error describing why a frame cannot be sent right now
    pub fn ensure_open(&self) -> McpResult<()> {
        match self.get() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Unconnected | ConnectionState::Connecting => {
                Err(McpClientError::NotConnected)
            }
            ConnectionState::Faulted => Err(McpClientError::ConnectionLost(
                "connection has faulted".to_string(),
            )),
            ConnectionState::Closing | ConnectionState::Closed => Err(
                McpClientError::ConnectionLost("connection is closed".to_string()),
            ),
        }
    }
}

/// Uniform connection capability implemented by every transport
///
/// `open` wires the transport to the dispatcher that receives every inbound
/// frame. `close` is idempotent and always releases the underlying resource,
/// including after a fault.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> ConnectionState;

    /// Check if the transport is open
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether more than one request may be in flight at a time
    fn supports_multiplexing(&self) -> bool;

    /// Establish the connection (fails with `ConnectionFailed`)
    async fn open(&self, dispatcher: Arc<Dispatcher>) -> McpResult<()>;

    /// Send one encoded frame (fails with `SendFailed` or `ConnectionLost`)
    async fn send(&self, frame: String) -> McpResult<()>;

    /// Release the connection
    async fn close(&self) -> McpResult<()>;
}

struct StdioRuntime {
    child: Child,
    tasks: Vec<JoinHandle<()>>,
}

/// stdio transport for local MCP servers
///
/// Spawns the server as a child process and exchanges one JSON message per
/// line over its stdin/stdout. Stderr lines are forwarded to the log.
///
/// # Example
///
/// ```ignore
/// let transport = StdioTransport::new("npx", ["-y", "@modelcontextprotocol/server-everything"])
///     .with_env("DEBUG", "1");
/// transport.open(dispatcher).await?;
/// ```
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    multiplexed: bool,
    state: StateCell,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    runtime: Mutex<Option<StdioRuntime>>,
}

impl StdioTransport {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: HashMap::new(),
            multiplexed: true,
            state: StateCell::new(),
            outbound: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Allow concurrent requests (the default) or serialize them
    pub fn multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    /// Get the server command string (for diagnostics)
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// OS process id of the running server
    pub fn pid(&self) -> Option<u32> {
        lock(&self.runtime).as_ref().and_then(|rt| rt.child.id())
    }

    fn spawn_child(&self) -> McpResult<Child> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        command.spawn().map_err(|e| {
            McpClientError::ConnectionFailed(format!(
                "failed to spawn '{}': {}",
                self.command_line(),
                e
            ))
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn supports_multiplexing(&self) -> bool {
        self.multiplexed
    }

    async fn open(&self, dispatcher: Arc<Dispatcher>) -> McpResult<()> {
        self.state.begin_open()?;
        tracing::info!(server = %dispatcher.server(), "Spawning MCP server: {}", self.command_line());

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                self.state.set(ConnectionState::Closed);
                return Err(e);
            }
        };

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            self.state.set(ConnectionState::Closed);
            return Err(McpClientError::ConnectionFailed(
                "child process has no stdio pipes".to_string(),
            ));
        };
        let stderr = child.stderr.take();

        // Open before the reader starts so an immediate exit still registers as a fault
        self.state.set(ConnectionState::Open);
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let mut tasks = Vec::with_capacity(3);

        // Writer: the only owner of stdin; dropping it closes the pipe
        let writer_state = self.state.clone();
        let writer_dispatch = Arc::clone(&dispatcher);
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let written = async {
                    stdin.write_all(frame.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    if writer_state.fault() {
                        writer_dispatch.fault(McpClientError::ConnectionLost(format!(
                            "failed to write to server stdin: {e}"
                        )));
                    }
                    break;
                }
            }
        }));

        let reader_state = self.state.clone();
        let reader_dispatch = Arc::clone(&dispatcher);
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader_dispatch.dispatch_frame(&line),
                    Ok(None) => break "server process closed stdout".to_string(),
                    Err(e) => break format!("failed to read server stdout: {e}"),
                }
            };
            if reader_state.fault() {
                reader_dispatch.fault(McpClientError::ConnectionLost(reason));
            }
        }));

        if let Some(stderr) = stderr {
            let server = dispatcher.server().to_string();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {}", line);
                }
            }));
        }

        *lock(&self.outbound) = Some(tx);
        *lock(&self.runtime) = Some(StdioRuntime { child, tasks });
        Ok(())
    }

    async fn send(&self, frame: String) -> McpResult<()> {
        self.state.ensure_open()?;
        let sender = lock(&self.outbound)
            .clone()
            .ok_or(McpClientError::NotConnected)?;

        tracing::debug!("-> {}", frame);
        sender.send(frame).await.map_err(|_| {
            McpClientError::ConnectionLost("server stdin writer has stopped".to_string())
        })
    }

    async fn close(&self) -> McpResult<()> {
        if !self.state.begin_close() {
            return Ok(());
        }

        // Closing stdin asks a well-behaved server to exit
        lock(&self.outbound).take();
        let runtime = lock(&self.runtime).take();

        if let Some(StdioRuntime { mut child, tasks }) = runtime {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!("MCP server '{}' exited: {}", self.command, status)
                }
                Ok(Err(e)) => tracing::warn!("Failed to wait for MCP server '{}': {}", self.command, e),
                Err(_) => {
                    tracing::info!("Killing MCP server: {}", self.command_line());
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill MCP server '{}': {}", self.command, e);
                    }
                }
            }
            for task in tasks {
                task.abort();
            }
        }

        self.state.set(ConnectionState::Closed);
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(runtime) = lock(&self.runtime).as_mut() {
            tracing::debug!("Dropping StdioTransport, killing MCP server");
            // Can't await in Drop, so just start the kill
            let _ = runtime.child.start_kill();
            for task in &runtime.tasks {
                task.abort();
            }
        }
    }
}
