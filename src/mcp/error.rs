//! Client error taxonomy
//!
//! Every operation in the MCP core reports failures as an [`McpClientError`].
//! The variants are plain data (no boxed sources) so a single fault can be
//! cloned and delivered to every waiter on a connection.

use serde_json::Value;
use thiserror::Error;

use super::retry::should_retry_status;

/// Result alias used throughout the MCP core
pub type McpResult<T> = std::result::Result<T, McpClientError>;

/// Errors surfaced by the MCP client core
#[derive(Debug, Clone, PartialEq, Error)]
pub enum McpClientError {
    /// The transport could not be opened (spawn failure, refused connection, bad URL)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An open connection faulted (socket dropped, child exited, ping timeout)
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The initialize exchange was rejected or negotiated an unsupported version
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// An operation was attempted before `connect()`
    #[error("Client is not connected")]
    NotConnected,

    /// The outbound write failed
    #[error("Send failed: {message}")]
    SendFailed {
        message: String,
        /// HTTP status, when the request channel got one back
        status: Option<u16>,
    },

    /// The inbound read failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// No response arrived before the request deadline
    #[error("Request {0} timed out")]
    Timeout(u64),

    /// The caller cancelled the request
    #[error("Request {0} was cancelled")]
    Cancelled(u64),

    /// Inbound bytes could not be decoded into a protocol message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A message declared a version incompatible with the negotiated one
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: String, actual: String },

    /// The reconnector exhausted its attempts
    #[error("Server '{server}' unavailable after {attempts} attempt(s): {last_error}")]
    ServerUnavailable {
        server: String,
        attempts: usize,
        last_error: String,
    },

    /// The server does not expose the requested tool
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The tool ran and reported a failure
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecutionError {
        tool: String,
        message: String,
        data: Option<Value>,
    },

    /// JSON-RPC error returned for a non-tool method
    #[error("Server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The client was disconnected while the request was outstanding
    #[error("Client disconnected")]
    ClientDisconnected,

    /// No server with this name is configured
    #[error("Unknown server: {0}")]
    UnknownServer(String),
}

/// Stable, renderer-facing identifier of an error's kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    ConnectionLost,
    HandshakeFailed,
    NotConnected,
    SendFailed,
    ReceiveFailed,
    Timeout,
    Cancelled,
    MalformedMessage,
    ProtocolVersionMismatch,
    ServerUnavailable,
    ToolNotFound,
    ToolExecutionError,
    ServerError,
    ClientDisconnected,
    UnknownServer,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::ConnectionLost => "connection_lost",
            Self::HandshakeFailed => "handshake_failed",
            Self::NotConnected => "not_connected",
            Self::SendFailed => "send_failed",
            Self::ReceiveFailed => "receive_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::MalformedMessage => "malformed_message",
            Self::ProtocolVersionMismatch => "protocol_version_mismatch",
            Self::ServerUnavailable => "server_unavailable",
            Self::ToolNotFound => "tool_not_found",
            Self::ToolExecutionError => "tool_execution_error",
            Self::ServerError => "server_error",
            Self::ClientDisconnected => "client_disconnected",
            Self::UnknownServer => "unknown_server",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl McpClientError {
    /// Kind of this error, for structured rendering and metrics labels
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::SendFailed { .. } => ErrorKind::SendFailed,
            Self::ReceiveFailed(_) => ErrorKind::ReceiveFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Self::ProtocolVersionMismatch { .. } => ErrorKind::ProtocolVersionMismatch,
            Self::ServerUnavailable { .. } => ErrorKind::ServerUnavailable,
            Self::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Self::ToolExecutionError { .. } => ErrorKind::ToolExecutionError,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::ClientDisconnected => ErrorKind::ClientDisconnected,
            Self::UnknownServer(_) => ErrorKind::UnknownServer,
        }
    }

    /// Whether connection establishment may be retried after this error
    ///
    /// Only transport-level failures qualify. Rejections from the server
    /// (handshake refusal, tool errors, non-retryable HTTP statuses) do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionLost(_)
            | Self::Timeout(_)
            | Self::ReceiveFailed(_) => true,
            Self::SendFailed { status, .. } => status.map_or(true, should_retry_status),
            _ => false,
        }
    }
}
