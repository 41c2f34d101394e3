//! Typed, validated description of one MCP server
//!
//! A [`ServerDescriptor`] is everything the core needs to reach a server. It
//! is built by the caller (usually from [`crate::config`]) and treated as
//! immutable afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::retry::RetryConfig;
use super::transport::TransportKind;
use super::ws_transport::{DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT, MIN_PING_INTERVAL};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport-specific connection parameters
#[derive(Debug, Clone, PartialEq)]
pub enum TransportParams {
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    WebSocket {
        url: String,
        headers: HashMap<String, String>,
        ping_interval: Duration,
        ping_timeout: Duration,
    },
    Stdio {
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
        /// Allow concurrent requests over the pipe
        multiplexed: bool,
    },
}

impl TransportParams {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Http { .. } => TransportKind::Http,
            Self::WebSocket { .. } => TransportKind::WebSocket,
            Self::Stdio { .. } => TransportKind::Stdio,
        }
    }

    /// URL or command line, for display
    pub fn target(&self) -> String {
        match self {
            Self::Http { url, .. } | Self::WebSocket { url, .. } => url.clone(),
            Self::Stdio { command, args, .. } if args.is_empty() => command.clone(),
            Self::Stdio { command, args, .. } => format!("{} {}", command, args.join(" ")),
        }
    }
}

/// Connection descriptor for one named server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    /// Unique key
    pub name: String,
    pub transport: TransportParams,
    /// Policy for connection establishment only
    pub retry: RetryConfig,
    /// Bound on open + handshake for a single attempt (also the spawn timeout)
    pub connect_timeout: Duration,
    /// Deadline applied to every request
    pub request_timeout: Duration,
    pub description: Option<String>,
}

impl ServerDescriptor {
    pub fn new(name: impl Into<String>, transport: TransportParams) -> Self {
        Self {
            name: name.into(),
            transport,
            retry: RetryConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            description: None,
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportParams::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    pub fn websocket(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportParams::WebSocket {
                url: url.into(),
                headers: HashMap::new(),
                ping_interval: DEFAULT_PING_INTERVAL,
                ping_timeout: DEFAULT_PING_TIMEOUT,
            },
        )
    }

    pub fn stdio<I, S>(name: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            TransportParams::Stdio {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                cwd: None,
                env: HashMap::new(),
                multiplexed: true,
            },
        )
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Add a header (HTTP and WebSocket only; ignored for stdio)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.transport {
            TransportParams::Http { headers, .. } | TransportParams::WebSocket { headers, .. } => {
                headers.insert(name.into(), value.into());
            }
            TransportParams::Stdio { .. } => {}
        }
        self
    }

    /// Add an environment variable for a spawned server (stdio only)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportParams::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Working directory for a spawned server (stdio only)
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if let TransportParams::Stdio { cwd, .. } = &mut self.transport {
            *cwd = Some(dir.into());
        }
        self
    }

    /// Serialize requests over a pipe whose server cannot interleave (stdio only)
    pub fn multiplexed(mut self, enabled: bool) -> Self {
        if let TransportParams::Stdio { multiplexed, .. } = &mut self.transport {
            *multiplexed = enabled;
        }
        self
    }

    /// Liveness probing for WebSocket servers, floored at [`MIN_PING_INTERVAL`]
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        if let TransportParams::WebSocket {
            ping_interval,
            ping_timeout,
            ..
        } = &mut self.transport
        {
            *ping_interval = interval.max(MIN_PING_INTERVAL);
            *ping_timeout = timeout.max(MIN_PING_INTERVAL);
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
