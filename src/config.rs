// Configuration File Support
//
// This module provides configuration file parsing for toolwire.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/toolwire/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mcp::{RetryConfig, ServerDescriptor, TransportKind, TransportParams};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Server used when a command does not name one
    pub default_server: Option<String>,

    /// MCP server configurations
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Log file path (if log_to_file is true)
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            log_to_file: false,
            log_file: None,
        }
    }
}

/// MCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct McpServerConfig {
    /// Transport type (stdio, http, websocket)
    pub transport: TransportKind,

    /// Endpoint (http and websocket)
    pub url: Option<String>,

    /// Extra request headers, e.g. credentials (http and websocket)
    pub headers: HashMap<String, String>,

    /// Command to spawn the MCP server, e.g. "npx" (stdio)
    pub command: Option<String>,

    /// Arguments for the MCP server (stdio)
    pub args: Vec<String>,

    /// Working directory for the spawned server (stdio)
    pub cwd: Option<PathBuf>,

    /// Extra environment for the spawned server (stdio)
    pub env: HashMap<String, String>,

    /// Timeout in seconds for MCP requests
    pub timeout_secs: u64,

    /// Timeout in seconds for open + handshake, including process spawn
    pub connect_timeout_secs: u64,

    /// Connection attempts before giving up
    pub max_attempts: usize,

    /// First backoff delay in milliseconds
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds
    pub backoff_max_ms: u64,

    /// Liveness ping interval (websocket)
    pub ping_interval_secs: u64,

    /// How long to wait for a pong (websocket)
    pub ping_timeout_secs: u64,

    /// Allow concurrent requests over the pipe (stdio)
    pub multiplexed: bool,

    /// Free-form description shown by `toolwire servers`
    pub description: Option<String>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            url: None,
            headers: HashMap::new(),
            command: None,
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout_secs: 60,
            connect_timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5000,
            ping_interval_secs: 20,
            ping_timeout_secs: 10,
            multiplexed: true,
            description: None,
        }
    }
}

impl McpServerConfig {
    /// Build the typed descriptor consumed by the MCP core
    ///
    /// # Errors
    ///
    /// Returns an error if the transport's address or command is missing or
    /// a timeout is zero.
    pub fn to_descriptor(&self, name: &str) -> Result<ServerDescriptor> {
        if self.timeout_secs == 0 {
            anyhow::bail!("MCP server '{}' has timeout_secs = 0", name);
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("MCP server '{}' has connect_timeout_secs = 0", name);
        }

        let transport = match self.transport {
            TransportKind::Http => TransportParams::Http {
                url: self.require_url(name)?,
                headers: self.headers.clone(),
            },
            TransportKind::WebSocket => {
                if self.ping_interval_secs == 0 || self.ping_timeout_secs == 0 {
                    anyhow::bail!("MCP server '{}' has a zero ping interval or timeout", name);
                }
                TransportParams::WebSocket {
                    url: self.require_url(name)?,
                    headers: self.headers.clone(),
                    ping_interval: Duration::from_secs(self.ping_interval_secs),
                    ping_timeout: Duration::from_secs(self.ping_timeout_secs),
                }
            }
            TransportKind::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .with_context(|| format!("MCP server '{}' has empty command", name))?;
                TransportParams::Stdio {
                    command: command.to_string(),
                    args: self.args.clone(),
                    cwd: self.cwd.clone(),
                    env: self.env.clone(),
                    multiplexed: self.multiplexed,
                }
            }
        };

        let retry = RetryConfig::new()
            .max_attempts(self.max_attempts.max(1))
            .base_delay(Duration::from_millis(self.backoff_base_ms))
            .max_delay(Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)));

        let mut descriptor = ServerDescriptor::new(name, transport)
            .with_retry(retry)
            .with_request_timeout(Duration::from_secs(self.timeout_secs))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        if let Some(description) = &self.description {
            descriptor = descriptor.with_description(description.clone());
        }
        Ok(descriptor)
    }

    fn require_url(&self, name: &str) -> Result<String> {
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .with_context(|| {
                format!(
                    "MCP server '{}' uses {} transport but has no URL configured",
                    name, self.transport
                )
            })?;

        let expected: &[&str] = match self.transport {
            TransportKind::WebSocket => &["ws://", "wss://"],
            _ => &["http://", "https://"],
        };
        if !expected.iter().any(|scheme| url.starts_with(scheme)) {
            anyhow::bail!(
                "MCP server '{}' URL must start with {}: {}",
                name,
                expected.join(" or "),
                url
            );
        }
        Ok(url.to_string())
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the config file does not exist, returns default
    /// configuration (with environment overrides applied).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            let config = Self::default().apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/toolwire/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "toolwire", "toolwire") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("toolwire")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - TOOLWIRE_LOG_LEVEL
    /// - TOOLWIRE_LOG_FORMAT
    /// - TOOLWIRE_DEFAULT_SERVER
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("TOOLWIRE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TOOLWIRE_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(server) = std::env::var("TOOLWIRE_DEFAULT_SERVER") {
            if !server.is_empty() {
                self.default_server = Some(server);
            }
        }
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.logging.log_to_file && self.logging.log_file.is_none() {
            anyhow::bail!("log_to_file is set but no log_file is configured");
        }

        // Validate MCP server configurations
        for (name, server) in &self.mcp_servers {
            server.to_descriptor(name)?;
        }

        if let Some(default) = &self.default_server {
            if !self.mcp_servers.contains_key(default) {
                anyhow::bail!("Default server '{}' is not configured", default);
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Descriptor for one named server
    pub fn server(&self, name: &str) -> Result<ServerDescriptor> {
        self.mcp_servers
            .get(name)
            .with_context(|| format!("MCP server '{}' is not configured", name))?
            .to_descriptor(name)
    }

    /// The named server, or the default server when no name is given
    pub fn resolve_server(&self, name: Option<&str>) -> Result<ServerDescriptor> {
        match name.or(self.default_server.as_deref()) {
            Some(name) => self.server(name),
            None => anyhow::bail!("No server named and no default_server configured"),
        }
    }

    /// Descriptors for every configured server, sorted by name
    pub fn descriptors(&self) -> Result<Vec<ServerDescriptor>> {
        let mut names: Vec<_> = self.mcp_servers.keys().collect();
        names.sort();
        names.into_iter().map(|name| self.server(name)).collect()
    }
}
