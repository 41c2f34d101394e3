//! toolwire Library
//!
//! This library provides the core functionality for toolwire: an MCP client
//! that reaches tool servers over HTTP, WebSocket and stdio, plus the layers
//! that sit on top of it (multi-server management, the agent tool bridge and
//! agent loop, configuration, logging and metrics).

pub mod agent;
pub mod config;
pub mod logging;
pub mod mcp;
pub mod mcp_command;
pub mod metrics;
