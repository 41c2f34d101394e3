//! Selection of a transport implementation for a descriptor

use std::sync::Arc;

use super::descriptor::{ServerDescriptor, TransportParams};
use super::error::McpResult;
use super::http_transport::HttpTransport;
use super::transport::{StdioTransport, Transport};
use super::ws_transport::WebSocketTransport;

/// Builds a fresh, unopened transport for a server
///
/// The reconnector asks for a new transport on every attempt, so
/// implementations must not hand out shared instances.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, descriptor: &ServerDescriptor) -> McpResult<Arc<dyn Transport>>;
}

/// Maps each transport kind to its built-in implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnectionFactory;

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(&self, descriptor: &ServerDescriptor) -> McpResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match &descriptor.transport {
            TransportParams::Http { url, headers } => Arc::new(
                HttpTransport::new(url.clone())
                    .with_headers(headers.clone())
                    .with_timeout(descriptor.request_timeout),
            ),
            TransportParams::WebSocket {
                url,
                headers,
                ping_interval,
                ping_timeout,
            } => Arc::new(
                WebSocketTransport::new(url.clone())
                    .with_headers(headers.clone())
                    .with_ping(*ping_interval, *ping_timeout),
            ),
            TransportParams::Stdio {
                command,
                args,
                cwd,
                env,
                multiplexed,
            } => {
                let mut transport = StdioTransport::new(command.clone(), args.clone())
                    .with_envs(env.clone())
                    .multiplexed(*multiplexed);
                if let Some(cwd) = cwd {
                    transport = transport.with_cwd(cwd.clone());
                }
                Arc::new(transport)
            }
        };
        Ok(transport)
    }
}
