//! Connection establishment with retry
//!
//! The [`Reconnector`] turns a [`ServerDescriptor`] into a ready [`Session`]:
//! it asks the factory for a fresh transport, opens it, runs the caller's
//! handshake, and retries the whole sequence under the descriptor's
//! [`RetryConfig`](super::retry::RetryConfig). Only establishment is retried.
//! Requests issued on a session that later faults are never replayed here.

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};

use super::codec::ProtocolCodec;
use super::descriptor::ServerDescriptor;
use super::dispatch::{Dispatcher, ServerEvent};
use super::error::{McpClientError, McpResult};
use super::factory::ConnectionFactory;
use super::pending::PendingRequestTable;
use super::retry::retry_with_backoff;
use super::session::Session;
use super::transport::Transport;
use crate::metrics;

/// Produces ready sessions for one server
pub struct Reconnector {
    descriptor: ServerDescriptor,
    factory: Arc<dyn ConnectionFactory>,
    events: broadcast::Sender<ServerEvent>,
    tools_changed: Arc<AtomicBool>,
}

impl Reconnector {
    pub fn new(
        descriptor: ServerDescriptor,
        factory: Arc<dyn ConnectionFactory>,
        events: broadcast::Sender<ServerEvent>,
        tools_changed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            descriptor,
            factory,
            events,
            tools_changed,
        }
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// Open a session and run `handshake` on it, retrying transient failures
    ///
    /// Each attempt gets a new transport, a new id counter and an empty
    /// pending table. The handshake's output is returned alongside the
    /// session once it succeeds. After the configured number of attempts the
    /// error is `ServerUnavailable`.
    pub async fn establish<H, Fut, T>(&self, handshake: H) -> McpResult<(Arc<Session>, T)>
    where
        H: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let handshake = &handshake;
        retry_with_backoff(&self.descriptor.retry, &self.descriptor.name, move |attempt| {
            self.attempt(attempt, handshake)
        })
        .await
    }

    async fn attempt<H, Fut, T>(&self, attempt: usize, handshake: &H) -> McpResult<(Arc<Session>, T)>
    where
        H: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let name = self.descriptor.name.as_str();
        metrics::MCP_CONNECT_ATTEMPTS_TOTAL
            .with_label_values(&[name])
            .inc();
        tracing::info!(
            server = %name,
            transport = %self.descriptor.kind(),
            target = %self.descriptor.transport.target(),
            attempt = attempt + 1,
            "Connecting to MCP server"
        );

        let transport = self.factory.create(&self.descriptor)?;
        let codec = Arc::new(ProtocolCodec::new());
        let pending = Arc::new(PendingRequestTable::new(name));
        let (replies, outbound) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(
            Dispatcher::new(
                name,
                Arc::clone(&codec),
                Arc::clone(&pending),
                self.events.clone(),
                Arc::clone(&self.tools_changed),
            )
            .with_replies(replies),
        );
        tokio::spawn(forward_replies(
            name.to_string(),
            Arc::downgrade(&transport),
            outbound,
        ));
        let session = Arc::new(Session::new(
            name,
            codec,
            pending,
            Arc::clone(&transport),
            self.descriptor.request_timeout,
        ));

        let setup = async {
            transport.open(dispatcher).await?;
            handshake(Arc::clone(&session)).await
        };

        let outcome = match tokio::time::timeout(self.descriptor.connect_timeout, setup).await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpClientError::ConnectionFailed(format!(
                "connect timed out after {:?}",
                self.descriptor.connect_timeout
            ))),
        };

        match outcome {
            Ok(value) => Ok((session, value)),
            Err(e) => {
                session.shutdown(e.clone()).await;
                Err(e)
            }
        }
    }
}

/// Send answers to server-initiated requests until the transport goes away
async fn forward_replies(
    server: String,
    transport: Weak<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = outbound.recv().await {
        let Some(transport) = transport.upgrade() else {
            break;
        };
        if let Err(e) = transport.send(frame).await {
            tracing::debug!(server = %server, error = %e, "Could not answer server request");
        }
    }
}
