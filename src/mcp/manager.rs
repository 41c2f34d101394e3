//! Multi-server management
//!
//! [`McpServerManager`] owns one [`McpClient`] per configured server. Clients
//! are independent: connecting, faulting or disconnecting one never touches
//! another.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::client::McpClient;
use super::descriptor::ServerDescriptor;
use super::error::{McpClientError, McpResult};
use super::factory::{ConnectionFactory, DefaultConnectionFactory};
use super::protocol::InitializeResult;

/// Registry of named servers and their live clients
pub struct McpServerManager {
    descriptors: HashMap<String, ServerDescriptor>,
    factory: Arc<dyn ConnectionFactory>,
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
}

impl McpServerManager {
    pub fn new(descriptors: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        Self::with_factory(descriptors, Arc::new(DefaultConnectionFactory))
    }

    pub fn with_factory(
        descriptors: impl IntoIterator<Item = ServerDescriptor>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Configured server names, sorted
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.descriptors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptor(&self, name: &str) -> McpResult<&ServerDescriptor> {
        self.descriptors
            .get(name)
            .ok_or_else(|| McpClientError::UnknownServer(name.to_string()))
    }

    /// Connect a configured server
    ///
    /// Already connected servers are left alone and their client returned.
    pub async fn connect(&self, name: &str) -> McpResult<Arc<McpClient>> {
        let descriptor = self.descriptor(name)?;

        if let Some(client) = self.clients.read().await.get(name) {
            if client.is_connected() {
                tracing::warn!(server = name, "Server is already connected");
                return Ok(Arc::clone(client));
            }
        }

        let client = Arc::new(McpClient::with_factory(
            descriptor.clone(),
            Arc::clone(&self.factory),
        ));
        let info: InitializeResult = client.connect().await?;
        tracing::info!(
            server = name,
            "Connected to {} v{}",
            info.server_info.name,
            info.server_info.version
        );

        let replaced = self
            .clients
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&client));
        if let Some(old) = replaced {
            old.disconnect().await;
        }
        Ok(client)
    }

    /// Disconnect one server; `Ok(false)` if it was not connected
    pub async fn disconnect(&self, name: &str) -> McpResult<bool> {
        self.descriptor(name)?;
        let client = self.clients.write().await.remove(name);
        match client {
            Some(client) => {
                client.disconnect().await;
                Ok(true)
            }
            None => {
                tracing::warn!(server = name, "Server is not connected");
                Ok(false)
            }
        }
    }

    /// Disconnect every server concurrently
    pub async fn disconnect_all(&self) {
        let clients: Vec<_> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        join_all(clients.iter().map(|client| client.disconnect())).await;
    }

    /// Names of connected servers, sorted
    pub async fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .clients
            .read()
            .await
            .iter()
            .filter(|(_, client)| client.is_connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.clients
            .read()
            .await
            .get(name)
            .is_some_and(|client| client.is_connected())
    }

    /// Client for a connected server
    pub async fn client(&self, name: &str) -> McpResult<Arc<McpClient>> {
        self.descriptor(name)?;
        self.clients
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or(McpClientError::NotConnected)
    }
}
