//! TunnelEndpoint store client
//!
//! The reconciler reads the live descriptor and writes finalizer changes
//! through [`TunnelEndpointClientTrait`]. Writes are full replaces carrying
//! `metadata.resourceVersion`, so a concurrent writer surfaces as
//! [`ClientError::Conflict`] instead of being overwritten.

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::tunnelendpoint::TunnelEndpoint;

/// Trait for TunnelEndpoint store operations
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelEndpointClientTrait: Send + Sync {
    /// Fetch the current version; `None` once the object is gone
    async fn get(&self, namespace: &str, name: &str)
        -> Result<Option<TunnelEndpoint>, ClientError>;

    /// Replace the object, failing with `Conflict` if its resourceVersion
    /// is no longer current
    async fn replace(&self, endpoint: &TunnelEndpoint) -> Result<TunnelEndpoint, ClientError>;
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("TunnelEndpoint {0} was modified concurrently")]
    Conflict(String),
    #[error("TunnelEndpoint {0} not found")]
    NotFound(String),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Client backed by the Kubernetes API
pub struct KubeTunnelEndpointClient {
    client: Client,
}

impl KubeTunnelEndpointClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TunnelEndpointClientTrait for KubeTunnelEndpointClient {
    #[instrument(skip(self))]
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TunnelEndpoint>, ClientError> {
        let api: Api<TunnelEndpoint> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self, endpoint), fields(name = ?endpoint.metadata.name))]
    async fn replace(&self, endpoint: &TunnelEndpoint) -> Result<TunnelEndpoint, ClientError> {
        let name = endpoint
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClientError::MissingField("metadata.name".to_string()))?;
        let namespace = endpoint
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| ClientError::MissingField("metadata.namespace".to_string()))?;

        let api: Api<TunnelEndpoint> = Api::namespaced(self.client.clone(), namespace);
        match api.replace(name, &PostParams::default(), endpoint).await {
            Ok(updated) => {
                debug!(
                    name = %name,
                    resource_version = ?updated.metadata.resource_version,
                    "Replaced TunnelEndpoint"
                );
                Ok(updated)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(ClientError::Conflict(format!("{namespace}/{name}")))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(ClientError::NotFound(format!("{namespace}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
