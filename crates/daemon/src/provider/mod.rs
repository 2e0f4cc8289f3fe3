// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Provider Session Gateway
// Seam between the registry and the tunnelling provider SDK

#[cfg(feature = "ngrok")]
mod ngrok;
#[cfg(test)]
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tunnel_registry_common::{Protocol, TunnelDescriptor};

/// Failures reported by the tunnelling backend
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Failed to connect to provider: {0}")]
    Connect(String),

    #[error("Failed to open {protocol} listener for {forwards_to}: {reason}")]
    Open {
        protocol: Protocol,
        forwards_to: String,
        reason: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Provider assigned {actual} to reserved tunnel {expected}")]
    DomainMismatch { expected: String, actual: String },

    #[error("Failed to close listener {url}: {reason}")]
    Close { url: String, reason: String },

    #[error("Provider '{0}' is not available in this build")]
    Unavailable(String),
}

impl From<ProviderError> for tunnel_registry_common::Error {
    fn from(e: ProviderError) -> Self {
        tunnel_registry_common::Error::Provider(e.to_string())
    }
}

/// What to ask the provider for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub protocol: Protocol,
    pub forwards_to: String,
    pub domain: Option<String>,
    pub metadata: Option<String>,
}

impl ListenerSpec {
    pub fn from_descriptor(descriptor: &TunnelDescriptor) -> Self {
        Self {
            protocol: descriptor.protocol,
            forwards_to: descriptor.forwards_to.clone(),
            domain: descriptor.domain.clone(),
            metadata: descriptor.metadata.clone(),
        }
    }
}

/// A tunnelling backend able to open an authenticated session
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Arc<dyn ProviderSession>, ProviderError>;
}

/// A live session with the provider's control plane
#[async_trait]
pub trait ProviderSession: Send + Sync {
    async fn open(&self, spec: &ListenerSpec) -> Result<Box<dyn Listener>, ProviderError>;
}

/// A provider endpoint forwarding its public URL to a local address
///
/// Dropping a listener may tear down the endpoint, so the daemon keeps every
/// live listener until the tunnel is deleted or the process stops.
#[async_trait]
pub trait Listener: Send + Sync {
    fn url(&self) -> &str;

    fn metadata(&self) -> &str;

    async fn close(&mut self) -> Result<(), ProviderError>;
}

/// Close a listener, logging instead of propagating failures
pub async fn close_quietly(mut listener: Box<dyn Listener>) {
    let url = listener.url().to_string();
    match listener.close().await {
        Ok(()) => debug!("Closed listener {}", url),
        Err(e) => warn!("{}", e),
    }
}

/// Build the provider selected in the daemon configuration
pub fn build_provider(name: &str, session_metadata: &str) -> Result<Arc<dyn TunnelProvider>, ProviderError> {
    match name {
        #[cfg(feature = "ngrok")]
        "ngrok" => Ok(Arc::new(ngrok::NgrokProvider::new(session_metadata))),
        other => {
            let _ = session_metadata;
            Err(ProviderError::Unavailable(other.to_string()))
        }
    }
}

/// Owns the provider and its single shared session
pub struct Gateway {
    provider: Arc<dyn TunnelProvider>,
    session: Mutex<Option<Arc<dyn ProviderSession>>>,
    connect_timeout: Duration,
    open_timeout: Duration,
}

impl Gateway {
    pub fn new(provider: Arc<dyn TunnelProvider>, connect_timeout: Duration, open_timeout: Duration) -> Self {
        Self {
            provider,
            session: Mutex::new(None),
            connect_timeout,
            open_timeout,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Connect once; later calls reuse the established session
    pub async fn connect(&self) -> Result<Arc<dyn ProviderSession>, ProviderError> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            return Ok(existing.clone());
        }

        let connected = tokio::time::timeout(self.connect_timeout, self.provider.connect())
            .await
            .map_err(|_| ProviderError::Timeout {
                operation: format!("Connecting to {}", self.provider.name()),
                after: self.connect_timeout,
            })??;

        info!("Connected to {} provider", self.provider.name());
        *session = Some(connected.clone());
        Ok(connected)
    }

    /// Open a listener, bounded by the per-tunnel timeout
    pub async fn open(&self, spec: &ListenerSpec) -> Result<Box<dyn Listener>, ProviderError> {
        let session = self.connect().await?;

        let listener = tokio::time::timeout(self.open_timeout, session.open(spec))
            .await
            .map_err(|_| ProviderError::Timeout {
                operation: format!("Opening {} listener for {}", spec.protocol, spec.forwards_to),
                after: self.open_timeout,
            })??;

        debug!(
            "Opened {} listener {} -> {}",
            spec.protocol,
            listener.url(),
            spec.forwards_to
        );
        Ok(listener)
    }
}
