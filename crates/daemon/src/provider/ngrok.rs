// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// ngrok backend for the Provider Session Gateway
// The auth token is read from NGROK_AUTHTOKEN by the SDK.

use std::sync::Arc;

use async_trait::async_trait;
use ngrok::prelude::*;
use ngrok::tunnel::UrlTunnel;
use ngrok::Session;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use tunnel_registry_common::Protocol;

use super::{Listener, ListenerSpec, ProviderError, ProviderSession, TunnelProvider};

/// Reply channel handed to the forwarding task when a close is requested
type CloseReply = oneshot::Sender<Result<(), String>>;

pub struct NgrokProvider {
    session_metadata: String,
}

impl NgrokProvider {
    pub fn new(session_metadata: &str) -> Self {
        Self {
            session_metadata: session_metadata.to_string(),
        }
    }
}

#[async_trait]
impl TunnelProvider for NgrokProvider {
    fn name(&self) -> &'static str {
        "ngrok"
    }

    async fn connect(&self) -> Result<Arc<dyn ProviderSession>, ProviderError> {
        let session = Session::builder()
            .authtoken_from_env()
            .metadata(self.session_metadata.clone())
            .connect()
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        Ok(Arc::new(NgrokSession { session }))
    }
}

/// Local URL the tunnel forwards its traffic to
fn forward_target(spec: &ListenerSpec) -> Result<Url, ProviderError> {
    Url::parse(&format!("{}://{}", spec.protocol, spec.forwards_to)).map_err(|e| ProviderError::Open {
        protocol: spec.protocol,
        forwards_to: spec.forwards_to.clone(),
        reason: e.to_string(),
    })
}

struct NgrokSession {
    session: Session,
}

#[async_trait]
impl ProviderSession for NgrokSession {
    async fn open(&self, spec: &ListenerSpec) -> Result<Box<dyn Listener>, ProviderError> {
        let open_error = |reason: String| ProviderError::Open {
            protocol: spec.protocol,
            forwards_to: spec.forwards_to.clone(),
            reason,
        };

        let target = forward_target(spec)?;

        match spec.protocol {
            Protocol::Http => {
                let mut builder = self.session.http_endpoint();
                builder = builder.forwards_to(spec.forwards_to.clone());
                if let Some(domain) = &spec.domain {
                    builder = builder.domain(domain.clone());
                }
                if let Some(metadata) = &spec.metadata {
                    builder = builder.metadata(metadata.clone());
                }

                let tunnel = builder.listen().await.map_err(|e| open_error(e.to_string()))?;
                Ok(Box::new(NgrokListener::spawn(tunnel, spec.protocol, target)))
            }
            Protocol::Tcp => {
                let mut builder = self.session.tcp_endpoint();
                builder = builder.forwards_to(spec.forwards_to.clone());
                // Reserved TCP addresses play the role of a domain
                if let Some(domain) = &spec.domain {
                    builder = builder.remote_addr(domain.clone());
                }
                if let Some(metadata) = &spec.metadata {
                    builder = builder.metadata(metadata.clone());
                }

                let tunnel = builder.listen().await.map_err(|e| open_error(e.to_string()))?;
                Ok(Box::new(NgrokListener::spawn(tunnel, spec.protocol, target)))
            }
        }
    }
}

/// Handle to a tunnel owned by its forwarding task
///
/// The task forwards connections until a close is requested or the handle
/// is dropped, then closes the tunnel.
struct NgrokListener {
    url: String,
    metadata: String,
    close_tx: Option<oneshot::Sender<CloseReply>>,
}

impl NgrokListener {
    fn spawn<T>(mut tunnel: T, protocol: Protocol, target: Url) -> Self
    where
        T: UrlTunnel + TunnelExt + Send + 'static,
    {
        let url = tunnel.url().to_string();
        let metadata = tunnel.metadata().to_string();
        let (close_tx, close_rx) = oneshot::channel::<CloseReply>();

        let task_url = url.clone();
        tokio::spawn(async move {
            let reply = tokio::select! {
                result = forward(&mut tunnel, protocol, target) => {
                    match result {
                        Ok(()) => debug!("Listener {} stopped forwarding", task_url),
                        Err(e) => warn!("Listener {} stopped forwarding: {}", task_url, e),
                    }
                    None
                }
                request = close_rx => request.ok(),
            };

            let closed = tunnel.close().await.map_err(|e| e.to_string());
            match reply {
                Some(reply) => {
                    let _ = reply.send(closed);
                }
                None => {
                    if let Err(e) = closed {
                        warn!("Failed to close listener {}: {}", task_url, e);
                    }
                }
            }
        });

        Self {
            url,
            metadata,
            close_tx: Some(close_tx),
        }
    }
}

async fn forward<T>(tunnel: &mut T, protocol: Protocol, target: Url) -> std::io::Result<()>
where
    T: TunnelExt + Send,
{
    match protocol {
        Protocol::Http => tunnel.forward_http(target).await,
        Protocol::Tcp => tunnel.forward_tcp(target).await,
    }
}

#[async_trait]
impl Listener for NgrokListener {
    fn url(&self) -> &str {
        &self.url
    }

    fn metadata(&self) -> &str {
        &self.metadata
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        let Some(close_tx) = self.close_tx.take() else {
            return Ok(());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if close_tx.send(reply_tx).is_err() {
            // Forwarding already ended and the task closed the tunnel
            return Ok(());
        }

        match reply_rx.await {
            Ok(Err(reason)) => Err(ProviderError::Close {
                url: self.url.clone(),
                reason,
            }),
            Ok(Ok(())) | Err(_) => Ok(()),
        }
    }
}
