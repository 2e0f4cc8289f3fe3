// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Daemon Client Module
// Shared daemon connection logic for the CLI

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{CreateTunnelRequest, ReconcileReport, TunnelEntry};

/// HTTP header name for the daemon authentication token
pub const AUTH_TOKEN_HEADER: &str = "X-Tunnel-Token";

/// Client configuration for connecting to daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    /// Base URL of the daemon API (e.g., "http://127.0.0.1:8080")
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,

    /// Authentication token (if daemon requires auth)
    #[serde(default)]
    pub auth_token: String,
}

fn default_daemon_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
            auth_token: String::new(),
        }
    }
}

impl DaemonClientConfig {
    /// Parse the configured base URL, adding `http://` when no scheme is given
    pub fn base_url(&self) -> Result<Url> {
        let raw = self.daemon_url.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        Url::parse(&with_scheme).context(format!("Invalid daemon_url '{}'", raw))
    }

    /// Build an endpoint URL from path segments; each segment is percent-encoded
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url()?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("daemon_url cannot be used as a base URL"))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

/// Error body returned by the daemon
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    candidates: Vec<String>,
}

/// Message body returned by the daemon for delete
#[derive(Debug, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Create an HTTP client configured to connect to the daemon
pub fn create_daemon_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build daemon client")
}

/// Add authentication header to request if configured
pub fn add_auth_header(
    request: reqwest::RequestBuilder,
    config: &DaemonClientConfig,
) -> reqwest::RequestBuilder {
    if !config.auth_token.is_empty() {
        request.header(AUTH_TOKEN_HEADER, &config.auth_token)
    } else {
        request
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .context("Failed to parse daemon response");
    }

    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) if body.candidates.is_empty() => anyhow::bail!("{} ({})", body.error, status),
        Ok(body) => anyhow::bail!(
            "{} ({})\nCandidates:\n  {}",
            body.error,
            status,
            body.candidates.join("\n  ")
        ),
        Err(_) if text.is_empty() => anyhow::bail!("Daemon returned {}", status),
        Err(_) => anyhow::bail!("Daemon returned {}: {}", status, text),
    }
}

/// Check that the daemon is reachable
pub async fn health(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    let url = config.endpoint(&["health"])?;
    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to connect to daemon")?;

    if !response.status().is_success() {
        anyhow::bail!("Daemon health check failed: {}", response.status());
    }
    Ok(())
}

/// List every registered tunnel
pub async fn list_tunnels(client: &Client, config: &DaemonClientConfig) -> Result<Vec<TunnelEntry>> {
    let url = config.endpoint(&["tunnels"])?;
    let response = add_auth_header(client.get(url), config)
        .send()
        .await
        .context("Failed to connect to daemon")?;
    decode(response).await
}

/// Create a tunnel and return the registered entry
pub async fn create_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    request: &CreateTunnelRequest,
) -> Result<TunnelEntry> {
    let url = config.endpoint(&["tunnels"])?;
    let response = add_auth_header(client.post(url), config)
        .json(request)
        .send()
        .await
        .context("Failed to connect to daemon")?;
    decode(response).await
}

/// Delete the tunnel matching `query`
///
/// With `exact` unset the daemon also accepts a unique substring of the URL.
pub async fn delete_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    query: &str,
    exact: bool,
) -> Result<MessageResponse> {
    let mut url = config.endpoint(&["tunnels", query])?;
    if exact {
        url.set_query(Some("exact=true"));
    }

    let response = add_auth_header(client.delete(url), config)
        .send()
        .await
        .context("Failed to connect to daemon")?;
    decode(response).await
}

/// Ask the daemon to retry reconciliation of unreconciled entries
pub async fn reconcile(client: &Client, config: &DaemonClientConfig) -> Result<ReconcileReport> {
    let url = config.endpoint(&["reconcile"])?;
    let response = add_auth_header(client.post(url), config)
        .send()
        .await
        .context("Failed to connect to daemon")?;
    decode(response).await
}
