// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

//! Server-Sent Events listener for real-time registry updates
//!
//! Framework-agnostic SSE client that works with any async runtime (tokio).

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::{add_auth_header, DaemonClientConfig, TunnelEvent};

/// Event listener for daemon SSE stream
pub struct EventListener {
    config: DaemonClientConfig,
}

impl EventListener {
    /// Create a new event listener
    pub fn new(config: DaemonClientConfig) -> Self {
        Self { config }
    }

    /// Start listening to daemon events
    /// Returns a channel receiver that yields TunnelEvent items.
    /// Automatically reconnects with exponential backoff if the stream drops.
    pub async fn listen(&self) -> Result<mpsc::Receiver<TunnelEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                if let Err(e) = Self::stream_events(&config, tx.clone()).await {
                    tracing::warn!("Event stream error: {}", e);
                }

                // If receiver is dropped, stop trying
                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        Ok(rx)
    }

    async fn stream_events(config: &DaemonClientConfig, tx: mpsc::Sender<TunnelEvent>) -> Result<()> {
        let url = config.endpoint(&["events"])?;

        // Streams stay open indefinitely, so no request timeout here
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build event stream client")?;

        let response = add_auth_header(client.get(url), config)
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);

                    for message in drain_messages(&mut buffer) {
                        if let Some(event) = parse_sse_message(&message) {
                            if tx.send(event).await.is_err() {
                                tracing::debug!("Receiver dropped, stopping event listener");
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Error reading event stream: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Split every complete SSE message off the front of `buffer`
///
/// Chunks may end inside a multi-byte character, so frames are only decoded
/// once their terminating blank line has arrived.
fn drain_messages(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
        messages.push(String::from_utf8_lossy(&frame[..pos]).into_owned());
    }
    messages
}

/// Parse an SSE message into a TunnelEvent
pub fn parse_sse_message(message: &str) -> Option<TunnelEvent> {
    // SSE format: "data: {json}\n"
    for line in message.lines() {
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"));

        if let Some(data) = data {
            match serde_json::from_str::<TunnelEvent>(data) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!("Failed to parse SSE event: {} (error: {})", data, e);
                }
            }
        }
    }
    None
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(DaemonClientConfig::default())
    }
}
