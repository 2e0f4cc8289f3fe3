// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Common types for Tunnel Registry

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::validate_forward_target;

/// Protocol of a provider endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(Error::InvalidRequest(format!(
                "unsupported protocol '{}' (expected http or tcp)",
                other
            ))),
        }
    }
}

/// Persisted description of one tunnel, keyed in the registry by its public URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelDescriptor {
    pub protocol: Protocol,
    /// Local `host:port` the provider forwards traffic to
    pub forwards_to: String,
    /// Reserved domain the endpoint must bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Free text attached to the provider-side listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl TunnelDescriptor {
    pub fn new(protocol: Protocol, forwards_to: impl Into<String>) -> Self {
        Self {
            protocol,
            forwards_to: forwards_to.into(),
            domain: None,
            metadata: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// A descriptor bound to a reserved domain keeps its URL across reconnects
    pub fn is_reserved(&self) -> bool {
        self.domain.is_some()
    }
}

/// A registry entry as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelEntry {
    pub url: String,
    #[serde(flatten)]
    pub descriptor: TunnelDescriptor,
}

/// Request body for creating a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub protocol: Protocol,
    pub forwards_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl CreateTunnelRequest {
    pub fn validate(&self) -> Result<()> {
        validate_forward_target(&self.forwards_to)?;

        if let Some(domain) = &self.domain {
            if domain.trim().is_empty() {
                return Err(Error::InvalidRequest("domain cannot be empty".to_string()));
            }
            if domain.contains("://") || domain.contains('/') {
                return Err(Error::InvalidRequest(format!(
                    "domain '{}' must be a bare hostname",
                    domain
                )));
            }
        }

        Ok(())
    }
}

/// How a caller-supplied reference is matched against registry keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// The reference must equal a key
    Exact,
    /// An exact key wins, otherwise a single key containing the reference
    #[default]
    Fuzzy,
}

/// A stored URL that changed during reconciliation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlMigration {
    pub from: String,
    pub to: String,
}

/// An entry that could not be re-established
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileFailure {
    pub url: String,
    pub error: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Re-established under the same URL
    #[serde(default)]
    pub unchanged: Vec<String>,
    /// Re-established under a new URL
    #[serde(default)]
    pub migrated: Vec<UrlMigration>,
    /// Already live in this process
    #[serde(default)]
    pub skipped: Vec<String>,
    /// Left untouched under their original URL
    #[serde(default)]
    pub failed: Vec<ReconcileFailure>,
    pub completed_at: DateTime<Utc>,
}

impl ReconcileReport {
    pub fn new() -> Self {
        Self {
            unchanged: Vec::new(),
            migrated: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.unchanged.len() + self.migrated.len() + self.skipped.len() + self.failed.len()
    }
}

impl Default for ReconcileReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    Created { entry: TunnelEntry },
    Deleted { url: String },
    Migrated { from: String, to: String },
    ReconcileFailed { url: String, error: String },
    Heartbeat { timestamp: DateTime<Utc> },
}
