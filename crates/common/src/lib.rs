// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Common Library
// Shared types, registry persistence, and daemon client

pub mod daemon_client;
pub mod error;
pub mod network;
pub mod registry;
pub mod sse;
pub mod store;
pub mod types;

pub use daemon_client::{
    add_auth_header, create_daemon_client, create_tunnel, delete_tunnel, health, list_tunnels,
    reconcile, DaemonClientConfig, MessageResponse, AUTH_TOKEN_HEADER,
};
pub use error::{Error, Result};
pub use network::{is_loopback_address, split_host_port, validate_forward_target};
pub use registry::Registry;
pub use sse::EventListener;
pub use store::{CorruptStatePolicy, RegistryStore};
pub use types::{
    CreateTunnelRequest, MatchMode, Protocol, ReconcileFailure, ReconcileReport, TunnelDescriptor,
    TunnelEntry, TunnelEvent, UrlMigration,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
