// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Error types for Tunnel Registry

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Ambiguous tunnel reference '{query}': matches {}", .candidates.join(", "))]
    Ambiguous {
        query: String,
        candidates: Vec<String>,
    },

    #[error("Corrupt registry state in {}: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("Failed to read registry from {}: {source}", .path.display())]
    StorageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write registry to {}: {source}", .path.display())]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for errors caused by the caller rather than the daemon or provider
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Ambiguous { .. } | Error::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
