// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - CLI Config Module
// Handles CLI configuration for connecting to the daemon

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use tunnel_registry_common::DaemonClientConfig;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,
}

impl CliConfig {
    /// Load CLI configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file means defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).context("Failed to read CLI configuration")?;

        toml::from_str(&contents).context("Failed to parse CLI configuration")
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunnel-registry").join("cli.toml"))
    }
}
