// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Daemon Config Module
// Handles daemon configuration (bind address, storage, provider, auth)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use tunnel_registry_common::{is_loopback_address, split_host_port, CorruptStatePolicy};

/// Environment variable overriding the configuration file location
pub const CONFIG_ENV: &str = "TUNNEL_REGISTRY_CONFIG";

const APP_DIR: &str = "tunnel-registry";

fn app_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Address the HTTP API binds to (e.g., "127.0.0.1:8080")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// JSON file holding the registry
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// What to do when the registry file cannot be parsed
    #[serde(default)]
    pub corrupt_state_policy: CorruptStatePolicy,

    /// Require the X-Tunnel-Token header on every API call except /health
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// Path to authentication token file
    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// Tunnelling backend name
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Label attached to the provider session
    #[serde(default = "default_session_metadata")]
    pub session_metadata: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound for opening a single listener
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    /// Publish the API itself through the provider
    #[serde(default)]
    pub expose_api: bool,

    #[serde(default = "default_api_listener_metadata")]
    pub api_listener_metadata: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_registry_path() -> PathBuf {
    app_dir().join("tunnels.json")
}

fn default_require_auth() -> bool {
    true
}

fn default_auth_token_path() -> PathBuf {
    app_dir().join("daemon.token")
}

fn default_provider() -> String {
    "ngrok".to_string()
}

fn default_session_metadata() -> String {
    "Dynamic Tunnel Creator".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_api_listener_metadata() -> String {
    "API Server Endpoint".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            registry_path: default_registry_path(),
            corrupt_state_policy: CorruptStatePolicy::default(),
            require_auth: default_require_auth(),
            auth_token_path: default_auth_token_path(),
            provider: default_provider(),
            session_metadata: default_session_metadata(),
            connect_timeout_secs: default_connect_timeout_secs(),
            open_timeout_secs: default_open_timeout_secs(),
            expose_api: false,
            api_listener_metadata: default_api_listener_metadata(),
        }
    }
}

impl DaemonConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 || self.open_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs and open_timeout_secs must be greater than zero");
        }

        let (host, _) = split_host_port(&self.bind_address).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid bind_address '{}': expected host:port",
                self.bind_address
            )
        })?;

        if !is_loopback_address(host) && !self.require_auth {
            anyhow::bail!(
                "Security violation: Non-loopback bind_address {} requires authentication.\n\
                 \n\
                 To fix this:\n\
                 1. Set require_auth = true in daemon.toml, OR\n\
                 2. Use a loopback address (127.0.0.1 or localhost) for bind_address",
                self.bind_address
            );
        }

        if self.expose_api && !self.require_auth {
            anyhow::bail!(
                "Security violation: expose_api publishes the API through the provider and \
                 requires authentication.\n\
                 \n\
                 To fix this:\n\
                 1. Set require_auth = true in daemon.toml, OR\n\
                 2. Set expose_api = false"
            );
        }

        Ok(())
    }

    /// Load from `$TUNNEL_REGISTRY_CONFIG` or the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, writing defaults there on first run
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", path.display());
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", path.display());
        Ok(config)
    }

    /// Save daemon configuration to `path` with owner-only permissions
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(path, contents).context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join(APP_DIR).join("daemon.toml"))
    }
}

/// Write a cli.toml snippet next to the daemon config so users can copy it
pub fn write_cli_config_snippet(bind_address: &str, auth_token: Option<&str>) -> Result<PathBuf> {
    let snippet_path = app_dir().join("cli-config.snippet");
    write_cli_config_snippet_to(&snippet_path, bind_address, auth_token)?;

    info!("CLI configuration snippet written to {}", snippet_path.display());
    info!(
        "To configure tunnelctl, run: cp {} ~/.config/{}/cli.toml",
        snippet_path.display(),
        APP_DIR
    );
    Ok(snippet_path)
}

fn write_cli_config_snippet_to(
    path: &Path,
    bind_address: &str,
    auth_token: Option<&str>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let mut content = format!(
        "# CLI configuration for Tunnel Registry\n\
         # Copy this to ~/.config/{}/cli.toml\n\
         \n\
         daemon_url = \"http://{}\"\n",
        APP_DIR, bind_address
    );
    if let Some(token) = auth_token {
        content.push_str(&format!("auth_token = \"{}\"\n", token));
    }

    fs::write(path, content).context("Failed to write CLI config snippet")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set snippet permissions")?;
    }

    Ok(())
}
