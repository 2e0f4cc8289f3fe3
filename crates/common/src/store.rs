// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Registry Store Module
// Loads and persists the registry as a single JSON document

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::registry::Registry;

/// What `load` does with a registry file that cannot be parsed
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptStatePolicy {
    /// Refuse to start
    #[default]
    Fail,
    /// Move the bad file aside and start with an empty registry
    StartEmpty,
}

/// Durable storage for the [`Registry`]
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    policy: CorruptStatePolicy,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>, policy: CorruptStatePolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry; a missing file yields an empty registry
    pub fn load(&self) -> Result<Registry> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", self.path.display());
                return Ok(Registry::new());
            }
            Err(e) => {
                return Err(Error::StorageRead {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        if contents.trim().is_empty() {
            warn!("Registry file {} is empty, starting empty", self.path.display());
            return Ok(Registry::new());
        }

        match serde_json::from_str::<Registry>(&contents) {
            Ok(registry) => {
                debug!(
                    "Loaded {} tunnel(s) from {}",
                    registry.len(),
                    self.path.display()
                );
                Ok(registry)
            }
            Err(e) => self.recover_corrupt(e.to_string()),
        }
    }

    fn recover_corrupt(&self, reason: String) -> Result<Registry> {
        match self.policy {
            CorruptStatePolicy::Fail => Err(Error::CorruptState {
                path: self.path.clone(),
                reason,
            }),
            CorruptStatePolicy::StartEmpty => {
                let backup = self.corrupt_backup_path();
                error!(
                    "Registry file {} is corrupt ({}), moving it to {} and starting empty",
                    self.path.display(),
                    reason,
                    backup.display()
                );
                fs::rename(&self.path, &backup).map_err(|e| Error::StorageWrite {
                    path: backup.clone(),
                    source: e,
                })?;
                Ok(Registry::new())
            }
        }
    }

    fn corrupt_backup_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry.json".into());
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry.json".into());
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }

    /// Overwrite storage with the full registry
    ///
    /// The document is written to a sibling temp file, synced, then renamed
    /// over the target so a crash never leaves a truncated registry.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        let serialized = serde_json::to_string_pretty(registry)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::StorageWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let temp_path = self.temp_path();
        if let Err(e) = write_synced(&temp_path, serialized.as_bytes()) {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::StorageWrite {
                path: temp_path,
                source: e,
            });
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::StorageWrite {
                path: self.path.clone(),
                source: e,
            });
        }

        debug!(
            "Saved {} tunnel(s) to {}",
            registry.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Save on the blocking pool so the fsync never stalls a runtime worker
    pub async fn persist(&self, registry: &Registry) -> Result<()> {
        let store = self.clone();
        let registry = registry.clone();

        tokio::task::spawn_blocking(move || store.save(&registry))
            .await
            .map_err(|e| Error::StorageWrite {
                path: self.path.clone(),
                source: std::io::Error::new(ErrorKind::Other, e.to_string()),
            })?
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    // Registry may reveal reserved domains and local services
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}
