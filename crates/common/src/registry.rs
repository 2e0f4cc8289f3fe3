// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Registry Module
// Insertion-ordered mapping from public URL to tunnel descriptor

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::types::{MatchMode, TunnelDescriptor, TunnelEntry};

/// Mapping from public URL to [`TunnelDescriptor`]
///
/// Keys are unique. Iteration (and the persisted JSON object) follows
/// insertion order, which is also the order reconciliation walks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    entries: Vec<(String, TunnelDescriptor)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, url: &str) -> Option<usize> {
        self.entries.iter().position(|(key, _)| key == url)
    }

    pub fn get(&self, url: &str) -> Option<&TunnelDescriptor> {
        self.position(url).map(|i| &self.entries[i].1)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.position(url).is_some()
    }

    /// Insert or replace; a replaced entry keeps its position
    pub fn insert(&mut self, url: String, descriptor: TunnelDescriptor) -> Option<TunnelDescriptor> {
        match self.position(&url) {
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, descriptor)),
            None => {
                self.entries.push((url, descriptor));
                None
            }
        }
    }

    pub fn remove(&mut self, url: &str) -> Option<TunnelDescriptor> {
        self.position(url).map(|i| self.entries.remove(i).1)
    }

    /// Move the entry stored under `old` to `new`, keeping its position
    pub fn rekey(&mut self, old: &str, new: String, descriptor: TunnelDescriptor) -> Result<()> {
        if old != new && self.contains(&new) {
            return Err(Error::InvalidRequest(format!(
                "cannot move {} to {}: key already registered",
                old, new
            )));
        }

        let i = self
            .position(old)
            .ok_or_else(|| Error::NotFound(old.to_string()))?;
        self.entries[i] = (new, descriptor);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TunnelDescriptor)> {
        self.entries.iter().map(|(url, d)| (url.as_str(), d))
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(url, _)| url.as_str())
    }

    /// Owned copy of every entry, safe to walk while the registry is mutated
    pub fn snapshot(&self) -> Vec<(String, TunnelDescriptor)> {
        self.entries.clone()
    }

    pub fn entries(&self) -> Vec<TunnelEntry> {
        self.entries
            .iter()
            .map(|(url, descriptor)| TunnelEntry {
                url: url.clone(),
                descriptor: descriptor.clone(),
            })
            .collect()
    }

    /// Resolve a caller-supplied reference to a single key
    pub fn resolve(&self, query: &str, mode: MatchMode) -> Result<String> {
        if self.contains(query) {
            return Ok(query.to_string());
        }

        if mode == MatchMode::Exact || query.is_empty() {
            return Err(Error::NotFound(query.to_string()));
        }

        let mut candidates: Vec<String> = self
            .urls()
            .filter(|url| url.contains(query))
            .map(str::to_string)
            .collect();

        match candidates.len() {
            0 => Err(Error::NotFound(query.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => Err(Error::Ambiguous {
                query: query.to_string(),
                candidates,
            }),
        }
    }
}

impl Serialize for Registry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(url, d)| (url, d)))
    }
}

struct RegistryVisitor;

impl<'de> Visitor<'de> for RegistryVisitor {
    type Value = Registry;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of public URL to tunnel descriptor")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Registry, A::Error> {
        let mut registry = Registry::new();
        while let Some((url, descriptor)) = access.next_entry::<String, TunnelDescriptor>()? {
            registry.insert(url, descriptor);
        }
        Ok(registry)
    }
}

impl<'de> Deserialize<'de> for Registry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(RegistryVisitor)
    }
}
