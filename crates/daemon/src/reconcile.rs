// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Reconciler
// Re-establishes persisted tunnels and follows URL drift

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tunnel_registry_common::{
    ReconcileFailure, ReconcileReport, RegistryStore, Result, TunnelDescriptor, TunnelEvent,
    UrlMigration, Utc,
};

use crate::provider::{close_quietly, Gateway, Listener, ListenerSpec, ProviderError};
use crate::service::RegistryState;

pub struct Reconciler {
    gateway: Arc<Gateway>,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl Reconciler {
    pub fn new(gateway: Arc<Gateway>, event_tx: broadcast::Sender<TunnelEvent>) -> Self {
        Self { gateway, event_tx }
    }

    /// Run one pass over every registry entry, then persist once
    ///
    /// A provider failure only affects its own entry, which stays under its
    /// original URL. The only error returned is a failed save.
    pub async fn run(&self, state: &mut RegistryState, store: &RegistryStore) -> Result<ReconcileReport> {
        let snapshot = state.registry.snapshot();
        let mut report = ReconcileReport::new();

        info!("Reconciling {} tunnel(s)", snapshot.len());

        for (url, descriptor) in snapshot {
            if state.listeners.contains_key(&url) {
                debug!("Tunnel {} already live, skipping", url);
                report.skipped.push(url);
                continue;
            }

            match self.reestablish(&url, &descriptor).await {
                Ok(listener) => self.apply(state, &mut report, url, descriptor, listener).await,
                Err(e) => self.record_failure(&mut report, url, e.to_string()),
            }
        }

        report.completed_at = Utc::now();
        store.persist(&state.registry).await?;

        info!(
            "Reconciliation finished: {} unchanged, {} migrated, {} skipped, {} failed",
            report.unchanged.len(),
            report.migrated.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn reestablish(
        &self,
        url: &str,
        descriptor: &TunnelDescriptor,
    ) -> std::result::Result<Box<dyn Listener>, ProviderError> {
        let listener = self
            .gateway
            .open(&ListenerSpec::from_descriptor(descriptor))
            .await?;

        // A reserved domain must come back under the same URL
        if descriptor.is_reserved() && listener.url() != url {
            let actual = listener.url().to_string();
            close_quietly(listener).await;
            return Err(ProviderError::DomainMismatch {
                expected: url.to_string(),
                actual,
            });
        }

        Ok(listener)
    }

    async fn apply(
        &self,
        state: &mut RegistryState,
        report: &mut ReconcileReport,
        url: String,
        descriptor: TunnelDescriptor,
        listener: Box<dyn Listener>,
    ) {
        let new_url = listener.url().to_string();
        let updated = TunnelDescriptor {
            metadata: listener_metadata(listener.as_ref()).or(descriptor.metadata.clone()),
            ..descriptor
        };

        if new_url == url {
            state.registry.insert(url.clone(), updated);
            info!("Tunnel {} re-established", url);
            report.unchanged.push(url);
        } else {
            if let Err(e) = state.registry.rekey(&url, new_url.clone(), updated) {
                close_quietly(listener).await;
                self.record_failure(report, url, e.to_string());
                return;
            }

            info!("Tunnel {} re-established at new URL {}", url, new_url);
            if let Err(e) = self.event_tx.send(TunnelEvent::Migrated {
                from: url.clone(),
                to: new_url.clone(),
            }) {
                debug!("Failed to broadcast Migrated event for {}: {}", url, e);
            }
            report.migrated.push(UrlMigration {
                from: url,
                to: new_url.clone(),
            });
        }

        state.listeners.insert(new_url, listener);
    }

    fn record_failure(&self, report: &mut ReconcileReport, url: String, error: String) {
        warn!("Could not reconcile tunnel {}: {}", url, error);
        if let Err(e) = self.event_tx.send(TunnelEvent::ReconcileFailed {
            url: url.clone(),
            error: error.clone(),
        }) {
            debug!("Failed to broadcast ReconcileFailed event for {}: {}", url, e);
        }
        report.failed.push(ReconcileFailure { url, error });
    }
}

/// Metadata reported by the listener, if any
pub fn listener_metadata(listener: &dyn Listener) -> Option<String> {
    let metadata = listener.metadata();
    if metadata.is_empty() {
        None
    } else {
        Some(metadata.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tunnel_registry_common::{CorruptStatePolicy, Protocol, Registry};

    use crate::provider::scripted::ScriptedProvider;

    struct Fixture {
        _dir: TempDir,
        provider: ScriptedProvider,
        store: RegistryStore,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        let gateway = Arc::new(Gateway::new(
            Arc::new(provider.clone()),
            Duration::from_secs(1),
            Duration::from_millis(100),
        ));
        let (event_tx, _) = broadcast::channel(16);
        Fixture {
            store: RegistryStore::new(dir.path().join("tunnels.json"), CorruptStatePolicy::Fail),
            _dir: dir,
            provider,
            reconciler: Reconciler::new(gateway, event_tx),
        }
    }

    fn state_with(entries: &[(&str, TunnelDescriptor)]) -> RegistryState {
        let mut registry = Registry::new();
        for (url, descriptor) in entries {
            registry.insert(url.to_string(), descriptor.clone());
        }
        RegistryState::new(registry)
    }

    #[tokio::test]
    async fn test_empty_registry_completes_and_persists() {
        let f = fixture();
        let mut state = state_with(&[]);

        let report = f.reconciler.run(&mut state, &f.store).await.unwrap();

        assert_eq!(report.total(), 0);
        assert!(f.store.path().exists());
        assert!(f.store.load().unwrap().is_empty());
        assert_eq!(f.provider.opened().len(), 0);
    }

    #[tokio::test]
    async fn test_url_drift_moves_entry() {
        let f = fixture();
        f.provider.respond("localhost:8080", "http://xyz.example.com");
        let mut state = state_with(&[(
            "http://abc.example.com",
            TunnelDescriptor::new(Protocol::Http, "localhost:8080"),
        )]);

        let report = f.reconciler.run(&mut state, &f.store).await.unwrap();

        assert_eq!(
            report.migrated,
            vec![UrlMigration {
                from: "http://abc.example.com".to_string(),
                to: "http://xyz.example.com".to_string(),
            }]
        );

        let persisted = f.store.load().unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(!persisted.contains("http://abc.example.com"));
        let descriptor = persisted.get("http://xyz.example.com").unwrap();
        assert_eq!(descriptor.protocol, Protocol::Http);
        assert_eq!(descriptor.forwards_to, "localhost:8080");
        assert!(state.listeners.contains_key("http://xyz.example.com"));
    }

    #[tokio::test]
    async fn test_reserved_domain_keeps_url() {
        let f = fixture();
        let mut state = state_with(&[(
            "https://app.example.com",
            TunnelDescriptor::new(Protocol::Http, "localhost:3000").with_domain("app.example.com"),
        )]);

        let report = f.reconciler.run(&mut state, &f.store).await.unwrap();

        assert_eq!(report.unchanged, vec!["https://app.example.com".to_string()]);
        assert!(f.store.load().unwrap().contains("https://app.example.com"));
        assert_eq!(f.provider.opened()[0].domain.as_deref(), Some("app.example.com"));
    }

    #[tokio::test]
    async fn test_reserved_domain_mismatch_is_failure() {
        let f = fixture();
        f.provider.respond("localhost:3000", "https://random-123.example.com");
        let original = TunnelDescriptor::new(Protocol::Http, "localhost:3000").with_domain("app.example.com");
        let mut state = state_with(&[("https://app.example.com", original.clone())]);

        let report = f.reconciler.run(&mut state, &f.store).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("reserved"));
        assert_eq!(
            f.store.load().unwrap().get("https://app.example.com"),
            Some(&original)
        );
        assert!(state.listeners.is_empty());
        assert_eq!(f.provider.closed(), vec!["https://random-123.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let f = fixture();
        f.provider.fail("localhost:9000", "quota exceeded");
        f.provider.respond("localhost:8080", "https://new.example.com");
        let broken = TunnelDescriptor::new(Protocol::Http, "localhost:9000");
        let mut state = state_with(&[
            ("https://broken.example.com", broken.clone()),
            (
                "https://old.example.com",
                TunnelDescriptor::new(Protocol::Http, "localhost:8080"),
            ),
        ]);

        let report = f.reconciler.run(&mut state, &f.store).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].url, "https://broken.example.com");
        assert!(report.failed[0].error.contains("quota exceeded"));
        assert_eq!(report.migrated.len(), 1);

        let persisted = f.store.load().unwrap();
        assert_eq!(persisted.get("https://broken.example.com"), Some(&broken));
        assert!(persisted.contains("https://new.example.com"));
        assert!(!persisted.contains("https://old.example.com"));
    }

    #[tokio::test]
    async fn test_timeout_is_single_entry_failure() {
        let f = fixture();
        f.provider.hang("localhost:7000");
        let mut state = state_with(&[
            ("https://slow.example.com", TunnelDescriptor::new(Protocol::Http, "localhost:7000")),
            ("tcp://0.tcp.example.com:1", TunnelDescriptor::new(Protocol::Tcp, "localhost:22")),
        ]);

        let report = f.reconciler.run(&mut state, &f.store).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("timed out"));
        assert_eq!(report.migrated.len(), 1);
        assert!(f.store.load().unwrap().contains("https://slow.example.com"));
    }

    #[tokio::test]
    async fn test_drift_onto_existing_key_is_failure() {
        let f = fixture();
        f.provider.respond("localhost:1", "https://b.example.com");
        f.provider.respond("localhost:2", "https://b.example.com");
        let mut state = state_with(&[
            ("https://a.example.com", TunnelDescriptor::new(Protocol::Http, "localhost:1")),
            ("https://b.example.com", TunnelDescriptor::new(Protocol::Http, "localhost:2")),
        ]);

        let report = f.reconciler.run(&mut state, &f.store).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].url, "https://a.example.com");
        assert_eq!(report.unchanged, vec!["https://b.example.com".to_string()]);
        assert_eq!(state.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_live_entries_are_skipped_on_rerun() {
        let f = fixture();
        f.provider.fail("localhost:9000", "temporarily unavailable");
        let mut state = state_with(&[
            ("https://a.example.com", TunnelDescriptor::new(Protocol::Http, "localhost:8080")),
            ("https://b.example.com", TunnelDescriptor::new(Protocol::Http, "localhost:9000")),
        ]);

        let first = f.reconciler.run(&mut state, &f.store).await.unwrap();
        assert_eq!(first.failed.len(), 1);

        let second = f.reconciler.run(&mut state, &f.store).await.unwrap();
        assert_eq!(second.skipped.len(), 1);
        assert_eq!(second.migrated.len(), 1);
        assert!(second.is_clean());
        assert_eq!(f.provider.opened().len(), 3);
    }

    #[tokio::test]
    async fn test_protocol_and_target_preserved() {
        let f = fixture();
        let mut state = state_with(&[
            ("tcp://0.tcp.example.com:1", TunnelDescriptor::new(Protocol::Tcp, "localhost:22")),
            ("https://x.example.com", TunnelDescriptor::new(Protocol::Http, "127.0.0.1:5000")),
        ]);
        let before: Vec<(Protocol, String)> = state
            .registry
            .iter()
            .map(|(_, d)| (d.protocol, d.forwards_to.clone()))
            .collect();

        f.reconciler.run(&mut state, &f.store).await.unwrap();

        let after: Vec<(Protocol, String)> = state
            .registry
            .iter()
            .map(|(_, d)| (d.protocol, d.forwards_to.clone()))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_migration_event_is_broadcast() {
        let f = fixture();
        let mut events = f.reconciler.event_tx.subscribe();
        f.provider.respond("localhost:8080", "https://new.example.com");
        let mut state = state_with(&[(
            "https://old.example.com",
            TunnelDescriptor::new(Protocol::Http, "localhost:8080"),
        )]);

        f.reconciler.run(&mut state, &f.store).await.unwrap();

        match events.try_recv().unwrap() {
            TunnelEvent::Migrated { from, to } => {
                assert_eq!(from, "https://old.example.com");
                assert_eq!(to, "https://new.example.com");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
