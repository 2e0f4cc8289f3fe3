// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Tunnel Service
// Owns the registry, the live listeners, and the write-through store

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use tunnel_registry_common::{
    CreateTunnelRequest, MatchMode, ReconcileReport, Registry, RegistryStore, Result,
    TunnelDescriptor, TunnelEntry, TunnelEvent,
};

use crate::provider::{close_quietly, Gateway, Listener, ListenerSpec};
use crate::reconcile::{listener_metadata, Reconciler};

/// Registry plus the listeners opened by this process
pub struct RegistryState {
    pub registry: Registry,
    /// Live provider listeners indexed by public URL
    pub listeners: HashMap<String, Box<dyn Listener>>,
}

impl RegistryState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            listeners: HashMap::new(),
        }
    }
}

/// Manages all registered tunnels
///
/// Cloning is cheap; every clone shares the same state. The state mutex is
/// the single writer lock: each load-modify-save cycle runs while holding it.
#[derive(Clone)]
pub struct TunnelService {
    state: Arc<Mutex<RegistryState>>,
    store: Arc<RegistryStore>,
    gateway: Arc<Gateway>,
    reconciler: Arc<Reconciler>,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelService {
    pub fn new(store: RegistryStore, gateway: Gateway) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let gateway = Arc::new(gateway);
        Self {
            state: Arc::new(Mutex::new(RegistryState::new(Registry::new()))),
            store: Arc::new(store),
            reconciler: Arc::new(Reconciler::new(gateway.clone(), event_tx.clone())),
            gateway,
            event_tx,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    fn emit(&self, event: TunnelEvent) {
        if let Err(e) = self.event_tx.send(event) {
            debug!("No event subscribers: {}", e);
        }
    }

    /// Load persisted state and reconcile it against the provider
    ///
    /// Must finish before the API starts serving requests.
    pub async fn initialize(&self) -> Result<ReconcileReport> {
        let registry = self.store.load()?;
        info!(
            "Loaded {} tunnel(s) from {}",
            registry.len(),
            self.store.path().display()
        );

        let mut state = self.state.lock().await;
        *state = RegistryState::new(registry);
        self.reconciler.run(&mut state, &self.store).await
    }

    /// Retry reconciliation for entries without a live listener
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut state = self.state.lock().await;
        self.reconciler.run(&mut state, &self.store).await
    }

    /// All registered tunnels in registry order
    pub async fn list(&self) -> Vec<TunnelEntry> {
        let state = self.state.lock().await;
        state.registry.entries()
    }

    /// URLs with a listener currently open in this process
    pub async fn live_urls(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.listeners.keys().cloned().collect()
    }

    /// Open a new listener and register it under its assigned URL
    ///
    /// If persisting fails the tunnel stays registered in memory and live,
    /// and the storage error is returned.
    pub async fn create(&self, request: CreateTunnelRequest) -> Result<TunnelEntry> {
        request.validate()?;

        let spec = ListenerSpec {
            protocol: request.protocol,
            forwards_to: request.forwards_to.clone(),
            domain: request.domain.clone(),
            metadata: request.metadata.clone(),
        };

        // Provider round trip happens outside the registry lock
        let listener = self.gateway.open(&spec).await?;
        let url = listener.url().to_string();
        let descriptor = TunnelDescriptor {
            protocol: request.protocol,
            forwards_to: request.forwards_to,
            domain: request.domain,
            metadata: listener_metadata(listener.as_ref()).or(request.metadata),
        };

        let (saved, replaced) = {
            let mut state = self.state.lock().await;
            if state.registry.insert(url.clone(), descriptor.clone()).is_some() {
                warn!("Provider reissued {}, replacing the existing entry", url);
            }
            let replaced = state.listeners.insert(url.clone(), listener);
            (self.store.persist(&state.registry).await, replaced)
        };

        if let Some(old) = replaced {
            close_quietly(old).await;
        }

        let entry = TunnelEntry { url, descriptor };
        info!(
            "Created {} tunnel {} -> {}",
            entry.descriptor.protocol, entry.url, entry.descriptor.forwards_to
        );
        self.emit(TunnelEvent::Created {
            entry: entry.clone(),
        });

        saved?;
        Ok(entry)
    }

    /// Remove the entry matching `query` and close its listener
    pub async fn delete(&self, query: &str, mode: MatchMode) -> Result<TunnelEntry> {
        let (entry, listener, saved) = {
            let mut state = self.state.lock().await;
            let url = state.registry.resolve(query, mode)?;
            let descriptor = state
                .registry
                .remove(&url)
                .ok_or_else(|| tunnel_registry_common::Error::NotFound(query.to_string()))?;
            let listener = state.listeners.remove(&url);
            let saved = self.store.persist(&state.registry).await;
            (TunnelEntry { url, descriptor }, listener, saved)
        };

        match listener {
            Some(listener) => close_quietly(listener).await,
            None => debug!("Tunnel {} had no live listener", entry.url),
        }

        info!("Deleted tunnel {}", entry.url);
        self.emit(TunnelEvent::Deleted {
            url: entry.url.clone(),
        });

        saved?;
        Ok(entry)
    }

    /// Close every live listener, keeping the registry for the next start
    pub async fn close_all(&self) {
        let listeners: Vec<Box<dyn Listener>> = {
            let mut state = self.state.lock().await;
            state.listeners.drain().map(|(_, l)| l).collect()
        };

        for listener in listeners {
            close_quietly(listener).await;
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;
    use tunnel_registry_common::{CorruptStatePolicy, Error, Protocol};

    use crate::provider::scripted::ScriptedProvider;

    pub fn service_in(dir: &TempDir, provider: &ScriptedProvider) -> TunnelService {
        let store = RegistryStore::new(dir.path().join("tunnels.json"), CorruptStatePolicy::Fail);
        let gateway = Gateway::new(
            Arc::new(provider.clone()),
            Duration::from_secs(1),
            Duration::from_millis(200),
        );
        TunnelService::new(store, gateway)
    }

    fn request(protocol: Protocol, forwards_to: &str) -> CreateTunnelRequest {
        CreateTunnelRequest {
            protocol,
            forwards_to: forwards_to.to_string(),
            domain: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_initialize_with_empty_storage() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        let service = service_in(&dir, &provider);

        let report = service.initialize().await.unwrap();

        assert_eq!(report.total(), 0);
        assert!(service.list().await.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("tunnels.json")).unwrap().trim(),
            "{}"
        );
    }

    #[tokio::test]
    async fn test_initialize_fails_on_corrupt_state() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tunnels.json"), "not json").unwrap();
        let service = service_in(&dir, &ScriptedProvider::new());

        assert!(matches!(
            service.initialize().await,
            Err(Error::CorruptState { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_tcp_tunnel() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        provider.respond("localhost:22", "tcp://4.tcp.example.com:12345");
        let service = service_in(&dir, &provider);
        service.initialize().await.unwrap();

        let entry = service
            .create(request(Protocol::Tcp, "localhost:22"))
            .await
            .unwrap();

        assert_eq!(entry.url, "tcp://4.tcp.example.com:12345");
        assert_eq!(entry.descriptor.protocol, Protocol::Tcp);
        assert_eq!(entry.descriptor.metadata.as_deref(), Some("scripted tcp listener"));

        let listed = service.list().await;
        assert_eq!(listed, vec![entry.clone()]);

        // Persisted immediately
        let store = RegistryStore::new(dir.path().join("tunnels.json"), CorruptStatePolicy::Fail);
        assert_eq!(store.load().unwrap().get(&entry.url), Some(&entry.descriptor));
    }

    #[tokio::test]
    async fn test_create_allows_duplicate_targets() {
        let dir = TempDir::new().unwrap();
        let service = service_in(&dir, &ScriptedProvider::new());

        service.create(request(Protocol::Http, "localhost:8080")).await.unwrap();
        service.create(request(Protocol::Http, "localhost:8080")).await.unwrap();

        assert_eq!(service.list().await.len(), 2);
        assert_eq!(service.live_urls().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_are_all_persisted() {
        const TUNNELS: u16 = 8;

        let dir = TempDir::new().unwrap();
        let service = service_in(&dir, &ScriptedProvider::new());
        service.initialize().await.unwrap();

        let handles: Vec<_> = (0..TUNNELS)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .create(request(Protocol::Http, &format!("localhost:{}", 8000 + i)))
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let listed = service.list().await;
        assert_eq!(listed.len(), TUNNELS as usize);

        let store = RegistryStore::new(dir.path().join("tunnels.json"), CorruptStatePolicy::Fail);
        let persisted = store.load().unwrap();
        assert_eq!(persisted.len(), TUNNELS as usize);
        for entry in &listed {
            assert_eq!(persisted.get(&entry.url), Some(&entry.descriptor));
        }
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_request_before_provider() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        let service = service_in(&dir, &provider);

        let result = service.create(request(Protocol::Http, "no-port")).await;

        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert_eq!(provider.connects(), 0);
    }

    #[tokio::test]
    async fn test_create_surfaces_provider_error() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        provider.fail("localhost:8080", "account limit reached");
        let service = service_in(&dir, &provider);

        let result = service.create(request(Protocol::Http, "localhost:8080")).await;

        assert!(matches!(result, Err(Error::Provider(_))));
        assert!(service.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_in_memory_entry() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let store = RegistryStore::new(blocker.join("tunnels.json"), CorruptStatePolicy::Fail);
        let gateway = Gateway::new(
            Arc::new(ScriptedProvider::new()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let service = TunnelService::new(store, gateway);

        let result = service.create(request(Protocol::Http, "localhost:8080")).await;

        assert!(matches!(result, Err(Error::StorageWrite { .. })));
        assert_eq!(service.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_substring_closes_listener() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        provider.respond("localhost:8080", "https://abc.example.com");
        provider.respond("localhost:8081", "https://xyz.example.com");
        let service = service_in(&dir, &provider);

        service.create(request(Protocol::Http, "localhost:8080")).await.unwrap();
        service.create(request(Protocol::Http, "localhost:8081")).await.unwrap();

        let deleted = service.delete("abc", MatchMode::Fuzzy).await.unwrap();

        assert_eq!(deleted.url, "https://abc.example.com");
        let remaining: Vec<String> = service.list().await.into_iter().map(|e| e.url).collect();
        assert_eq!(remaining, vec!["https://xyz.example.com".to_string()]);
        assert_eq!(provider.closed(), vec!["https://abc.example.com".to_string()]);

        let store = RegistryStore::new(dir.path().join("tunnels.json"), CorruptStatePolicy::Fail);
        assert!(!store.load().unwrap().contains("https://abc.example.com"));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let service = service_in(&dir, &ScriptedProvider::new());
        service.create(request(Protocol::Http, "localhost:8080")).await.unwrap();

        let result = service.delete("does-not-exist", MatchMode::Fuzzy).await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(service.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_ambiguous_removes_nothing() {
        let dir = TempDir::new().unwrap();
        let service = service_in(&dir, &ScriptedProvider::new());
        service.create(request(Protocol::Http, "localhost:8080")).await.unwrap();
        service.create(request(Protocol::Http, "localhost:8081")).await.unwrap();

        let result = service.delete("scripted.test", MatchMode::Fuzzy).await;

        assert!(matches!(result, Err(Error::Ambiguous { .. })));
        assert_eq!(service.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_restart_reconciles_persisted_tunnels() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        let first = service_in(&dir, &provider);
        first.initialize().await.unwrap();
        let created = first
            .create(request(Protocol::Http, "localhost:8080"))
            .await
            .unwrap();
        first.close_all().await;
        drop(first);

        provider.respond("localhost:8080", "https://after-restart.example.com");
        let second = service_in(&dir, &provider);
        let report = second.initialize().await.unwrap();

        assert_eq!(report.migrated.len(), 1);
        assert_eq!(report.migrated[0].from, created.url);
        let urls: Vec<String> = second.list().await.into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["https://after-restart.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_close_all_keeps_registry() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new();
        let service = service_in(&dir, &provider);
        service.create(request(Protocol::Http, "localhost:8080")).await.unwrap();

        service.close_all().await;

        assert!(service.live_urls().await.is_empty());
        assert_eq!(service.list().await.len(), 1);
        assert_eq!(provider.closed().len(), 1);
    }

    #[tokio::test]
    async fn test_events_for_create_and_delete() {
        let dir = TempDir::new().unwrap();
        let service = service_in(&dir, &ScriptedProvider::new());
        let mut events = service.subscribe();

        let entry = service.create(request(Protocol::Http, "localhost:8080")).await.unwrap();
        service.delete(&entry.url, MatchMode::Exact).await.unwrap();

        assert!(matches!(events.try_recv().unwrap(), TunnelEvent::Created { .. }));
        match events.try_recv().unwrap() {
            TunnelEvent::Deleted { url } => assert_eq!(url, entry.url),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
