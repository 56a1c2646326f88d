//! Registry state
//!
//! Owns the index and its materialized view behind one lock. Index writes
//! are all-or-nothing, and the view is patched from the events each write
//! produces. Events are published before the lock is released so
//! subscribers see them in commit order.

use crate::watch::{Watcher, Watchers};
use parking_lot::RwLock;
use registry_core::{Action, Applied, Index, RegistryEvent, Service, Ttl};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

/// Registry state errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] registry_core::Error),
    #[error("service not found: {0}")]
    NotFound(String),
}

/// Per-registration options
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterOptions {
    /// Lifetime of the registration, [`Ttl::NEVER`] by default
    pub ttl: Ttl,
}

impl RegisterOptions {
    pub fn with_ttl(ttl: impl Into<Ttl>) -> Self {
        Self { ttl: ttl.into() }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Names with at least one visible version
    pub names: usize,
    /// Visible (name, version) pairs
    pub services: usize,
    /// Visible instances across all services
    pub instances: usize,
    pub watchers: usize,
}

/// name -> version -> visible service
type View = BTreeMap<String, BTreeMap<String, Service>>;

#[derive(Default)]
struct Inner {
    index: Index,
    view: View,
}

/// Shared registry state
pub struct RegistryState {
    inner: RwLock<Inner>,
    watchers: Arc<Watchers>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            watchers: Watchers::new(),
        }
    }

    /// Register a service locally, returning the encoded fragment to gossip
    pub fn register(
        &self,
        service: &Service,
        options: RegisterOptions,
    ) -> Result<Vec<u8>, RegistryError> {
        self.apply(|index| index.add(service, options.ttl))
    }

    /// Deregister a service locally, returning the encoded fragment to gossip
    pub fn deregister(&self, service: &Service) -> Result<Vec<u8>, RegistryError> {
        self.apply(|index| index.remove(service))
    }

    /// Merge a fragment or full snapshot received from a peer
    pub fn merge_remote(&self, bytes: &[u8]) -> Result<(), RegistryError> {
        let incoming = Index::decode(bytes)?;
        self.commit(|index| Ok((index.merge(&incoming)?, ())))
    }

    /// Encoded snapshot of the whole index
    pub fn local_state(&self) -> Result<Vec<u8>, RegistryError> {
        Ok(self.inner.read().index.encode()?)
    }

    /// Every visible service version
    pub fn list_services(&self) -> Vec<Service> {
        self.inner
            .read()
            .view
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    /// Visible versions of one service
    pub fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        self.inner
            .read()
            .view
            .get(name)
            .map(|versions| versions.values().cloned().collect())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Expire lapsed instances
    pub fn clean(&self) -> Result<(), RegistryError> {
        self.commit(|index| Ok((index.clean()?, ())))
    }

    /// Subscribe to changes
    pub fn watch(&self) -> Watcher {
        self.watchers.subscribe()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let services = inner.view.values().map(BTreeMap::len).sum();
        let instances = inner
            .view
            .values()
            .flat_map(BTreeMap::values)
            .map(|service| service.nodes.len())
            .sum();

        RegistryStats {
            names: inner.view.len(),
            services,
            instances,
            watchers: self.watchers.len(),
        }
    }

    fn apply<F>(&self, change: F) -> Result<Vec<u8>, RegistryError>
    where
        F: FnOnce(&mut Index) -> registry_core::Result<Applied>,
    {
        self.commit(|index| {
            let Applied { events, fragment } = change(index)?;
            Ok((events, fragment.encode()?))
        })
    }

    fn commit<T, F>(&self, change: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Index) -> registry_core::Result<(Vec<RegistryEvent>, T)>,
    {
        let mut inner = self.inner.write();

        let (events, output) = change(&mut inner.index)?;
        apply_events(&mut inner.view, &events);

        if !events.is_empty() {
            debug!(changes = events.len(), "Registry updated");
        }
        self.watchers.publish(&events);

        Ok(output)
    }
}

/// Patch the view with visible changes. Every hydrated change to a visible
/// service produces an event, so the view tracks `Index::to_map`.
fn apply_events(view: &mut View, events: &[RegistryEvent]) {
    for event in events {
        let name = &event.service.name;
        let version = &event.service.version;
        match event.action {
            Action::Create | Action::Update => {
                view.entry(name.clone())
                    .or_default()
                    .insert(version.clone(), event.service.clone());
            }
            Action::Delete => {
                if let Some(versions) = view.get_mut(name) {
                    versions.remove(version);
                    if versions.is_empty() {
                        view.remove(name);
                    }
                }
            }
        }
    }
}

/// Run [`RegistryState::clean`] every `tick` until shutdown
pub fn spawn_expiry_sweep(
    state: Arc<RegistryState>,
    tick: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tick);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = state.clean() {
                        warn!("Expiry sweep failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::Node;

    fn service(name: &str) -> Service {
        Service::new(name, "1.0.0").with_node(Node::new("node-1", "127.0.0.1", 8080))
    }

    #[test]
    fn test_register_and_lookup() {
        let state = RegistryState::new();
        let mut watcher = state.watch();

        let fragment = state.register(&service("foo"), RegisterOptions::default()).unwrap();
        assert!(!fragment.is_empty());

        let event = watcher.try_next().unwrap().unwrap();
        assert_eq!(event.action, Action::Create);
        assert_eq!(event.service.name, "foo");

        let found = state.get_service("foo").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nodes.len(), 1);
        assert_eq!(state.list_services().len(), 1);
    }

    #[test]
    fn test_deregister_removes_from_view() {
        let state = RegistryState::new();
        state.register(&service("foo"), RegisterOptions::default()).unwrap();
        let mut watcher = state.watch();

        state.deregister(&service("foo")).unwrap();

        let event = watcher.try_next().unwrap().unwrap();
        assert_eq!(event.action, Action::Delete);
        assert!(event.service.nodes.is_empty());
        assert!(matches!(state.get_service("foo"), Err(RegistryError::NotFound(_))));
        assert!(state.list_services().is_empty());
    }

    #[test]
    fn test_unknown_service_not_found() {
        let state = RegistryState::new();
        match state.get_service("missing") {
            Err(RegistryError::NotFound(name)) => assert_eq!(name, "missing"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_fragment_propagates_to_peer() {
        let a = RegistryState::new();
        let b = RegistryState::new();
        let mut watcher = b.watch();

        let fragment = a.register(&service("foo"), RegisterOptions::default()).unwrap();
        b.merge_remote(&fragment).unwrap();

        assert_eq!(b.list_services(), a.list_services());
        assert_eq!(watcher.try_next().unwrap().unwrap().action, Action::Create);

        // Redelivery changes nothing
        b.merge_remote(&fragment).unwrap();
        assert!(watcher.try_next().unwrap().is_none());
    }

    #[test]
    fn test_full_state_exchange() {
        let a = RegistryState::new();
        a.register(&service("foo"), RegisterOptions::default()).unwrap();
        a.register(&service("bar"), RegisterOptions::default()).unwrap();

        let b = RegistryState::new();
        b.merge_remote(&a.local_state().unwrap()).unwrap();

        assert_eq!(b.list_services(), a.list_services());
        assert_eq!(b.local_state().unwrap(), a.local_state().unwrap());
    }

    #[test]
    fn test_malformed_bytes_rejected() {
        let state = RegistryState::new();
        state.register(&service("foo"), RegisterOptions::default()).unwrap();
        let before = state.local_state().unwrap();
        let mut watcher = state.watch();

        assert!(matches!(
            state.merge_remote(&[0xff, 0xff, 0xff]),
            Err(RegistryError::Encoding(_))
        ));
        assert_eq!(state.local_state().unwrap(), before);
        assert!(watcher.try_next().unwrap().is_none());
    }

    #[test]
    fn test_clean_expires_lapsed_registration() {
        let state = RegistryState::new();
        state
            .register(&service("foo"), RegisterOptions::with_ttl(Ttl::lapsed(Duration::from_secs(1))))
            .unwrap();
        state
            .register(&service("bar"), RegisterOptions::with_ttl(Duration::from_secs(3600)))
            .unwrap();
        let mut watcher = state.watch();

        state.clean().unwrap();

        let event = watcher.try_next().unwrap().unwrap();
        assert_eq!(event.action, Action::Delete);
        assert_eq!(event.service.name, "foo");
        assert!(watcher.try_next().unwrap().is_none());
        assert!(state.get_service("foo").is_err());
        assert!(state.get_service("bar").is_ok());
    }

    #[test]
    fn test_stats() {
        let state = RegistryState::new();
        let _watcher = state.watch();
        state
            .register(
                &service("foo").with_node(Node::new("node-2", "127.0.0.1", 8081)),
                RegisterOptions::default(),
            )
            .unwrap();
        state.register(&service("bar"), RegisterOptions::default()).unwrap();

        assert_eq!(
            state.stats(),
            RegistryStats {
                names: 2,
                services: 2,
                instances: 3,
                watchers: 1,
            }
        );
    }

    #[test]
    fn test_view_tracks_index() {
        let state = RegistryState::new();
        let peer = RegistryState::new();

        let v2 = Service::new("foo", "2.0.0").with_node(Node::new("node-9", "10.0.0.9", 9000));
        state.register(&service("foo"), RegisterOptions::default()).unwrap();
        state.register(&v2, RegisterOptions::default()).unwrap();
        state
            .register(&service("bar"), RegisterOptions::with_ttl(Ttl::lapsed(Duration::from_secs(1))))
            .unwrap();
        peer.register(&service("baz"), RegisterOptions::default()).unwrap();
        state.merge_remote(&peer.local_state().unwrap()).unwrap();
        state.deregister(&v2).unwrap();
        state.clean().unwrap();

        let inner = state.inner.read();
        let rebuilt: Vec<Service> = inner.index.to_map().unwrap().into_values().flatten().collect();
        drop(inner);

        assert_eq!(state.list_services(), rebuilt);
        let names: Vec<_> = rebuilt.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["baz", "foo"]);
    }

    #[tokio::test]
    async fn test_watcher_awaits_concurrent_register() {
        let state = Arc::new(RegistryState::new());
        let mut watcher = state.watch();

        let writer = {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                state.register(&service("foo"), RegisterOptions::default()).unwrap();
            })
        };

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.next())
            .await
            .expect("register not observed")
            .unwrap();
        assert_eq!(event.action, Action::Create);
        assert_eq!(event.service.name, "foo");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_expiry_sweep_runs() {
        let state = Arc::new(RegistryState::new());
        state
            .register(&service("foo"), RegisterOptions::with_ttl(Duration::from_millis(50)))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_expiry_sweep(state.clone(), Duration::from_millis(20), shutdown_rx);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.get_service("foo").is_ok() {
            assert!(tokio::time::Instant::now() < deadline, "registration never expired");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }
}
