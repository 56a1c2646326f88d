//! Gossip adapter
//!
//! Binds [`RegistryState`] to a transport: local writes are queued as
//! broadcasts, inbound payloads are merged. Bad inbound bytes are logged and
//! dropped; nothing here panics on peer input.

use crate::state::{RegisterOptions, RegistryError, RegistryState};
use crate::watch::Watcher;
use registry_core::Service;
use registry_net::{Broadcast, BroadcastQueue, Delegate};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Adapter errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("registering service: {0}")]
    Register(#[source] RegistryError),
    #[error("deregistering service: {0}")]
    Deregister(#[source] RegistryError),
}

/// An encoded index fragment queued for dissemination.
///
/// Fragments never supersede each other: each carries its own entries.
pub struct RegistryBroadcast(Vec<u8>);

impl RegistryBroadcast {
    pub fn new(fragment: Vec<u8>) -> Self {
        Self(fragment)
    }
}

impl Broadcast for RegistryBroadcast {
    fn invalidates(&self, _other: &dyn Broadcast) -> bool {
        false
    }

    fn message(&self) -> &[u8] {
        &self.0
    }
}

/// Registry state wired to a broadcast queue
pub struct GossipRegistry {
    state: Arc<RegistryState>,
    queue: Arc<BroadcastQueue>,
}

impl GossipRegistry {
    pub fn new(state: Arc<RegistryState>, queue: Arc<BroadcastQueue>) -> Self {
        Self { state, queue }
    }

    pub fn state(&self) -> &Arc<RegistryState> {
        &self.state
    }

    pub fn queue(&self) -> &Arc<BroadcastQueue> {
        &self.queue
    }

    /// Register locally and gossip the change
    pub fn register(&self, service: &Service, options: RegisterOptions) -> Result<(), GossipError> {
        let fragment = self
            .state
            .register(service, options)
            .map_err(GossipError::Register)?;
        self.queue.queue(Box::new(RegistryBroadcast::new(fragment)));
        Ok(())
    }

    /// Deregister locally and gossip the change
    pub fn deregister(&self, service: &Service) -> Result<(), GossipError> {
        let fragment = self
            .state
            .deregister(service)
            .map_err(GossipError::Deregister)?;
        self.queue.queue(Box::new(RegistryBroadcast::new(fragment)));
        Ok(())
    }

    pub fn list_services(&self) -> Vec<Service> {
        self.state.list_services()
    }

    pub fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        self.state.get_service(name)
    }

    pub fn watch(&self) -> Watcher {
        self.state.watch()
    }
}

impl Delegate for GossipRegistry {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        if msg.is_empty() {
            return;
        }
        if let Err(e) = self.state.merge_remote(msg) {
            error!("Failed to merge broadcast ({} bytes): {}", msg.len(), e);
        }
    }

    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.queue.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        match self.state.local_state() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode local state: {}", e);
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() {
            return;
        }
        match self.state.merge_remote(buf) {
            Ok(()) => debug!(join, "Merged remote state ({} bytes)", buf.len()),
            Err(e) => error!("Failed to merge remote state: {}", e),
        }
    }

    fn notify_members(&self, num_members: usize) {
        self.queue.set_num_nodes(num_members);
    }
}
