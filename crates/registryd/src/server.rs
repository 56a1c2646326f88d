//! registryd server - transport and expiry sweep lifecycle

use crate::config::RegistryOptions;
use crate::gossip::GossipRegistry;
use crate::state::{spawn_expiry_sweep, RegistryState, RegistryStats};
use parking_lot::Mutex;
use registry_net::{BroadcastQueue, Transport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A running registry node
pub struct Server {
    registry: Arc<GossipRegistry>,
    transport: Arc<Transport>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the transport, join the seeds and start background tasks.
    ///
    /// Failing to bind, or to reach any of the configured seeds, is fatal.
    pub async fn start(options: RegistryOptions) -> Result<Self, ServerError> {
        let state = Arc::new(RegistryState::new());
        let queue = Arc::new(BroadcastQueue::new(options.retransmit_mult));
        let registry = Arc::new(GossipRegistry::new(state.clone(), queue));

        let transport = Transport::bind(options.transport_config(), registry.clone()).await?;
        let mut handles = transport.start();

        if !options.seeds.is_empty() {
            match transport.join(&options.seeds).await {
                Ok(joined) => info!("Joined {} of {} seed(s)", joined, options.seeds.len()),
                Err(e) => {
                    transport.shutdown();
                    return Err(e.into());
                }
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        handles.push(spawn_expiry_sweep(
            state,
            options.expiry_tick,
            shutdown_tx.subscribe(),
        ));

        info!(
            "Registry node {} up on {} ({:?} profile)",
            options.name,
            transport.advertise_addr(),
            options.mode
        );

        Ok(Self {
            registry,
            transport,
            handles: Mutex::new(handles),
            shutdown_tx,
        })
    }

    /// Registry API for this node
    pub fn registry(&self) -> &Arc<GossipRegistry> {
        &self.registry
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.transport.advertise_addr()
    }

    /// Run until ctrl-c or [`Server::shutdown`]
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
            _ = shutdown_rx.recv() => {}
        }

        self.stop().await;
        Ok(())
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stop every background task and wait for them to exit
    pub async fn stop(&self) {
        info!("Shutting down...");
        self.transport.shutdown();
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task failed: {}", e);
            }
        }
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            members: self.transport.num_members(),
            pending_broadcasts: self.registry.queue().len(),
            registry: self.registry.state().stats(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Known members including this node
    pub members: usize,
    pub pending_broadcasts: usize,
    pub registry: RegistryStats,
}
