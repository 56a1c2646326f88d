//! registryd - gossip-propagated service registry
//!
//! This crate provides:
//! - The registry state: local writes, reads, expiry and change publication
//! - Change subscriptions with bounded, drop-oldest delivery
//! - The gossip adapter binding the state to a transport
//! - The daemon configuration and server loop

pub mod config;
pub mod gossip;
pub mod server;
pub mod state;
pub mod watch;

pub use config::{Config, RegistryOptions};
pub use gossip::{GossipError, GossipRegistry, RegistryBroadcast};
pub use server::{Server, ServerError};
pub use state::{RegisterOptions, RegistryError, RegistryState, RegistryStats};
pub use watch::{StopHandle, WatchError, Watcher, Watchers};
