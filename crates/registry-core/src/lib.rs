//! Gossip Registry Core Library
//!
//! This crate provides the data model, canonical encoding and merge engine
//! for a gossip-propagated service registry.
//!
//! # Modules
//!
//! - [`types`]: Service definitions, per-instance version metadata, events
//! - [`index`]: The versioned index and its last-writer-wins merge
//! - [`canonical`]: Deterministic serialization of services and fragments
//! - [`clock`]: Monotonic nanosecond timestamps and registration TTLs
//! - [`error`]: Error types

pub mod canonical;
pub mod clock;
pub mod error;
pub mod index;
pub mod types;

pub use clock::Ttl;
pub use error::{Error, Result};
pub use index::{Applied, Index};
pub use types::*;
