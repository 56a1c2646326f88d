//! Networking primitives for the gossip registry
//!
//! This crate provides:
//! - The delegate contract between a transport and the registry
//! - A retransmit-limited broadcast queue
//! - Length-prefixed framing with optional secret-key sealing
//! - A TCP gossip transport with push/pull anti-entropy

pub mod broadcast;
pub mod crypto;
pub mod delegate;
pub mod framing;
pub mod peer;
pub mod transport;

pub use broadcast::{Broadcast, BroadcastQueue};
pub use crypto::SecretKey;
pub use delegate::Delegate;
pub use framing::{Frame, FrameCodec, FrameType};
pub use peer::{Member, NodeName};
pub use transport::{NetworkMode, Transport, TransportConfig, TransportError};
