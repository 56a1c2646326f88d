//! Peer identity and membership records

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Cluster-unique node name
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeName(pub String);

impl NodeName {
    /// `<prefix>-<16 random hex chars>`, unique per process lifetime
    pub fn generate(prefix: &str) -> Self {
        let suffix: [u8; 8] = rand::random();
        Self(format!("{}-{}", prefix, hex::encode(suffix)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Introduction exchanged at the start of every connection and carried
/// in push/pull member lists
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub name: NodeName,
    /// Address peers should dial
    pub addr: SocketAddr,
    /// Application metadata from [`Delegate::node_meta`](crate::Delegate::node_meta)
    pub meta: Vec<u8>,
}

/// A known remote member
#[derive(Clone, Debug)]
pub struct Member {
    pub name: NodeName,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    /// Consecutive failed sends
    pub failures: u32,
    pub last_seen: Instant,
}

impl Member {
    pub fn new(hello: Hello) -> Self {
        Self {
            name: hello.name,
            addr: hello.addr,
            meta: hello.meta,
            failures: 0,
            last_seen: Instant::now(),
        }
    }

    /// Record a successful exchange
    pub fn touch(&mut self) {
        self.failures = 0;
        self.last_seen = Instant::now();
    }

    pub fn hello(&self) -> Hello {
        Hello {
            name: self.name.clone(),
            addr: self.addr,
            meta: self.meta.clone(),
        }
    }
}
