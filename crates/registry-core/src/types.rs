//! Core registry types
//!
//! All maps are ordered so that postcard encodings are deterministic.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form string metadata attached to services, endpoints and instances.
pub type Metadata = BTreeMap<String, String>;

// =============================================================================
// SERVICE DEFINITIONS
// =============================================================================

/// A fully hydrated service definition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub version: String,
    pub metadata: Metadata,
    pub endpoints: Vec<Endpoint>,
    /// Instances, kept sorted by id once stored in an index
    pub nodes: Vec<Node>,
}

/// A single running instance of a service
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub metadata: Metadata,
}

/// An endpoint exposed by a service
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub metadata: Metadata,
}

/// Recursive description of an endpoint's request or response type
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Value {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub values: Vec<Value>,
}

impl Service {
    /// Create a service with no metadata, endpoints or instances
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Add an instance (builder style)
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Find an instance by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            metadata: Metadata::new(),
        }
    }
}

// =============================================================================
// VERSION METADATA
// =============================================================================

/// Per-instance version metadata
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMeta {
    pub enabled: bool,
    /// Local monotonic wall-clock nanoseconds of the last write
    pub modified: i64,
    /// Absolute nanosecond deadline, 0 = never
    pub expiry: i64,
}

impl NodeMeta {
    /// Whether the deadline has passed at `now`
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry != 0 && self.expiry < now
    }
}

/// One (name, version) pair with its version metadata and hydrated snapshot
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEntry {
    pub nodes: BTreeMap<String, NodeMeta>,
    pub modified: i64,
    /// Canonical encoding of the hydrated [`Service`], consistent with `nodes`
    pub raw: Vec<u8>,
}

/// All versions of one service name
pub type Services = BTreeMap<String, ServiceEntry>;

// =============================================================================
// EVENTS
// =============================================================================

/// Kind of visible change produced by a merge
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change describing how a merge altered the visible registry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEvent {
    pub action: Action,
    pub service: Service,
}

impl RegistryEvent {
    pub fn new(action: Action, service: Service) -> Self {
        Self { action, service }
    }
}
