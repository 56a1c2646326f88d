//! Versioned service index with last-writer-wins merge
//!
//! The index is the unit exchanged between nodes: a full snapshot for
//! anti-entropy, or a fragment holding a single (name, version) for one
//! local change. Merging is idempotent and commutative up to timestamp
//! ties, so replicas that see the same fragments converge.

use crate::canonical::{self, canonical_bytes, decode_service, from_canonical_bytes};
use crate::clock::{self, Ttl};
use crate::error::{Error, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every known service: name -> version -> entry
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Index {
    pub services: BTreeMap<String, Services>,
}

/// Outcome of applying a local change
#[derive(Clone, Debug)]
pub struct Applied {
    /// Visible changes caused by the write
    pub events: Vec<RegistryEvent>,
    /// Fragment to disseminate to peers
    pub fragment: Index,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single (name, version) index
    pub fn fragment(name: &str, version: &str, entry: ServiceEntry) -> Self {
        let mut versions = Services::new();
        versions.insert(version.to_string(), entry);
        let mut services = BTreeMap::new();
        services.insert(name.to_string(), versions);
        Self { services }
    }

    /// Register every instance of `service` as enabled.
    pub fn add(&mut self, service: &Service, ttl: Ttl) -> Result<Applied> {
        let now = clock::next_modified();
        let expiry = ttl.deadline(now);

        let mut service = service.clone();
        canonical::normalize_service(&mut service);

        let nodes = service
            .nodes
            .iter()
            .map(|node| {
                let meta = NodeMeta {
                    enabled: true,
                    modified: now,
                    expiry,
                };
                (node.id.clone(), meta)
            })
            .collect();

        let entry = ServiceEntry {
            nodes,
            modified: now,
            raw: canonical_bytes(&service)?,
        };
        let fragment = Index::fragment(&service.name, &service.version, entry);
        let events = self.merge(&fragment)?;
        Ok(Applied { events, fragment })
    }

    /// Disable every instance of `service`; the stored snapshot keeps the
    /// definition with an empty instance list.
    pub fn remove(&mut self, service: &Service) -> Result<Applied> {
        let now = clock::next_modified();

        let nodes = service
            .nodes
            .iter()
            .map(|node| {
                let meta = NodeMeta {
                    enabled: false,
                    modified: now,
                    expiry: 0,
                };
                (node.id.clone(), meta)
            })
            .collect();

        let mut cleared = service.clone();
        cleared.nodes.clear();

        let entry = ServiceEntry {
            nodes,
            modified: now,
            raw: canonical_bytes(&cleared)?,
        };
        let fragment = Index::fragment(&service.name, &service.version, entry);
        let events = self.merge(&fragment)?;
        Ok(Applied { events, fragment })
    }

    /// Merge another index into this one, returning the visible changes.
    ///
    /// Every touched entry is merged into a staged copy first; the index is
    /// only written once all of them succeeded, so a malformed fragment
    /// leaves it unchanged.
    pub fn merge(&mut self, incoming: &Index) -> Result<Vec<RegistryEvent>> {
        let mut staged = Vec::new();
        for (name, versions) in &incoming.services {
            for (version, entry) in versions {
                let theirs = decode_service(&entry.raw).map_err(|source| Error::MalformedSnapshot {
                    name: name.clone(),
                    version: version.clone(),
                    source,
                })?;

                let mut local = self.get_service(name, version).cloned().unwrap_or_default();
                let event = merge_entry(&mut local, entry, &theirs)?;
                staged.push((name.clone(), version.clone(), local, event));
            }
        }

        Ok(self.commit(staged))
    }

    /// Materialized view: name -> visible versions (ascending), never empty.
    pub fn to_map(&self) -> Result<BTreeMap<String, Vec<Service>>> {
        let mut map = BTreeMap::new();

        for (name, versions) in &self.services {
            let mut visible = Vec::with_capacity(versions.len());
            for entry in versions.values() {
                let service = decode_service(&entry.raw)?;
                if service.nodes.is_empty() {
                    continue;
                }
                visible.push(service);
            }

            if !visible.is_empty() {
                map.insert(name.clone(), visible);
            }
        }

        Ok(map)
    }

    /// Direct lookup of one (name, version) entry
    pub fn get_service(&self, name: &str, version: &str) -> Option<&ServiceEntry> {
        self.services.get(name)?.get(version)
    }

    /// Expire lapsed instances.
    ///
    /// Each entry holding a lapsed instance is staged with those instances
    /// disabled, timestamps untouched, then reconciled against that staged
    /// copy: equal timestamps satisfy `modified <= modified`, so the disabled
    /// instances leave the hydrated list. Nothing is written unless every
    /// staged entry reconciled.
    pub fn clean(&mut self) -> Result<Vec<RegistryEvent>> {
        let now = clock::wall_nanos();

        let mut staged = Vec::new();
        for (name, versions) in &self.services {
            for (version, entry) in versions {
                if !entry.nodes.values().any(|meta| meta.enabled && meta.is_expired(now)) {
                    continue;
                }

                let mut expired = entry.clone();
                for meta in expired.nodes.values_mut() {
                    if meta.is_expired(now) {
                        meta.enabled = false;
                    }
                }

                let snapshot = expired.clone();
                let service = decode_service(&snapshot.raw)?;
                let event = merge_entry(&mut expired, &snapshot, &service)?;
                staged.push((name.clone(), version.clone(), expired, event));
            }
        }

        Ok(self.commit(staged))
    }

    /// Encode the index as a wire fragment
    pub fn encode(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }

    /// Decode a wire fragment
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_canonical_bytes(bytes)
    }

    /// Number of (name, version) entries, visible or not
    pub fn len(&self) -> usize {
        self.services.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&mut self, staged: Vec<Staged>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        for (name, version, entry, event) in staged {
            self.services.entry(name).or_default().insert(version, entry);
            events.extend(event);
        }
        events
    }
}

/// A merged entry waiting to be written back, with its visible change
type Staged = (String, String, ServiceEntry, Option<RegistryEvent>);

/// Merge one incoming entry into the local one, returning the visible change.
fn merge_entry(
    local: &mut ServiceEntry,
    incoming: &ServiceEntry,
    theirs: &Service,
) -> Result<Option<RegistryEvent>> {
    let mut ours = decode_service(&local.raw)?;
    let before = ours.clone();

    // Ties favor the incoming side
    if local.modified <= incoming.modified {
        ours.name = theirs.name.clone();
        ours.version = theirs.version.clone();
        ours.endpoints = theirs.endpoints.clone();
        ours.metadata = theirs.metadata.clone();
        local.modified = incoming.modified;
    }

    for (id, meta) in &incoming.nodes {
        let current = local.nodes.entry(id.clone()).or_insert(*meta);
        if current.modified > meta.modified {
            continue;
        }
        *current = *meta;

        let position = ours.nodes.iter().position(|n| &n.id == id);
        let record = theirs.node(id);

        match (position, meta.enabled, record) {
            (None, true, Some(record)) => ours.nodes.push(record.clone()),
            (Some(i), true, Some(record)) => {
                let node = &mut ours.nodes[i];
                node.address = record.address.clone();
                node.port = record.port;
                node.metadata = record.metadata.clone();
            }
            (Some(i), false, _) => {
                ours.nodes.remove(i);
            }
            _ => {}
        }
    }

    canonical::normalize_service(&mut ours);
    local.raw = canonical_bytes(&ours)?;

    Ok(classify(&before, ours))
}

/// Emit a change only when the hydrated definition differs and the service
/// was or is visible.
fn classify(before: &Service, after: Service) -> Option<RegistryEvent> {
    let previous = before.nodes.len();
    let current = after.nodes.len();

    if *before == after || (previous == 0 && current == 0) {
        return None;
    }

    let action = if current == 0 {
        Action::Delete
    } else if previous == 0 {
        Action::Create
    } else {
        Action::Update
    };
    Some(RegistryEvent::new(action, after))
}
