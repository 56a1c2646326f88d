//! Canonical encoding for registry snapshots and fragments
//!
//! Snapshots and fragments use postcard serialization with two constraints:
//! - Maps are ordered (`BTreeMap`)
//! - Instance lists are sorted by id and deduped
//!
//! Together these make every replica that holds the same logical state
//! hold byte-identical snapshots.

use crate::error::Result;
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(value)?)
}

/// Deserialize a value from canonical bytes.
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Decode a stored service snapshot. An absent snapshot is an empty definition.
pub fn decode_service(raw: &[u8]) -> std::result::Result<Service, postcard::Error> {
    if raw.is_empty() {
        return Ok(Service::default());
    }
    postcard::from_bytes(raw)
}

/// Sort instances by id, keeping the first record of any duplicated id.
pub fn normalize_service(service: &mut Service) {
    service.nodes.sort_by(|a, b| a.id.cmp(&b.id));
    service.nodes.dedup_by(|later, earlier| later.id == earlier.id);
}

/// Check that instances are sorted and unique by id.
pub fn is_normalized(service: &Service) -> bool {
    service.nodes.windows(2).all(|w| w[0].id < w[1].id)
}
