//! Hashed identifiers used to address destinations and groups
//!
//! Destinations and groups are never addressed by network location. A
//! human-readable name is hashed once into a 64-bit id, and groups become an
//! ordered path of per-segment ids.

use crate::errors::{FabricError, FabricResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed name hash: first eight bytes of the BLAKE3 digest, little-endian.
pub fn hash_name(name: &str) -> i64 {
    let digest = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_le_bytes(bytes)
}

/// Account scope for destinations and groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl AccountId {
    /// Get the raw id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account-{}", self.0)
    }
}

impl From<u64> for AccountId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Hashed logical endpoint address, scoped to an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId(pub u64);

impl DestinationId {
    /// Derive the destination id for a human-readable name
    pub fn from_name(name: &str) -> Self {
        Self(hash_name(name) as u64)
    }

    /// Get the raw id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dest-{:016x}", self.0)
    }
}

impl From<u64> for DestinationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Ordered per-segment ids of a dot-separated group name
///
/// `"a.b.c"` becomes three ids. Order is significant on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GroupPath(Vec<u64>);

impl GroupPath {
    /// Hash each dot-separated segment of `group`
    pub fn from_name(group: &str) -> FabricResult<Self> {
        if group.is_empty() {
            return Err(FabricError::invalid_argument("group name is empty"));
        }

        group
            .split('.')
            .map(|segment| {
                if segment.is_empty() {
                    Err(FabricError::invalid_argument(format!(
                        "group name {group:?} has an empty segment"
                    )))
                } else {
                    Ok(hash_name(segment).unsigned_abs())
                }
            })
            .collect::<FabricResult<Vec<_>>>()
            .map(Self)
    }

    /// Build a path from already hashed ids
    pub fn from_ids(ids: Vec<u64>) -> Self {
        Self(ids)
    }

    /// The segment ids in order
    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the path has no segments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{id:x}")?;
            first = false;
        }
        Ok(())
    }
}
