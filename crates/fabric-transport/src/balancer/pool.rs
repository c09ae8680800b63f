//! Weighted transport pool
//!
//! Candidate links are picked by weight, then by live load. Every
//! [`WeightedTransportPool::acquire`] increments the candidate's active count
//! before returning, and the returned [`ConnectionHandle`] decrements it
//! exactly once on its first terminal signal: `complete`, `fail` or drop.

use crate::config::LinkConfig;
use fabric_core::{FabricError, FabricResult};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One candidate link with its weight and in-flight connection count
#[derive(Debug)]
pub struct WeightedEntry {
    address: String,
    weight_bits: AtomicU64,
    active: AtomicUsize,
}

impl WeightedEntry {
    fn new(address: String, weight: f64) -> Self {
        Self {
            address,
            weight_bits: AtomicU64::new(weight.to_bits()),
            active: AtomicUsize::new(0),
        }
    }

    /// Link address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current weight
    pub fn weight(&self) -> f64 {
        f64::from_bits(self.weight_bits.load(Ordering::Acquire))
    }

    /// Point-in-time count of connections not yet terminated
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn set_weight(&self, weight: f64) {
        self.weight_bits.store(weight.to_bits(), Ordering::Release);
    }

    /// Higher weight first, then fewer active connections
    fn preference(&self, other: &Self) -> CmpOrdering {
        self.weight()
            .total_cmp(&other.weight())
            .then_with(|| other.active_connections().cmp(&self.active_connections()))
    }
}

/// Snapshot of an entry for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    /// Link address
    pub address: String,
    /// Weight at snapshot time
    pub weight: f64,
    /// Active connections at snapshot time
    pub active: usize,
}

/// How a connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The connection ran and closed normally
    Completed,
    /// The attempt or the connection failed
    Failed,
}

/// Accounting token for one connection to a pool entry
#[derive(Debug)]
pub struct ConnectionHandle {
    entry: Arc<WeightedEntry>,
    released: AtomicBool,
}

impl ConnectionHandle {
    /// The entry this handle counts against
    pub fn entry(&self) -> &Arc<WeightedEntry> {
        &self.entry
    }

    /// Normal completion; returns `false` if a terminal signal was already seen
    pub fn complete(&self) -> bool {
        self.release(Outcome::Completed)
    }

    /// Failure; returns `false` if a terminal signal was already seen
    pub fn fail(&self, error: &FabricError) -> bool {
        let first = self.release(Outcome::Failed);
        if first {
            debug!(address = %self.entry.address, %error, "link attempt failed");
        }
        first
    }

    /// True once a terminal signal was observed
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn release(&self, outcome: Outcome) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let previous = self.entry.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "active connection count underflow");
        debug!(
            address = %self.entry.address,
            ?outcome,
            active = previous - 1,
            "link released"
        );
        true
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release(Outcome::Failed);
    }
}

/// Set of candidate links
#[derive(Debug)]
pub struct WeightedTransportPool {
    entries: Vec<Arc<WeightedEntry>>,
}

impl WeightedTransportPool {
    /// Pool over `links`; at least one link, addresses unique, weights finite and non-negative
    pub fn new(links: impl IntoIterator<Item = LinkConfig>) -> FabricResult<Self> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for link in links {
            validate_weight(&link.address, link.weight)?;
            if !seen.insert(link.address.clone()) {
                return Err(FabricError::invalid_argument(format!(
                    "duplicate link address {}",
                    link.address
                )));
            }
            entries.push(Arc::new(WeightedEntry::new(link.address, link.weight)));
        }

        if entries.is_empty() {
            return Err(FabricError::invalid_argument("pool needs at least one link"));
        }
        Ok(Self { entries })
    }

    /// Preferred entry right now
    pub fn select(&self) -> FabricResult<Arc<WeightedEntry>> {
        let selected = self
            .entries
            .iter()
            .max_by(|a, b| a.preference(b))
            .cloned()
            .ok_or_else(|| FabricError::connection_unavailable("pool has no links"))?;

        debug!(
            address = %selected.address,
            weight = selected.weight(),
            active = selected.active_connections(),
            "link selected"
        );
        Ok(selected)
    }

    /// Count a new connection attempt against `entry`
    pub fn acquire(&self, entry: &Arc<WeightedEntry>) -> ConnectionHandle {
        entry.active.fetch_add(1, Ordering::AcqRel);
        ConnectionHandle {
            entry: entry.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// `select` then `acquire`
    pub fn select_and_acquire(&self) -> FabricResult<ConnectionHandle> {
        let entry = self.select()?;
        Ok(self.acquire(&entry))
    }

    /// Active connections for `address`, if it is in the pool
    pub fn active_connections(&self, address: &str) -> Option<usize> {
        self.entry(address).map(|entry| entry.active_connections())
    }

    /// Change the weight of `address`
    pub fn set_weight(&self, address: &str, weight: f64) -> FabricResult<()> {
        validate_weight(address, weight)?;
        let entry = self
            .entry(address)
            .ok_or_else(|| FabricError::invalid_argument(format!("unknown link {address}")))?;
        entry.set_weight(weight);
        Ok(())
    }

    /// Entry for `address`
    pub fn entry(&self, address: &str) -> Option<&Arc<WeightedEntry>> {
        self.entries.iter().find(|entry| entry.address == address)
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.entries
            .iter()
            .map(|entry| EntrySnapshot {
                address: entry.address.clone(),
                weight: entry.weight(),
                active: entry.active_connections(),
            })
            .collect()
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a constructed pool
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_weight(address: &str, weight: f64) -> FabricResult<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(FabricError::invalid_argument(format!(
            "link {address} has invalid weight {weight}"
        )));
    }
    Ok(())
}
