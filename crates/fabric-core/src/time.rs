//! Time-based unique request ids
//!
//! Layout of an id, most significant bits first:
//! `[millis since UNIX epoch: 42][node: 10][sequence: 12]`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

/// Generates strictly increasing, never repeating ids seeded by wall-clock time
///
/// Safe to share between tasks. If the clock stalls or steps backwards the
/// generator keeps counting from the last issued id instead of repeating.
#[derive(Debug)]
pub struct TimeBasedIdGenerator {
    node: u64,
    last: AtomicU64,
}

impl TimeBasedIdGenerator {
    /// Create a generator for `node`; only the low 10 bits are used
    pub fn new(node: u64) -> Self {
        Self {
            node: node & NODE_MASK,
            last: AtomicU64::new(0),
        }
    }

    /// Next id
    pub fn next_id(&self) -> u64 {
        let floor = self.id_floor(current_millis());
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = floor.max(previous.wrapping_add(1));
            match self.last.compare_exchange_weak(
                previous,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => previous = actual,
            }
        }
    }

    /// Milliseconds component of an id produced by any generator
    pub fn millis_of(id: u64) -> u64 {
        id >> (NODE_BITS + SEQUENCE_BITS)
    }

    fn id_floor(&self, millis: u64) -> u64 {
        (millis << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS)
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
