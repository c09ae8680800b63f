//! Availability gate: "the current usable connection" for any number of waiters
//!
//! The gate is either `Valid` (a connection is published), `Invalid` (none
//! is) or `Closed` (terminal). Fetching from a valid gate returns at once;
//! fetching from an invalid gate parks the caller on a oneshot that the next
//! [`AvailabilityGate::publish`] completes.
//!
//! State and waiter list share one lock, so a fetch that races a publish or
//! invalidate either sees the new state or is queued before the publish
//! drains the queue. Each waiter owns a oneshot, so it resolves at most once.

use fabric_core::{FabricError, FabricResult};
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

/// Dropped waiters are swept from the queue every this many registrations
const PRUNE_INTERVAL: usize = 1024;

/// Observable gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// A connection is published
    Valid,
    /// No connection; fetches wait
    Invalid,
    /// Terminal; fetches fail with `Closed`
    Closed,
}

enum GateState<C> {
    Valid(C),
    Invalid,
    Closed,
}

struct GateInner<C> {
    state: GateState<C>,
    waiters: Vec<oneshot::Sender<C>>,
}

/// Concurrent rendezvous on the current connection
pub struct AvailabilityGate<C> {
    inner: Mutex<GateInner<C>>,
}

impl<C: Clone> AvailabilityGate<C> {
    /// New gate in the `Invalid` state
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: GateState::Invalid,
                waiters: Vec::new(),
            }),
        }
    }

    /// Install `connection` and release every parked fetch with it
    ///
    /// Replaces any previously published connection for later fetches.
    /// Returns `false` if the gate is closed.
    pub fn publish(&self, connection: C) -> bool {
        let waiters = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, GateState::Closed) {
                return false;
            }
            inner.state = GateState::Valid(connection.clone());
            std::mem::take(&mut inner.waiters)
        };

        debug!(released = waiters.len(), "availability gate published");
        for waiter in waiters {
            // A dropped receiver means the fetch was cancelled.
            let _ = waiter.send(connection.clone());
        }
        true
    }

    /// Withdraw the published connection; later fetches wait
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, GateState::Valid(_)) {
            inner.state = GateState::Invalid;
            debug!("availability gate invalidated");
        }
    }

    /// Withdraw the published connection only if `stale` holds for it
    ///
    /// Returns `true` if this call invalidated the gate. A connection published
    /// in the meantime is left in place.
    pub fn invalidate_if(&self, stale: impl FnOnce(&C) -> bool) -> bool {
        let mut inner = self.inner.lock();
        let matched = match &inner.state {
            GateState::Valid(connection) => stale(connection),
            GateState::Invalid | GateState::Closed => false,
        };
        if matched {
            inner.state = GateState::Invalid;
            debug!("availability gate invalidated for a stale connection");
        }
        matched
    }

    /// Close the gate for good, failing every parked fetch with `Closed`
    pub fn close(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.state = GateState::Closed;
            std::mem::take(&mut inner.waiters)
        };
        debug!(failed = waiters.len(), "availability gate closed");
        drop(waiters);
    }

    /// The current connection, waiting for one if none is published
    pub async fn fetch(&self) -> FabricResult<C> {
        let receiver = {
            let mut inner = self.inner.lock();
            match &inner.state {
                GateState::Valid(connection) => return Ok(connection.clone()),
                GateState::Closed => return Err(closed_error()),
                GateState::Invalid => {}
            }

            if inner.waiters.len() % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
                inner.waiters.retain(|waiter| !waiter.is_closed());
            }
            let (sender, receiver) = oneshot::channel();
            inner.waiters.push(sender);
            receiver
        };

        receiver.await.map_err(|_| closed_error())
    }

    /// The current connection without waiting
    pub fn current(&self) -> Option<C> {
        match &self.inner.lock().state {
            GateState::Valid(connection) => Some(connection.clone()),
            GateState::Invalid | GateState::Closed => None,
        }
    }

    /// Current state
    pub fn status(&self) -> GateStatus {
        match self.inner.lock().state {
            GateState::Valid(_) => GateStatus::Valid,
            GateState::Invalid => GateStatus::Invalid,
            GateState::Closed => GateStatus::Closed,
        }
    }

    /// Number of parked fetches, including cancelled ones not yet swept
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl<C: Clone> Default for AvailabilityGate<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for AvailabilityGate<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let status = match inner.state {
            GateState::Valid(_) => GateStatus::Valid,
            GateState::Invalid => GateStatus::Invalid,
            GateState::Closed => GateStatus::Closed,
        };
        f.debug_struct("AvailabilityGate")
            .field("status", &status)
            .field("waiting", &inner.waiters.len())
            .finish()
    }
}

fn closed_error() -> FabricError {
    FabricError::closed("availability gate closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fetch_after_publish_is_immediate() {
        let gate = AvailabilityGate::new();
        gate.publish(7u32);
        assert_eq!(gate.fetch().await.unwrap(), 7);
        assert_eq!(gate.status(), GateStatus::Valid);
    }

    #[tokio::test]
    async fn test_fetch_before_publish_waits() {
        let gate = Arc::new(AvailabilityGate::new());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.fetch().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.waiting(), 1);

        gate.publish(1u32);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(gate.waiting(), 0);
    }

    #[test]
    fn test_invalidate_if_spares_newer_connection() {
        let gate = AvailabilityGate::new();
        gate.publish(2u32);
        assert!(!gate.invalidate_if(|current| *current == 1));
        assert_eq!(gate.status(), GateStatus::Valid);

        assert!(gate.invalidate_if(|current| *current == 2));
        assert_eq!(gate.status(), GateStatus::Invalid);
        assert!(!gate.invalidate_if(|_| true));
    }

    #[tokio::test]
    async fn test_republish_replaces_for_later_fetches() {
        let gate = AvailabilityGate::new();
        gate.publish(1u32);
        gate.publish(2u32);
        assert_eq!(gate.fetch().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_parks_new_fetches() {
        let gate = Arc::new(AvailabilityGate::new());
        gate.publish(1u32);
        gate.invalidate();
        assert_eq!(gate.current(), None);

        let pending = tokio::spawn({
            let gate = gate.clone();
            async move { gate.fetch().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        gate.publish(3u32);
        assert_eq!(pending.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_close_fails_parked_and_future_fetches() {
        let gate = Arc::new(AvailabilityGate::<u32>::new());
        let parked = tokio::spawn({
            let gate = gate.clone();
            async move { gate.fetch().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.close();
        assert_matches!(parked.await.unwrap(), Err(FabricError::Closed { .. }));
        assert_matches!(gate.fetch().await, Err(FabricError::Closed { .. }));
        assert!(!gate.publish(5));
        assert_eq!(gate.status(), GateStatus::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_does_not_block_publish() {
        let gate = AvailabilityGate::new();
        let cancelled = tokio::time::timeout(Duration::from_millis(10), gate.fetch()).await;
        assert!(cancelled.is_err());

        assert!(gate.publish(9u32));
        assert_eq!(gate.fetch().await.unwrap(), 9);
    }
}
