//! Presence announcements
//!
//! A presence announcement is a request-response addressed to a group or a
//! destination. Any live peer matching the target acknowledges it with its
//! own destination id. There is no negative acknowledgment: if no matching
//! peer becomes reachable before the deadline, the announcement fails with
//! `Timeout`, which callers branch on.

use crate::core::Payload;
use crate::reconnect::ReconnectingSession;
use crate::service::MethodId;
use crate::socket::RoutingSocket;
use fabric_core::{AccountId, DestinationId, FabricResult, GroupPath, Route, TimeBasedIdGenerator};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Service name reserved for presence
pub const PRESENCE_SERVICE: &str = "fabric.presence";

/// Method name reserved for presence
pub const PRESENCE_METHOD: &str = "announce";

/// Method id carried by presence announcements
pub fn presence_method_id() -> MethodId {
    MethodId::of(PRESENCE_SERVICE, PRESENCE_METHOD)
}

/// Acknowledgment sent back by `responder`
pub fn presence_ack(responder: DestinationId) -> Payload {
    Payload::from_data(responder.value().to_be_bytes().to_vec())
}

/// Successful announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceAck {
    /// Announced target
    pub target: Route,
    /// Peer that acknowledged, if it identified itself
    pub responder: Option<DestinationId>,
    /// Time from announcement to acknowledgment
    pub elapsed: Duration,
}

/// Key of an in-flight announcement: target plus time-based announcement id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceKey {
    /// Announced target
    pub target: Route,
    /// Time-based id taken when the announcement started
    pub announced_at: u64,
}

/// In-flight announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Record key
    pub key: PresenceKey,
    /// Deadline the caller supplied
    pub deadline: Duration,
}

type PendingTable = Mutex<HashMap<PresenceKey, PresenceRecord>>;

/// Removes a pending record however the announcement ends
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    key: PresenceKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

/// Announces presence checks through the client's session
pub struct PresenceNotifier {
    session: Arc<ReconnectingSession>,
    access_key: u64,
    ids: Arc<TimeBasedIdGenerator>,
    default_timeout: Duration,
    pending: PendingTable,
}

impl PresenceNotifier {
    /// Notifier over `session`, using `default_timeout` for `notify*`
    pub fn new(
        session: Arc<ReconnectingSession>,
        access_key: u64,
        ids: Arc<TimeBasedIdGenerator>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            session,
            access_key,
            ids,
            default_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for any peer in `group` to acknowledge
    pub async fn notify(
        &self,
        account_id: AccountId,
        group: &GroupPath,
    ) -> FabricResult<PresenceAck> {
        let target = Route::ByGroup {
            account_id,
            group: group.clone(),
        };
        self.announce(target, self.default_timeout).await
    }

    /// Wait for `destination` in `group` to acknowledge
    pub async fn notify_destination(
        &self,
        account_id: AccountId,
        destination_id: DestinationId,
        group: &GroupPath,
    ) -> FabricResult<PresenceAck> {
        let target = Route::ByDestination {
            account_id,
            destination_id,
            group: group.clone(),
        };
        self.announce(target, self.default_timeout).await
    }

    /// Announce to `target`, failing with `Timeout` after `deadline`
    pub async fn announce(&self, target: Route, deadline: Duration) -> FabricResult<PresenceAck> {
        let socket = RoutingSocket::new(
            self.session.clone(),
            target.clone(),
            self.access_key,
            self.ids.clone(),
        )?;

        let key = PresenceKey {
            target: target.clone(),
            announced_at: self.ids.next_id(),
        };
        self.pending.lock().insert(
            key.clone(),
            PresenceRecord {
                key: key.clone(),
                deadline,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            key,
        };

        let started = Instant::now();
        let announcement = Payload::new(Vec::new(), presence_method_id().prefix(&[]));
        match socket.request_response_within(announcement, deadline).await {
            Ok(ack) => {
                let responder = parse_responder(&ack.data);
                let elapsed = started.elapsed();
                debug!(
                    route = ?target.route_type(),
                    responder = ?responder,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "presence acknowledged"
                );
                Ok(PresenceAck {
                    target,
                    responder,
                    elapsed,
                })
            }
            Err(err) => {
                debug!(route = ?target.route_type(), error = %err, "presence not acknowledged");
                Err(err)
            }
        }
    }

    /// In-flight announcements
    pub fn pending(&self) -> Vec<PresenceRecord> {
        self.pending.lock().values().cloned().collect()
    }

    /// Deadline used by `notify` and `notify_destination`
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

fn parse_responder(data: &[u8]) -> Option<DestinationId> {
    let bytes: [u8; 8] = data.try_into().ok()?;
    Some(DestinationId(u64::from_be_bytes(bytes)))
}
