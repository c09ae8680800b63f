//! In-process routing fabric
//!
//! Accepts destination-setup handshakes, keeps a table of registered
//! destinations and routes enveloped requests between them. Used by tests and
//! demos in place of a networked broker.
//!
//! Routing rules:
//! - `ByDestination` goes to the link announcing that destination in that group.
//! - `ByGroup` goes to the earliest registered link in that group, other than
//!   the sender.
//! - Request-response, request-stream and request-channel wait for a matching
//!   peer to register. Fire-and-forget and metadata push are dropped when no
//!   peer matches.

use super::traits::{
    AddressedConnector, Connector, Handshake, OutboundStream, Payload, PayloadStream,
    RequestHandler, RoutedConnection,
};
use async_trait::async_trait;
use fabric_core::{
    decode_destination_setup, envelope_route, AccountId, DestinationId, FabricError,
    FabricResult, GroupPath, Route, SessionKey,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Clone)]
struct Peer {
    account_id: AccountId,
    destination_id: DestinationId,
    group: GroupPath,
    acceptor: Arc<dyn RequestHandler>,
    lost: Arc<watch::Sender<bool>>,
}

impl Peer {
    fn matches(&self, route: &Route, link: u64, origin: u64) -> bool {
        if self.account_id != route.account_id() || self.group != *route.group() {
            return false;
        }
        match route.destination_id() {
            Some(destination_id) => self.destination_id == destination_id,
            None => link != origin,
        }
    }
}

#[derive(Default)]
struct FabricState {
    peers: BTreeMap<u64, Peer>,
    refused: HashSet<String>,
    dialed: Vec<String>,
}

struct FabricInner {
    state: Mutex<FabricState>,
    registrations: watch::Sender<u64>,
    refuse_all: AtomicBool,
    next_link: AtomicU64,
    handshakes: AtomicU64,
    delivered: AtomicU64,
}

impl FabricInner {
    fn find_peer(&self, route: &Route, origin: u64) -> Option<Peer> {
        self.state
            .lock()
            .peers
            .iter()
            .find(|(link, peer)| peer.matches(route, **link, origin))
            .map(|(_, peer)| peer.clone())
    }

    /// Wait for a peer matching `route`, or fail once the origin link is lost
    async fn await_peer(
        &self,
        route: &Route,
        origin: u64,
        lost: &watch::Sender<bool>,
    ) -> FabricResult<Peer> {
        let mut registrations = self.registrations.subscribe();
        let mut lost = lost.subscribe();
        loop {
            if *lost.borrow() {
                return Err(FabricError::connection_unavailable("link lost"));
            }
            if let Some(peer) = self.find_peer(route, origin) {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                return Ok(peer);
            }
            debug!(link = origin, route = ?route.route_type(), "no peer yet, waiting");

            tokio::select! {
                changed = registrations.changed() => {
                    if changed.is_err() {
                        return Err(FabricError::connection_unavailable("fabric stopped"));
                    }
                }
                _ = lost.changed() => {}
            }
        }
    }

    fn unregister(&self, link: u64) {
        let removed = self.state.lock().peers.remove(&link);
        if let Some(peer) = removed {
            peer.lost.send_replace(true);
            debug!(link, destination_id = %peer.destination_id, "link unregistered");
        }
    }

    fn accept(
        self: &Arc<Self>,
        setup: &[u8],
        acceptor: Arc<dyn RequestHandler>,
    ) -> FabricResult<Handshake> {
        let frame = decode_destination_setup(setup)?;
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(FabricError::connection_unavailable(
                "fabric is refusing connections",
            ));
        }

        let link = self.next_link.fetch_add(1, Ordering::SeqCst) + 1;
        let (lost, _) = watch::channel(false);
        let lost = Arc::new(lost);
        let peer = Peer {
            account_id: frame.account_id,
            destination_id: frame.destination_id,
            group: frame.group.clone(),
            acceptor,
            lost: lost.clone(),
        };
        self.state.lock().peers.insert(link, peer);
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        self.registrations.send_modify(|count| *count += 1);

        info!(
            link,
            destination_id = %frame.destination_id,
            group = %frame.group,
            "destination registered"
        );
        Ok(Handshake {
            connection: Arc::new(MemoryConnection {
                fabric: self.clone(),
                link,
                lost,
            }),
            session_key: SessionKey::new(blake3::hash(setup).as_bytes().to_vec()),
            initial_counter: 0,
        })
    }
}

/// In-process broker implementing [`Connector`] and [`AddressedConnector`]
#[derive(Clone)]
pub struct MemoryFabric {
    inner: Arc<FabricInner>,
}

impl MemoryFabric {
    /// Empty fabric
    pub fn new() -> Self {
        let (registrations, _) = watch::channel(0);
        Self {
            inner: Arc::new(FabricInner {
                state: Mutex::new(FabricState::default()),
                registrations,
                refuse_all: AtomicBool::new(false),
                next_link: AtomicU64::new(0),
                handshakes: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse (or accept again) every new handshake
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Refuse handshakes dialed to `address`
    pub fn refuse_address(&self, address: impl Into<String>) {
        self.inner.state.lock().refused.insert(address.into());
    }

    /// Drop every live link of `destination_id`; returns how many were dropped
    pub fn sever(&self, destination_id: DestinationId) -> usize {
        let links: Vec<u64> = self
            .inner
            .state
            .lock()
            .peers
            .iter()
            .filter(|(_, peer)| peer.destination_id == destination_id)
            .map(|(link, _)| *link)
            .collect();
        for link in &links {
            self.inner.unregister(*link);
        }
        info!(%destination_id, severed = links.len(), "destination severed");
        links.len()
    }

    /// Drop every live link
    pub fn shutdown(&self) {
        let links: Vec<u64> = self.inner.state.lock().peers.keys().copied().collect();
        for link in links {
            self.inner.unregister(link);
        }
    }

    /// Successful handshakes so far
    pub fn handshakes(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    /// Requests handed to a peer so far
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    /// Number of live links
    pub fn live_links(&self) -> usize {
        self.inner.state.lock().peers.len()
    }

    /// True if `destination_id` has a live link
    pub fn is_registered(&self, destination_id: DestinationId) -> bool {
        self.inner
            .state
            .lock()
            .peers
            .values()
            .any(|peer| peer.destination_id == destination_id)
    }

    /// Addresses dialed through [`AddressedConnector`], in order
    pub fn dialed(&self) -> Vec<String> {
        self.inner.state.lock().dialed.clone()
    }
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFabric")
            .field("live_links", &self.live_links())
            .field("handshakes", &self.handshakes())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryFabric {
    async fn connect(
        &self,
        setup: Vec<u8>,
        acceptor: Arc<dyn RequestHandler>,
    ) -> FabricResult<Handshake> {
        self.inner.accept(&setup, acceptor)
    }
}

#[async_trait]
impl AddressedConnector for MemoryFabric {
    async fn connect_to(
        &self,
        address: &str,
        setup: Vec<u8>,
        acceptor: Arc<dyn RequestHandler>,
    ) -> FabricResult<Handshake> {
        {
            let mut state = self.inner.state.lock();
            state.dialed.push(address.to_string());
            if state.refused.contains(address) {
                return Err(FabricError::connection_unavailable(format!(
                    "{address} refused the connection"
                )));
            }
        }
        self.inner.accept(&setup, acceptor)
    }
}

/// One link into a [`MemoryFabric`]
struct MemoryConnection {
    fabric: Arc<FabricInner>,
    link: u64,
    lost: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    fn ensure_live(&self) -> FabricResult<()> {
        if *self.lost.borrow() {
            return Err(FabricError::connection_unavailable("link lost"));
        }
        Ok(())
    }

    async fn route_to_peer(&self, payload: &Payload) -> FabricResult<Peer> {
        self.ensure_live()?;
        let route = envelope_route(&payload.metadata)?;
        self.fabric.await_peer(&route, self.link, &self.lost).await
    }

    fn try_route(&self, payload: &Payload) -> FabricResult<Option<Peer>> {
        self.ensure_live()?;
        let route = envelope_route(&payload.metadata)?;
        let peer = self.fabric.find_peer(&route, self.link);
        match &peer {
            Some(_) => {
                self.fabric.delivered.fetch_add(1, Ordering::SeqCst);
            }
            None => debug!(link = self.link, "no peer, dropping"),
        }
        Ok(peer)
    }
}

#[async_trait]
impl RoutedConnection for MemoryConnection {
    async fn fire_and_forget(&self, payload: Payload) -> FabricResult<()> {
        match self.try_route(&payload)? {
            Some(peer) => peer.acceptor.fire_and_forget(payload).await,
            None => Ok(()),
        }
    }

    async fn request_response(&self, payload: Payload) -> FabricResult<Payload> {
        let peer = self.route_to_peer(&payload).await?;
        peer.acceptor.request_response(payload).await
    }

    async fn request_stream(&self, payload: Payload) -> FabricResult<PayloadStream> {
        let peer = self.route_to_peer(&payload).await?;
        peer.acceptor.request_stream(payload).await
    }

    async fn request_channel(&self, mut payloads: OutboundStream) -> FabricResult<PayloadStream> {
        self.ensure_live()?;
        let Some(first) = payloads.next().await else {
            return Ok(stream::empty().boxed());
        };
        let peer = self.route_to_peer(&first).await?;
        peer.acceptor
            .request_channel(stream::iter([first]).chain(payloads).boxed())
            .await
    }

    async fn metadata_push(&self, payload: Payload) -> FabricResult<()> {
        match self.try_route(&payload)? {
            Some(peer) => peer.acceptor.metadata_push(payload).await,
            None => Ok(()),
        }
    }

    fn availability(&self) -> f64 {
        if *self.lost.borrow() {
            0.0
        } else {
            1.0
        }
    }

    async fn closed(&self) {
        let mut lost = self.lost.subscribe();
        let _ = lost.wait_for(|lost| *lost).await;
    }

    fn dispose(&self) {
        self.fabric.unregister(self.link);
        self.lost.send_replace(true);
    }
}
