//! Contracts the routing layer needs from the point-to-point transport

use async_trait::async_trait;
use fabric_core::{FabricError, FabricResult, SessionKey};
use futures::stream::BoxStream;
use std::sync::Arc;

/// Request or response body with its metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Application data
    pub data: Vec<u8>,
    /// Metadata; the routing envelope on outbound requests
    pub metadata: Vec<u8>,
}

impl Payload {
    /// Payload with data and metadata
    pub fn new(data: impl Into<Vec<u8>>, metadata: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            metadata: metadata.into(),
        }
    }

    /// Payload with data and no metadata
    pub fn from_data(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, Vec::new())
    }
}

/// Stream of responses
pub type PayloadStream = BoxStream<'static, FabricResult<Payload>>;

/// Outbound half of a request-channel
pub type OutboundStream = BoxStream<'static, Payload>;

/// One live physical link to the routing fabric
///
/// `ConnectionUnavailable` from a send means the request was not delivered;
/// callers may resend it over another link.
#[async_trait]
pub trait RoutedConnection: Send + Sync {
    /// Send without waiting for a reply
    async fn fire_and_forget(&self, payload: Payload) -> FabricResult<()>;

    /// Send and wait for exactly one reply
    async fn request_response(&self, payload: Payload) -> FabricResult<Payload>;

    /// Send and receive a stream of replies
    async fn request_stream(&self, payload: Payload) -> FabricResult<PayloadStream>;

    /// Bidirectional stream
    async fn request_channel(&self, payloads: OutboundStream) -> FabricResult<PayloadStream>;

    /// Metadata-only side channel
    async fn metadata_push(&self, payload: Payload) -> FabricResult<()>;

    /// Transport-reported usability in `[0, 1]`
    fn availability(&self) -> f64;

    /// Resolves once the link is lost or disposed
    async fn closed(&self);

    /// Tear the link down
    fn dispose(&self);
}

/// Serves requests routed to this destination
///
/// Every method rejects by default so handlers only implement the shapes
/// they serve.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Inbound fire-and-forget
    async fn fire_and_forget(&self, _payload: Payload) -> FabricResult<()> {
        Err(FabricError::handler("fire-and-forget not supported"))
    }

    /// Inbound request-response
    async fn request_response(&self, _payload: Payload) -> FabricResult<Payload> {
        Err(FabricError::handler("request-response not supported"))
    }

    /// Inbound request-stream
    async fn request_stream(&self, _payload: Payload) -> FabricResult<PayloadStream> {
        Err(FabricError::handler("request-stream not supported"))
    }

    /// Inbound request-channel
    async fn request_channel(&self, _payloads: OutboundStream) -> FabricResult<PayloadStream> {
        Err(FabricError::handler("request-channel not supported"))
    }

    /// Inbound metadata push
    async fn metadata_push(&self, _payload: Payload) -> FabricResult<()> {
        Err(FabricError::handler("metadata-push not supported"))
    }
}

/// Handler that rejects everything
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingHandler;

impl RequestHandler for RejectingHandler {}

/// Result of a successful handshake
pub struct Handshake {
    /// The established link
    pub connection: Arc<dyn RoutedConnection>,
    /// Session key issued by the fabric
    pub session_key: SessionKey,
    /// Counter value in effect when the session was established
    pub initial_counter: u64,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("session_key", &self.session_key)
            .field("initial_counter", &self.initial_counter)
            .finish_non_exhaustive()
    }
}

/// Opens a new link and performs the destination-setup handshake
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, sending `setup` as the handshake metadata; `acceptor` serves
    /// requests routed back over the new link
    async fn connect(
        &self,
        setup: Vec<u8>,
        acceptor: Arc<dyn RequestHandler>,
    ) -> FabricResult<Handshake>;
}

/// Opens links to an explicit address, for pools of candidate links
#[async_trait]
pub trait AddressedConnector: Send + Sync {
    /// Connect to `address`
    async fn connect_to(
        &self,
        address: &str,
        setup: Vec<u8>,
        acceptor: Arc<dyn RequestHandler>,
    ) -> FabricResult<Handshake>;
}
