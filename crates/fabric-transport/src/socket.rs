//! Routing socket: the outbound request dispatcher
//!
//! A socket is bound to one target route. Every outbound request, of any call
//! shape, is wrapped the same way:
//!
//! 1. fetch the live session (waiting while the link is down)
//! 2. claim the next session counter value
//! 3. derive the request token from key, payload data and counter
//! 4. encode the routing envelope around the caller's metadata
//! 5. forward over the session's connection
//!
//! If the connection reports `ConnectionUnavailable`, the request never left:
//! the stale session is retired and the request is wrapped again for the next
//! session. Any other failure is returned to the caller.

use crate::core::{OutboundStream, Payload, PayloadStream, RoutedConnection};
use crate::reconnect::{LiveSession, ReconnectingSession};
use fabric_core::{
    encode_envelope, request_token, DestinationId, EnvelopeHeader, FabricError, FabricResult,
    Route, TimeBasedIdGenerator,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

struct SocketInner {
    session: Arc<ReconnectingSession>,
    target: Route,
    route: Vec<u8>,
    access_key: u64,
    source: DestinationId,
    ids: Arc<TimeBasedIdGenerator>,
    closed: watch::Sender<bool>,
}

impl SocketInner {
    fn wrap(&self, live: &LiveSession, payload: Payload) -> FabricResult<Payload> {
        let counter = live.next_counter();
        let token = request_token(live.session_key(), &payload.data, counter)?;
        let header = EnvelopeHeader {
            request_token: token,
            access_key: self.access_key,
            source: self.source,
            request_id: self.ids.next_id(),
        };
        let metadata = encode_envelope(&header, &self.route, &payload.metadata)?;

        debug!(
            counter,
            request_id = header.request_id,
            generation = live.generation(),
            "request wrapped"
        );
        Ok(Payload {
            data: payload.data,
            metadata,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Dispatches requests to one destination or group over a reconnecting session
#[derive(Clone)]
pub struct RoutingSocket {
    inner: Arc<SocketInner>,
}

impl RoutingSocket {
    /// Socket sending to `target` over `session`
    pub fn new(
        session: Arc<ReconnectingSession>,
        target: Route,
        access_key: u64,
        ids: Arc<TimeBasedIdGenerator>,
    ) -> FabricResult<Self> {
        let route = target.encode()?;
        let source = session.identity().destination_id;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SocketInner {
                session,
                target,
                route,
                access_key,
                source,
                ids,
                closed,
            }),
        })
    }

    /// Where this socket sends
    pub fn target(&self) -> &Route {
        &self.inner.target
    }

    /// Fire-and-forget
    pub async fn fire_and_forget(&self, payload: Payload) -> FabricResult<()> {
        self.forward(payload, |connection, wrapped| async move {
            connection.fire_and_forget(wrapped).await
        })
        .await
    }

    /// Request-response
    pub async fn request_response(&self, payload: Payload) -> FabricResult<Payload> {
        self.forward(payload, |connection, wrapped| async move {
            connection.request_response(wrapped).await
        })
        .await
    }

    /// Request-response bounded by `deadline`, including any wait for a session
    pub async fn request_response_within(
        &self,
        payload: Payload,
        deadline: Duration,
    ) -> FabricResult<Payload> {
        tokio::time::timeout(deadline, self.request_response(payload))
            .await
            .map_err(|_| FabricError::timeout("request-response", deadline))?
    }

    /// Request-stream
    pub async fn request_stream(&self, payload: Payload) -> FabricResult<PayloadStream> {
        self.forward(payload, |connection, wrapped| async move {
            connection.request_stream(wrapped).await
        })
        .await
    }

    /// Request-channel; every outbound item is wrapped with its own counter value
    ///
    /// If an item cannot be wrapped the outbound side ends before it and the
    /// error is delivered on the response stream. The channel is reopened on
    /// the next session only while no outbound item has been taken.
    pub async fn request_channel(&self, payloads: OutboundStream) -> FabricResult<PayloadStream> {
        let unclaimed = Arc::new(Mutex::new(Some(payloads)));
        self.until_closed(async {
            loop {
                let live = self.live_session().await?;
                let (fault_tx, fault_rx) = oneshot::channel::<FabricError>();
                let outbound =
                    wrap_outbound(self.inner.clone(), live.clone(), unclaimed.clone(), fault_tx);

                match live.connection().request_channel(outbound).await {
                    Ok(responses) => {
                        let faults = stream::once(fault_rx)
                            .filter_map(|fault| async move { fault.ok().map(Err) });
                        return Ok(stream::select(responses, faults).boxed());
                    }
                    Err(err) if err.is_transient() && unclaimed.lock().is_some() => {
                        self.retire(&live, &err);
                    }
                    Err(err) => return Err(err),
                }
            }
        })
        .await
    }

    /// Metadata push
    pub async fn metadata_push(&self, payload: Payload) -> FabricResult<()> {
        self.forward(payload, |connection, wrapped| async move {
            connection.metadata_push(wrapped).await
        })
        .await
    }

    /// Usability of the underlying session, `0.0` once closed
    pub fn availability(&self) -> f64 {
        if self.inner.is_closed() {
            return 0.0;
        }
        self.inner.session.availability()
    }

    /// Close the socket; pending calls fail with `Closed`
    ///
    /// Returns `true` for the call that actually closed it. The shared session
    /// stays up.
    pub fn close(&self) -> bool {
        if self.inner.closed.send_replace(true) {
            return false;
        }
        info!(route = ?self.inner.target.route_type(), "routing socket closed");
        true
    }

    /// True once closed, directly or through the session
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.inner.session.is_closed()
    }

    /// Resolves once the socket or its session is closed
    pub async fn on_close(&self) {
        let mut closed = self.inner.closed.subscribe();
        tokio::select! {
            _ = closed_signal(&mut closed) => {}
            _ = self.inner.session.on_close() => {}
        }
    }

    async fn live_session(&self) -> FabricResult<LiveSession> {
        self.inner.session.current().await
    }

    /// Wrap `payload` for the current session and hand it to `send`
    ///
    /// Repeats on the next session while the connection reports
    /// `ConnectionUnavailable`; ends on any other outcome or on close.
    async fn forward<T, F, Fut>(&self, payload: Payload, send: F) -> FabricResult<T>
    where
        F: Fn(Arc<dyn RoutedConnection>, Payload) -> Fut,
        Fut: Future<Output = FabricResult<T>>,
    {
        self.until_closed(async {
            loop {
                let live = self.live_session().await?;
                let wrapped = self.inner.wrap(&live, payload.clone())?;
                match send(live.connection().clone(), wrapped).await {
                    Err(err) if err.is_transient() => self.retire(&live, &err),
                    outcome => return outcome,
                }
            }
        })
        .await
    }

    fn retire(&self, live: &LiveSession, error: &FabricError) {
        debug!(
            generation = live.generation(),
            %error,
            "connection unavailable, retrying on the next session"
        );
        self.inner.session.retire(live);
    }

    async fn until_closed<T>(
        &self,
        operation: impl Future<Output = FabricResult<T>>,
    ) -> FabricResult<T> {
        if self.inner.is_closed() {
            return Err(FabricError::closed("routing socket closed"));
        }
        let mut closed = self.inner.closed.subscribe();
        tokio::select! {
            result = operation => result,
            _ = closed_signal(&mut closed) => Err(FabricError::closed("routing socket closed")),
        }
    }
}

impl fmt::Debug for RoutingSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingSocket")
            .field("target", &self.inner.target)
            .field("source", &self.inner.source)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// Outbound half of a channel that takes `unclaimed` only when first polled
fn wrap_outbound(
    inner: Arc<SocketInner>,
    live: LiveSession,
    unclaimed: Arc<Mutex<Option<OutboundStream>>>,
    fault_tx: oneshot::Sender<FabricError>,
) -> OutboundStream {
    stream::unfold(Some((None, fault_tx)), move |state| {
        let inner = inner.clone();
        let live = live.clone();
        let unclaimed = unclaimed.clone();
        async move {
            let (claimed, fault_tx): (Option<OutboundStream>, _) = state?;
            let mut payloads = match claimed {
                Some(payloads) => payloads,
                None => unclaimed.lock().take()?,
            };
            let payload = payloads.next().await?;
            match inner.wrap(&live, payload) {
                Ok(wrapped) => Some((wrapped, Some((Some(payloads), fault_tx)))),
                Err(err) => {
                    let _ = fault_tx.send(err);
                    None
                }
            }
        }
    })
    .boxed()
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
