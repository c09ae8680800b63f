//! Connection session manager
//!
//! Owns one physical connection's lifecycle. A background task performs the
//! destination-setup handshake, publishes the resulting [`LiveSession`]
//! through the [`AvailabilityGate`], watches for link loss and reconnects
//! with a linear, capped backoff until the session is closed:
//!
//! ```text
//! Disconnected -> Connecting -> Established -> Reconnecting(delay) -> Connecting -> ...
//!                                   any state --close()--> Closed
//! ```
//!
//! # Blocking Lock Usage
//!
//! `parking_lot::Mutex` guards the backoff schedule only; it is never held
//! across `.await` points.

use crate::config::BackoffConfig;
use crate::core::{Connector, RequestHandler, RoutedConnection};
use crate::gate::{AvailabilityGate, GateStatus};
use fabric_core::{
    AccountId, DestinationId, DestinationSetup, FabricError, FabricResult, GroupPath, SessionKey,
    TimeBasedIdGenerator,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle of a reconnecting session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// A session is published
    Established,
    /// Waiting `delay` before the next attempt
    Reconnecting {
        /// Delay before the next handshake
        delay: Duration,
    },
    /// Terminal
    Closed,
}

/// Linear backoff: zero while healthy, then `floor`, `floor + step`, ... up to `ceiling`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Fresh schedule
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: Duration::ZERO,
        }
    }

    /// Advance the schedule and return the delay to wait now
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.config.floor()
        } else {
            (self.current + self.config.step()).min(self.config.ceiling())
        };
        self.current
    }

    /// Back to zero after a successful handshake
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    /// Last delay handed out, zero after a reset
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Who this session announces itself as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Owning account
    pub account_id: AccountId,
    /// This client's destination
    pub destination_id: DestinationId,
    /// Group this destination joins
    pub group: GroupPath,
    /// Access token bytes
    pub access_token: Vec<u8>,
}

impl SessionIdentity {
    fn setup_frame(&self, request_id: u64) -> FabricResult<Vec<u8>> {
        DestinationSetup {
            account_token: Vec::new(),
            access_token: self.access_token.clone(),
            account_id: self.account_id,
            destination_id: self.destination_id,
            request_id,
            group: self.group.clone(),
        }
        .encode()
    }
}

/// The session bound to the currently live connection
///
/// Key and counter always belong to the same handshake, so a caller reading
/// both from one `LiveSession` can never mix sessions.
#[derive(Clone)]
pub struct LiveSession {
    connection: Arc<dyn RoutedConnection>,
    key: Arc<SessionKey>,
    counter: Arc<AtomicU64>,
    generation: u64,
}

impl LiveSession {
    /// Session over `connection`, counting up from `initial_counter`
    pub fn new(
        connection: Arc<dyn RoutedConnection>,
        key: SessionKey,
        initial_counter: u64,
        generation: u64,
    ) -> Self {
        Self {
            connection,
            key: Arc::new(key),
            counter: Arc::new(AtomicU64::new(initial_counter)),
            generation,
        }
    }

    /// The live connection
    pub fn connection(&self) -> &Arc<dyn RoutedConnection> {
        &self.connection
    }

    /// Session key
    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    /// Shared request counter
    pub fn counter(&self) -> &Arc<AtomicU64> {
        &self.counter
    }

    /// Claim the next counter value; never repeats within a session
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Which handshake produced this session, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("generation", &self.generation)
            .field("counter", &self.counter.load(Ordering::SeqCst))
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    identity: SessionIdentity,
    connector: Arc<dyn Connector>,
    acceptor: Arc<dyn RequestHandler>,
    ids: Arc<TimeBasedIdGenerator>,
    gate: AvailabilityGate<LiveSession>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    backoff: Mutex<Backoff>,
    handshakes: AtomicU64,
}

impl SessionInner {
    /// Closed is terminal; later transitions are ignored
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn next_backoff(&self) -> Duration {
        self.backoff.lock().next_delay()
    }
}

/// Keeps one session alive against the fabric, reconnecting on loss
///
/// Dropping the handle closes the session.
pub struct ReconnectingSession {
    inner: Arc<SessionInner>,
}

impl ReconnectingSession {
    /// Validate the identity and start the connect loop on the current runtime
    ///
    /// Fails with `Config` when called outside a Tokio runtime.
    pub fn start(
        identity: SessionIdentity,
        connector: Arc<dyn Connector>,
        acceptor: Arc<dyn RequestHandler>,
        backoff: BackoffConfig,
        ids: Arc<TimeBasedIdGenerator>,
    ) -> FabricResult<Self> {
        backoff.validate()?;
        // Surface unencodable identities here instead of in the retry loop.
        identity.setup_frame(0)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| FabricError::config(format!("session needs a Tokio runtime: {err}")))?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            identity,
            connector,
            acceptor,
            ids,
            gate: AvailabilityGate::new(),
            state,
            shutdown,
            backoff: Mutex::new(Backoff::new(backoff)),
            handshakes: AtomicU64::new(0),
        });

        runtime.spawn(run_session(inner.clone()));
        Ok(Self { inner })
    }

    /// Identity announced in every handshake
    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    /// The published session, waiting for one if none is live
    pub async fn current(&self) -> FabricResult<LiveSession> {
        self.inner.gate.fetch().await
    }

    /// The current session's shared counter
    pub async fn current_counter(&self) -> FabricResult<Arc<AtomicU64>> {
        Ok(self.current().await?.counter.clone())
    }

    /// The current session's key
    pub async fn current_session_key(&self) -> FabricResult<Arc<SessionKey>> {
        Ok(self.current().await?.key.clone())
    }

    /// Transport-reported usability, `0.0` unless established
    pub fn availability(&self) -> f64 {
        if self.state() != ConnectionState::Established {
            return 0.0;
        }
        self.inner
            .gate
            .current()
            .map(|live| live.connection.availability().clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Wait until `predicate` holds for the state
    ///
    /// Fails with `Closed` if the session closes first and `predicate` does
    /// not accept `Closed`.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> FabricResult<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut receiver = self.inner.state.subscribe();
        let state = *receiver
            .wait_for(|state| predicate(state) || *state == ConnectionState::Closed)
            .await
            .map_err(|_| FabricError::closed("session state channel dropped"))?;

        if state == ConnectionState::Closed && !predicate(&state) {
            return Err(FabricError::closed("session closed"));
        }
        Ok(state)
    }

    /// Delay the schedule currently stands at; zero right after a success
    pub fn current_backoff(&self) -> Duration {
        self.inner.backoff.lock().current()
    }

    /// State of the availability gate
    pub fn gate_status(&self) -> GateStatus {
        self.inner.gate.status()
    }

    /// Number of successful handshakes so far
    pub fn handshakes(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    /// True once `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Take `live` out of service after its connection reported itself unusable
    ///
    /// The gate is invalidated only while `live` is still the published
    /// session, and its connection is disposed so the reconnect loop replaces
    /// it. Returns `true` if this call retired the session.
    pub fn retire(&self, live: &LiveSession) -> bool {
        let generation = live.generation();
        let retired = self
            .inner
            .gate
            .invalidate_if(|current| current.generation() == generation);
        if retired {
            live.connection().dispose();
            warn!(
                destination_id = %self.inner.identity.destination_id,
                generation,
                "stale session retired"
            );
        }
        retired
    }

    /// Stop reconnecting, fail pending waiters with `Closed` and drop the link
    ///
    /// Idempotent; only the first call has any effect.
    pub fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }

        if let Some(live) = self.inner.gate.current() {
            live.connection.dispose();
        }
        self.inner.gate.close();
        self.inner.set_state(ConnectionState::Closed);
        info!(
            destination_id = %self.inner.identity.destination_id,
            "session closed"
        );
    }

    /// Resolves once the session is closed
    pub async fn on_close(&self) {
        let mut receiver = self.inner.shutdown.subscribe();
        // The sender lives in `inner`, which outlives this borrow.
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for ReconnectingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingSession")
            .field("destination_id", &self.inner.identity.destination_id)
            .field("state", &self.state())
            .field("gate", &self.inner.gate)
            .finish()
    }
}

impl Drop for ReconnectingSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn run_session(inner: Arc<SessionInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let destination_id = inner.identity.destination_id;
    let mut attempt: u64 = 0;

    while !inner.is_closed() {
        attempt += 1;
        inner.set_state(ConnectionState::Connecting);
        debug!(%destination_id, attempt, "connecting");

        let handshake = match inner.identity.setup_frame(inner.ids.next_id()) {
            Ok(setup) => {
                tokio::select! {
                    result = inner.connector.connect(setup, inner.acceptor.clone()) => result,
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
            Err(err) => Err(err),
        };

        match handshake {
            Ok(handshake) => {
                let generation = inner.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
                let live = LiveSession::new(
                    handshake.connection,
                    handshake.session_key,
                    handshake.initial_counter,
                    generation,
                );

                inner.backoff.lock().reset();
                if !inner.gate.publish(live.clone()) {
                    live.connection.dispose();
                    break;
                }
                inner.set_state(ConnectionState::Established);
                attempt = 0;
                info!(
                    %destination_id,
                    generation,
                    key_len = live.key.len(),
                    "session established"
                );

                tokio::select! {
                    _ = live.connection.closed() => {
                        inner.gate.invalidate();
                        warn!(%destination_id, generation, "connection lost");
                    }
                    _ = shutdown_requested(&mut shutdown) => {
                        live.connection.dispose();
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(%destination_id, attempt, error = %err, "handshake failed");
            }
        }

        let delay = inner.next_backoff();
        inner.set_state(ConnectionState::Reconnecting { delay });
        debug!(
            %destination_id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    inner.set_state(ConnectionState::Closed);
    debug!(%destination_id, "session loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Handshake, OutboundStream, Payload, PayloadStream, RejectingHandler};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_backoff_grows_linearly_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.current(), Duration::ZERO);

        let delays: Vec<_> = (0..25).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(&delays[..4], &[500, 1000, 1500, 2000]);
        assert_eq!(delays[19], 10_000);
        assert_eq!(delays[24], 10_000);

        backoff.reset();
        assert_eq!(backoff.current(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    struct StubConnection {
        lost: watch::Sender<bool>,
    }

    #[async_trait]
    impl RoutedConnection for StubConnection {
        async fn fire_and_forget(&self, _payload: Payload) -> FabricResult<()> {
            Ok(())
        }

        async fn request_response(&self, payload: Payload) -> FabricResult<Payload> {
            Ok(payload)
        }

        async fn request_stream(&self, _payload: Payload) -> FabricResult<PayloadStream> {
            Err(FabricError::transport("unsupported"))
        }

        async fn request_channel(&self, _payloads: OutboundStream) -> FabricResult<PayloadStream> {
            Err(FabricError::transport("unsupported"))
        }

        async fn metadata_push(&self, _payload: Payload) -> FabricResult<()> {
            Ok(())
        }

        fn availability(&self) -> f64 {
            0.75
        }

        async fn closed(&self) {
            let mut lost = self.lost.subscribe();
            let _ = lost.wait_for(|lost| *lost).await;
        }

        fn dispose(&self) {
            self.lost.send_replace(true);
        }
    }

    /// Fails the first `failures` handshakes, then hands out stub connections
    struct FlakyConnector {
        failures: usize,
        attempts: AtomicUsize,
        issued: Mutex<Vec<Arc<StubConnection>>>,
    }

    impl FlakyConnector {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                attempts: AtomicUsize::new(0),
                issued: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Option<Arc<StubConnection>> {
            self.issued.lock().last().cloned()
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(
            &self,
            setup: Vec<u8>,
            _acceptor: Arc<dyn RequestHandler>,
        ) -> FabricResult<Handshake> {
            fabric_core::decode_destination_setup(&setup)?;
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(FabricError::connection_unavailable("refused"));
            }

            let (lost, _) = watch::channel(false);
            let connection = Arc::new(StubConnection { lost });
            self.issued.lock().push(connection.clone());
            Ok(Handshake {
                connection,
                session_key: SessionKey::new(b"stub-key".to_vec()),
                initial_counter: 10,
            })
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            account_id: AccountId(100),
            destination_id: DestinationId::from_name("tester"),
            group: GroupPath::from_name("test.client").unwrap(),
            access_token: vec![0; 20],
        }
    }

    fn start(connector: Arc<FlakyConnector>) -> ReconnectingSession {
        ReconnectingSession::start(
            identity(),
            connector,
            Arc::new(RejectingHandler),
            BackoffConfig::testing(),
            Arc::new(TimeBasedIdGenerator::new(1)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_retries_until_handshake_succeeds() {
        let connector = FlakyConnector::new(3);
        let session = start(connector.clone());

        let live = session.current().await.unwrap();
        assert_eq!(live.generation(), 1);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(session.current_backoff(), Duration::ZERO);
        assert_eq!(
            session
                .wait_for_state(|s| *s == ConnectionState::Established)
                .await
                .unwrap(),
            ConnectionState::Established
        );
        assert_eq!(session.availability(), 0.75);
    }

    #[tokio::test]
    async fn test_counter_continues_from_initial_value() {
        let session = start(FlakyConnector::new(0));
        let live = session.current().await.unwrap();
        assert_eq!(live.next_counter(), 11);
        assert_eq!(live.next_counter(), 12);

        let counter = session.current_counter().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 12);
        assert_eq!(session.current_session_key().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_link_loss_invalidates_and_republishes() {
        let connector = FlakyConnector::new(0);
        let session = start(connector.clone());
        session.current().await.unwrap();

        connector.last().unwrap().dispose();
        let state = session
            .wait_for_state(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .await
            .unwrap();
        assert_eq!(
            state,
            ConnectionState::Reconnecting {
                delay: Duration::from_millis(10)
            }
        );

        let live = session.current().await.unwrap();
        assert_eq!(live.generation(), 2);
        session
            .wait_for_state(|s| *s == ConnectionState::Established)
            .await
            .unwrap();
        assert_eq!(session.current_backoff(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_is_idempotent() {
        let session = Arc::new(start(FlakyConnector::new(usize::MAX)));
        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.current().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        session.close();
        session.close();
        assert_matches!(waiter.await.unwrap(), Err(FabricError::Closed { .. }));
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(session.availability(), 0.0);
        session.on_close().await;
        assert_matches!(
            session
                .wait_for_state(|s| *s == ConnectionState::Established)
                .await,
            Err(FabricError::Closed { .. })
        );
    }

    #[test]
    fn test_start_outside_runtime_is_config_error() {
        assert_matches!(
            ReconnectingSession::start(
                identity(),
                FlakyConnector::new(0),
                Arc::new(RejectingHandler),
                BackoffConfig::testing(),
                Arc::new(TimeBasedIdGenerator::new(1)),
            ),
            Err(FabricError::Config { .. })
        );
    }

    #[tokio::test]
    async fn test_retire_replaces_only_the_stale_session() {
        let connector = FlakyConnector::new(0);
        let session = start(connector.clone());
        let stale = session.current().await.unwrap();

        assert!(session.retire(&stale));
        assert!(*connector.last().unwrap().lost.borrow());
        assert!(!session.retire(&stale));

        let fresh = session.current().await.unwrap();
        assert_eq!(fresh.generation(), 2);
        assert!(!session.retire(&stale));
        assert_eq!(session.gate_status(), GateStatus::Valid);
    }

    #[tokio::test]
    async fn test_close_disposes_live_connection() {
        let connector = FlakyConnector::new(0);
        let session = start(connector.clone());
        session.current().await.unwrap();

        session.close();
        let connection = connector.last().unwrap();
        assert!(*connection.lost.borrow());
    }
}
