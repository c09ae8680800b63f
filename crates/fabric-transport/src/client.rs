//! Client context and builder
//!
//! [`FabricClient`] is the explicit context object for one destination: it
//! owns the reconnecting session, the request id generator, the inbound
//! handler registry and the presence notifier. Sockets and proxies are
//! created from it and share its session.

use crate::balancer::{BalancedConnector, WeightedTransportPool};
use crate::config::{BackoffConfig, FabricConfig, LinkConfig};
use crate::core::{AddressedConnector, Connector};
use crate::presence::PresenceNotifier;
use crate::proxy::ServiceProxy;
use crate::reconnect::{ReconnectingSession, SessionIdentity};
use crate::registry::{HandlerRegistry, ServiceHandler};
use crate::service::ServiceDescriptor;
use crate::socket::RoutingSocket;
use fabric_core::{AccountId, DestinationId, FabricResult, GroupPath, Route, TimeBasedIdGenerator};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One destination's connection to the fabric
pub struct FabricClient {
    config: FabricConfig,
    account_id: AccountId,
    destination_id: DestinationId,
    group: GroupPath,
    session: Arc<ReconnectingSession>,
    ids: Arc<TimeBasedIdGenerator>,
    registry: Arc<HandlerRegistry>,
    presence: Arc<PresenceNotifier>,
    pool: Option<Arc<WeightedTransportPool>>,
}

impl FabricClient {
    /// Validate `config` and start connecting through `connector`
    ///
    /// Must be called inside a Tokio runtime.
    pub fn connect(config: FabricConfig, connector: Arc<dyn Connector>) -> FabricResult<Self> {
        Self::start(config, connector, None)
    }

    /// Like [`FabricClient::connect`], spreading handshakes over the configured links
    pub fn connect_balanced(
        config: FabricConfig,
        links: Arc<dyn AddressedConnector>,
    ) -> FabricResult<Self> {
        config.validate()?;
        let pool = Arc::new(WeightedTransportPool::new(config.effective_links())?);
        let connector = Arc::new(BalancedConnector::new(pool.clone(), links));
        Self::start(config, connector, Some(pool))
    }

    fn start(
        config: FabricConfig,
        connector: Arc<dyn Connector>,
        pool: Option<Arc<WeightedTransportPool>>,
    ) -> FabricResult<Self> {
        config.validate()?;
        let account_id = AccountId(config.account_id);
        let destination_id = config.destination_id()?;
        let group = config.group_path()?;

        let ids = Arc::new(TimeBasedIdGenerator::new(destination_id.value()));
        let registry = Arc::new(HandlerRegistry::new(destination_id));
        let identity = SessionIdentity {
            account_id,
            destination_id,
            group: group.clone(),
            access_token: config.access_token_bytes()?,
        };
        let session = Arc::new(ReconnectingSession::start(
            identity,
            connector,
            registry.clone(),
            config.backoff,
            ids.clone(),
        )?);
        let presence = Arc::new(PresenceNotifier::new(
            session.clone(),
            config.access_key,
            ids.clone(),
            config.presence_timeout(),
        ));

        info!(
            %destination_id,
            %group,
            %account_id,
            address = %config.address(),
            "fabric client started"
        );
        Ok(Self {
            config,
            account_id,
            destination_id,
            group,
            session,
            ids,
            registry,
            presence,
            pool,
        })
    }

    /// Socket to any destination in `group`
    pub fn socket_to_group(
        &self,
        account_id: AccountId,
        group: &GroupPath,
    ) -> FabricResult<RoutingSocket> {
        self.socket(Route::ByGroup {
            account_id,
            group: group.clone(),
        })
    }

    /// Socket to `destination_id` in `group`
    pub fn socket_to_destination(
        &self,
        account_id: AccountId,
        destination_id: DestinationId,
        group: &GroupPath,
    ) -> FabricResult<RoutingSocket> {
        self.socket(Route::ByDestination {
            account_id,
            destination_id,
            group: group.clone(),
        })
    }

    /// Socket to an explicit route
    pub fn socket(&self, target: Route) -> FabricResult<RoutingSocket> {
        RoutingSocket::new(
            self.session.clone(),
            target,
            self.config.access_key,
            self.ids.clone(),
        )
    }

    /// Proxy for `descriptor` sending to `target`
    pub fn proxy(
        &self,
        descriptor: Arc<ServiceDescriptor>,
        target: Route,
    ) -> FabricResult<ServiceProxy> {
        Ok(ServiceProxy::new(self.socket(target)?, descriptor))
    }

    /// Serve `descriptor` with `handler` for requests routed here
    pub fn register_handler(
        &self,
        descriptor: &ServiceDescriptor,
        handler: Arc<dyn ServiceHandler>,
    ) -> FabricResult<()> {
        self.registry.register(descriptor, handler)
    }

    /// Presence notifier sharing this client's session
    pub fn presence_notifier(&self) -> Arc<PresenceNotifier> {
        self.presence.clone()
    }

    /// Usability of the session in `[0, 1]`
    pub fn availability(&self) -> f64 {
        self.session.availability()
    }

    /// The reconnecting session
    pub fn session(&self) -> &Arc<ReconnectingSession> {
        &self.session
    }

    /// Weighted pool, when connected with [`FabricClient::connect_balanced`]
    pub fn pool(&self) -> Option<&Arc<WeightedTransportPool>> {
        self.pool.as_ref()
    }

    /// Account this client belongs to
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// This client's destination id
    pub fn destination_id(&self) -> DestinationId {
        self.destination_id
    }

    /// This client's group
    pub fn group(&self) -> &GroupPath {
        &self.group
    }

    /// Effective configuration
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Close the session; idempotent
    pub fn close(&self) {
        self.session.close();
    }

    /// Resolves once the client is closed
    pub async fn on_close(&self) {
        self.session.on_close().await;
    }
}

impl fmt::Debug for FabricClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricClient")
            .field("destination_id", &self.destination_id)
            .field("group", &self.group)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`FabricClient`]
#[derive(Debug, Clone, Default)]
pub struct FabricBuilder {
    config: FabricConfig,
}

impl FabricBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: FabricConfig) -> Self {
        Self { config }
    }

    /// Broker host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Broker port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Account access key
    pub fn access_key(mut self, access_key: u64) -> Self {
        self.config.access_key = access_key;
        self
    }

    /// Base64 access token; decoded when building
    pub fn access_token(mut self, access_token: impl Into<String>) -> Self {
        self.config.access_token = Some(access_token.into());
        self
    }

    /// Account id
    pub fn account_id(mut self, account_id: u64) -> Self {
        self.config.account_id = account_id;
        self
    }

    /// Destination name
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.config.destination = Some(destination.into());
        self
    }

    /// Explicit destination id
    pub fn destination_id(mut self, destination_id: u64) -> Self {
        self.config.destination_id = Some(destination_id);
        self
    }

    /// Dot-separated group name
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Reconnect schedule
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Default presence deadline
    pub fn presence_timeout(mut self, timeout: Duration) -> Self {
        self.config.presence_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Add a weighted candidate link
    pub fn link(mut self, address: impl Into<String>, weight: f64) -> Self {
        self.config.links.push(LinkConfig {
            address: address.into(),
            weight,
        });
        self
    }

    /// Configuration built so far
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Validate and start a client over `connector`
    pub fn build(self, connector: Arc<dyn Connector>) -> FabricResult<FabricClient> {
        FabricClient::connect(self.config, connector)
    }

    /// Validate and start a client balancing over the configured links
    pub fn build_balanced(self, links: Arc<dyn AddressedConnector>) -> FabricResult<FabricClient> {
        FabricClient::connect_balanced(self.config, links)
    }
}
