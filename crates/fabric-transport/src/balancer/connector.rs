//! Connector that spreads handshakes over a weighted pool of links

use super::pool::WeightedTransportPool;
use crate::core::{AddressedConnector, Connector, Handshake, RequestHandler};
use async_trait::async_trait;
use fabric_core::FabricResult;
use std::sync::Arc;
use tracing::debug;

/// [`Connector`] that dials the pool's preferred link
///
/// The link's active count stays raised until the connection reports
/// `closed()`, or drops immediately if the handshake fails.
pub struct BalancedConnector {
    pool: Arc<WeightedTransportPool>,
    links: Arc<dyn AddressedConnector>,
}

impl BalancedConnector {
    /// Dial `pool` entries through `links`
    pub fn new(pool: Arc<WeightedTransportPool>, links: Arc<dyn AddressedConnector>) -> Self {
        Self { pool, links }
    }

    /// The pool being balanced over
    pub fn pool(&self) -> &Arc<WeightedTransportPool> {
        &self.pool
    }
}

#[async_trait]
impl Connector for BalancedConnector {
    async fn connect(
        &self,
        setup: Vec<u8>,
        acceptor: Arc<dyn RequestHandler>,
    ) -> FabricResult<Handshake> {
        let handle = self.pool.select_and_acquire()?;
        let address = handle.entry().address().to_string();

        match self.links.connect_to(&address, setup, acceptor).await {
            Ok(handshake) => {
                debug!(%address, "link connected");
                let connection = handshake.connection.clone();
                tokio::spawn(async move {
                    connection.closed().await;
                    handle.complete();
                });
                Ok(handshake)
            }
            Err(err) => {
                handle.fail(&err);
                Err(err)
            }
        }
    }
}
