//! Inbound handler registry
//!
//! Requests routed to this destination arrive with the routing envelope
//! still in their metadata. The registry strips the envelope, reads the
//! method id, checks the call shape against the registered descriptor and
//! hands the request to the service's handler. Presence announcements are
//! acknowledged here without reaching any service.

use crate::core::{OutboundStream, Payload, PayloadStream, RequestHandler};
use crate::presence::{presence_ack, presence_method_id};
use crate::service::{CallShape, MethodDescriptor, MethodId, ServiceDescriptor};
use async_trait::async_trait;
use fabric_core::{envelope_metadata, DestinationId, FabricError, FabricResult};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Serves the methods of one registered service
///
/// Each method is invoked with the descriptor of the method being called;
/// payload metadata has the envelope and method id already removed.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Fire-and-forget method
    async fn fire_and_forget(
        &self,
        method: &MethodDescriptor,
        _payload: Payload,
    ) -> FabricResult<()> {
        Err(not_implemented(method))
    }

    /// Request-response method
    async fn request_response(
        &self,
        method: &MethodDescriptor,
        _payload: Payload,
    ) -> FabricResult<Payload> {
        Err(not_implemented(method))
    }

    /// Request-stream method
    async fn request_stream(
        &self,
        method: &MethodDescriptor,
        _payload: Payload,
    ) -> FabricResult<PayloadStream> {
        Err(not_implemented(method))
    }

    /// Request-channel method; `first` is the payload that selected the method
    async fn request_channel(
        &self,
        method: &MethodDescriptor,
        _first: Payload,
        _rest: OutboundStream,
    ) -> FabricResult<PayloadStream> {
        Err(not_implemented(method))
    }

    /// Metadata pushed to this destination
    async fn metadata_push(&self, _metadata: Vec<u8>) -> FabricResult<()> {
        Ok(())
    }
}

fn not_implemented(method: &MethodDescriptor) -> FabricError {
    FabricError::handler(format!(
        "{}.{} is not implemented",
        method.service, method.name
    ))
}

#[derive(Clone)]
struct Registered {
    method: MethodDescriptor,
    handler: Arc<dyn ServiceHandler>,
}

#[derive(Default)]
struct RegistryTable {
    methods: HashMap<MethodId, Registered>,
    services: HashMap<String, Arc<dyn ServiceHandler>>,
}

/// Method table for requests routed to this destination
pub struct HandlerRegistry {
    local: DestinationId,
    table: RwLock<RegistryTable>,
}

impl HandlerRegistry {
    /// Empty registry for destination `local`
    pub fn new(local: DestinationId) -> Self {
        Self {
            local,
            table: RwLock::new(RegistryTable::default()),
        }
    }

    /// Register `handler` for every method of `descriptor`
    ///
    /// Fails without registering anything if the service name or any method
    /// id is already taken.
    pub fn register(
        &self,
        descriptor: &ServiceDescriptor,
        handler: Arc<dyn ServiceHandler>,
    ) -> FabricResult<()> {
        let mut table = self.table.write();
        if table.services.contains_key(descriptor.name()) {
            return Err(FabricError::invalid_argument(format!(
                "service {} is already registered",
                descriptor.name()
            )));
        }
        for method in descriptor.methods() {
            if method.id == presence_method_id() || table.methods.contains_key(&method.id) {
                return Err(FabricError::invalid_argument(format!(
                    "method {}.{} is already registered",
                    method.service, method.name
                )));
            }
        }

        for method in descriptor.methods() {
            table.methods.insert(
                method.id,
                Registered {
                    method: method.clone(),
                    handler: handler.clone(),
                },
            );
        }
        table
            .services
            .insert(descriptor.name().to_string(), handler);
        debug!(
            service = descriptor.name(),
            methods = descriptor.len(),
            "service registered"
        );
        Ok(())
    }

    /// Remove a service; returns `false` if it was not registered
    pub fn deregister(&self, service: &str) -> bool {
        let mut table = self.table.write();
        if table.services.remove(service).is_none() {
            return false;
        }
        table
            .methods
            .retain(|_, registered| registered.method.service != service);
        true
    }

    /// Names of the registered services
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.table.read().services.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, id: MethodId, called_as: CallShape) -> FabricResult<Registered> {
        let registered = self
            .table
            .read()
            .methods
            .get(&id)
            .cloned()
            .ok_or_else(|| FabricError::handler(format!("no handler for {id}")))?;

        let method = &registered.method;
        if method.shape != called_as {
            return Err(FabricError::handler(format!(
                "{}.{} is {:?} but was called as {called_as:?}",
                method.service, method.name, method.shape
            )));
        }
        Ok(registered)
    }
}

/// Strip envelope and method id from an inbound payload
fn inbound_method(payload: Payload) -> FabricResult<(MethodId, Payload)> {
    let application = envelope_metadata(&payload.metadata)?;
    let (id, rest) = MethodId::split(application)?;
    let metadata = rest.to_vec();
    Ok((
        id,
        Payload {
            data: payload.data,
            metadata,
        },
    ))
}

#[async_trait]
impl RequestHandler for HandlerRegistry {
    async fn fire_and_forget(&self, payload: Payload) -> FabricResult<()> {
        let (id, payload) = inbound_method(payload)?;
        let registered = self.lookup(id, CallShape::FireAndForget)?;
        registered
            .handler
            .fire_and_forget(&registered.method, payload)
            .await
    }

    async fn request_response(&self, payload: Payload) -> FabricResult<Payload> {
        let (id, payload) = inbound_method(payload)?;
        if id == presence_method_id() {
            debug!(destination_id = %self.local, "presence acknowledged");
            return Ok(presence_ack(self.local));
        }
        let registered = self.lookup(id, CallShape::RequestResponse)?;
        registered
            .handler
            .request_response(&registered.method, payload)
            .await
    }

    async fn request_stream(&self, payload: Payload) -> FabricResult<PayloadStream> {
        let (id, payload) = inbound_method(payload)?;
        let registered = self.lookup(id, CallShape::RequestStream)?;
        registered
            .handler
            .request_stream(&registered.method, payload)
            .await
    }

    async fn request_channel(&self, mut payloads: OutboundStream) -> FabricResult<PayloadStream> {
        let first = payloads
            .next()
            .await
            .ok_or_else(|| FabricError::handler("request-channel opened without a payload"))?;
        let (id, first) = inbound_method(first)?;
        let registered = self.lookup(id, CallShape::RequestChannel)?;

        // A malformed follow-up ends the inbound side and is reported on the
        // response stream.
        let (fault_tx, fault_rx) = oneshot::channel::<FabricError>();
        let rest = stream::unfold(Some((payloads, fault_tx)), |state| async move {
            let (mut payloads, fault_tx) = state?;
            let payload = payloads.next().await?;
            match inbound_method(payload) {
                Ok((_, payload)) => Some((payload, Some((payloads, fault_tx)))),
                Err(err) => {
                    warn!(error = %err, "malformed channel payload, closing inbound side");
                    let _ = fault_tx.send(err);
                    None
                }
            }
        })
        .boxed();

        let responses = registered
            .handler
            .request_channel(&registered.method, first, rest)
            .await?;
        let faults = stream::once(fault_rx).filter_map(|fault| async move { fault.ok().map(Err) });
        Ok(stream::select(responses, faults).boxed())
    }

    async fn metadata_push(&self, payload: Payload) -> FabricResult<()> {
        let metadata = envelope_metadata(&payload.metadata)?.to_vec();
        let handlers: Vec<_> = self.table.read().services.values().cloned().collect();
        for handler in handlers {
            handler.metadata_push(metadata.clone()).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("local", &self.local)
            .field("services", &self.services())
            .finish()
    }
}
