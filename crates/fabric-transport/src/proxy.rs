//! Client-side proxy over a declared service
//!
//! Every method is called with exactly one payload and answers with a
//! stream: one item for request-response, none for fire-and-forget.

use crate::core::{OutboundStream, Payload, PayloadStream};
use crate::service::{CallShape, MethodDescriptor, ServiceDescriptor};
use crate::socket::RoutingSocket;
use fabric_core::{FabricError, FabricResult};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::debug;

/// Calls the methods of `descriptor` through a routing socket
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    socket: RoutingSocket,
    descriptor: Arc<ServiceDescriptor>,
}

impl ServiceProxy {
    /// Proxy for `descriptor` sending through `socket`
    pub fn new(socket: RoutingSocket, descriptor: Arc<ServiceDescriptor>) -> Self {
        Self { socket, descriptor }
    }

    /// Service being proxied
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Underlying socket
    pub fn socket(&self) -> &RoutingSocket {
        &self.socket
    }

    /// Call `method` with `payload` using its declared shape
    pub async fn call(&self, method: &str, payload: Payload) -> FabricResult<PayloadStream> {
        let method = self.resolve(method)?;
        let payload = tag(method, payload);
        debug!(
            service = %method.service,
            method = %method.name,
            shape = ?method.shape,
            "proxy call"
        );

        match method.shape {
            CallShape::FireAndForget => {
                self.socket.fire_and_forget(payload).await?;
                Ok(stream::empty().boxed())
            }
            CallShape::RequestResponse => {
                let reply = self.socket.request_response(payload).await?;
                Ok(stream::iter([Ok(reply)]).boxed())
            }
            CallShape::RequestStream => self.socket.request_stream(payload).await,
            CallShape::RequestChannel => {
                self.socket
                    .request_channel(stream::iter([payload]).boxed())
                    .await
            }
        }
    }

    /// Open a channel to `method` with a caller-driven outbound stream
    pub async fn channel(
        &self,
        method: &str,
        payloads: OutboundStream,
    ) -> FabricResult<PayloadStream> {
        let method = self.resolve(method)?;
        if method.shape != CallShape::RequestChannel {
            return Err(FabricError::invalid_argument(format!(
                "{}.{} is {:?}, not a channel",
                method.service, method.name, method.shape
            )));
        }

        let method = method.clone();
        let tagged = payloads.map(move |payload| tag(&method, payload)).boxed();
        self.socket.request_channel(tagged).await
    }

    fn resolve(&self, method: &str) -> FabricResult<&MethodDescriptor> {
        self.descriptor.method(method).ok_or_else(|| {
            FabricError::invalid_argument(format!(
                "{} has no method {method}",
                self.descriptor.name()
            ))
        })
    }
}

fn tag(method: &MethodDescriptor, payload: Payload) -> Payload {
    Payload {
        metadata: method.id.prefix(&payload.metadata),
        data: payload.data,
    }
}
