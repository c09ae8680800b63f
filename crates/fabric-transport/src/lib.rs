//! # Fabric Transport - reconnecting, session-authenticated routing
//!
//! Connection-resilience layer of the routing fabric:
//!
//! - **Gate**: concurrent rendezvous on "the current usable connection"
//! - **Reconnect**: handshake, session bookkeeping and backoff reconnect loop
//! - **Balancer**: weighted, load-aware choice among candidate links
//! - **Socket**: per-request counter, token and envelope, then forward
//! - **Presence**: liveness announcements with caller deadlines
//! - **Service / Registry / Proxy**: method tables built once, inbound dispatch,
//!   outbound calls with stream-shaped results
//! - **Client**: the explicit context object tying these together
//!
//! The point-to-point transport is abstracted by the traits in [`crate::core`];
//! [`crate::core::MemoryFabric`] is an in-process implementation for tests and demos.

#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod balancer;
pub mod client;
pub mod config;
pub mod core;
pub mod gate;
pub mod presence;
pub mod proxy;
pub mod reconnect;
pub mod registry;
pub mod service;
pub mod socket;

pub use balancer::{BalancedConnector, ConnectionHandle, WeightedTransportPool};
pub use client::{FabricBuilder, FabricClient};
pub use config::{BackoffConfig, FabricConfig, LinkConfig};
pub use crate::core::{
    AddressedConnector, Connector, Handshake, MemoryFabric, OutboundStream, Payload,
    PayloadStream, RejectingHandler, RequestHandler, RoutedConnection,
};
pub use gate::{AvailabilityGate, GateStatus};
pub use presence::{PresenceAck, PresenceNotifier, PresenceRecord};
pub use proxy::ServiceProxy;
pub use reconnect::{Backoff, ConnectionState, LiveSession, ReconnectingSession, SessionIdentity};
pub use registry::{HandlerRegistry, ServiceHandler};
pub use service::{CallShape, MethodDescriptor, MethodId, ServiceDescriptor};
pub use socket::RoutingSocket;

pub use fabric_core::{FabricError, FabricResult};
