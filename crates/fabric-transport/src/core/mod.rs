//! Transport contracts and the in-process fabric

pub mod memory;
pub mod traits;

pub use memory::MemoryFabric;
pub use traits::{
    AddressedConnector, Connector, Handshake, OutboundStream, Payload, PayloadStream,
    RejectingHandler, RequestHandler, RoutedConnection,
};
