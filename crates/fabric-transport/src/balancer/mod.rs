//! Load-aware selection among several physical links

pub mod connector;
pub mod pool;

pub use connector::BalancedConnector;
pub use pool::{ConnectionHandle, EntrySnapshot, Outcome, WeightedEntry, WeightedTransportPool};
