//! # Fabric Core - wire routing and session security
//!
//! Runtime-free building blocks shared by every participant of the routing
//! fabric:
//!
//! - **Identifiers**: hashed destination ids and group paths scoped to accounts
//! - **Frames**: destination-setup, route and routing-envelope codecs with
//!   exact, precomputed lengths and bounds-checked decoding
//! - **Crypto**: per-request authentication tags derived from the session key
//! - **Time**: time-based unique request ids
//! - **Errors**: the unified [`FabricError`] taxonomy

#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod crypto;
pub mod errors;
pub mod frames;
pub mod identifiers;
pub mod time;

pub use crypto::{derive_compact_tag, derive_session_tag, request_token, SessionKey};
pub use errors::{FabricError, FabricResult};
pub use frames::{
    compute_destination_setup_length, compute_envelope_length, compute_route_length,
    decode_destination_setup, decode_envelope, decode_envelope_header, decode_route,
    decode_route_prefix, encode_destination_setup, encode_envelope, encode_route_by_destination,
    encode_route_by_group, envelope_metadata, envelope_route, setup_destination_id,
    DestinationSetup, EnvelopeHeader, Route, RouteType, RoutingEnvelope, FRAME_VERSION,
};
pub use identifiers::{hash_name, AccountId, DestinationId, GroupPath};
pub use time::TimeBasedIdGenerator;
