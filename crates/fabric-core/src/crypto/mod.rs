//! Cryptographic helpers for session authentication

pub mod session;

pub use session::{
    derive_compact_tag, derive_session_tag, request_token, SessionKey, SESSION_TAG_SIZE,
};
