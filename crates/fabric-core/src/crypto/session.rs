//! Per-request authentication tags
//!
//! Every request carries a compact tag derived in two steps from the session
//! key, the request payload and the session counter value assigned to the
//! request:
//!
//! 1. `session_tag = HMAC-SHA256(session_key, payload || counter_be)`
//! 2. `compact_tag = first 4 bytes of HMAC-SHA256(session_tag, payload || counter_be)`
//!
//! Both steps are pure functions of their inputs.

use crate::errors::{FabricError, FabricResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Size of a full session tag
pub const SESSION_TAG_SIZE: usize = 32;

/// Session key issued by the routing fabric during the handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    /// Wrap raw key bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the key has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({} bytes)", self.0.len())
    }
}

/// Keyed tag over `payload` and `counter` under the session key
pub fn derive_session_tag(
    session_key: &[u8],
    payload: &[u8],
    counter: u64,
) -> FabricResult<[u8; SESSION_TAG_SIZE]> {
    if session_key.is_empty() {
        return Err(FabricError::invalid_argument("session key is empty"));
    }
    keyed_digest(session_key, payload, counter)
}

/// Reduce a session tag to the fixed-width field carried in the envelope
pub fn derive_compact_tag(tag: &[u8], payload: &[u8], counter: u64) -> FabricResult<u32> {
    if tag.is_empty() {
        return Err(FabricError::invalid_argument("session tag is empty"));
    }
    let digest = keyed_digest(tag, payload, counter)?;
    Ok(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

/// Both steps at once, as the dispatcher uses them
pub fn request_token(
    session_key: &SessionKey,
    payload: &[u8],
    counter: u64,
) -> FabricResult<u32> {
    let tag = derive_session_tag(session_key.as_bytes(), payload, counter)?;
    derive_compact_tag(&tag, payload, counter)
}

fn keyed_digest(
    key: &[u8],
    payload: &[u8],
    counter: u64,
) -> FabricResult<[u8; SESSION_TAG_SIZE]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| FabricError::invalid_argument(format!("unusable key: {e}")))?;
    mac.update(payload);
    mac.update(&counter.to_be_bytes());

    let mut digest = [0u8; SESSION_TAG_SIZE];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}
