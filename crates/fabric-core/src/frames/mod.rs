//! Binary routing frames
//!
//! Three wire structures address and authenticate requests: the
//! destination-setup frame sent once per connection, the route that says
//! where a request goes, and the routing envelope wrapped around every
//! request's metadata.
//!
//! All integers are big-endian. Every `compute_*_length` function agrees
//! exactly with its encoder: encoders allocate that many bytes and write all
//! of them. Decoders go through [`FrameReader`] and never index past the end
//! of their input; truncation surfaces as `MalformedFrame`.

pub mod envelope;
pub mod route;
pub mod setup;

pub use envelope::*;
pub use route::*;
pub use setup::*;

use crate::errors::{FabricError, FabricResult};

/// Version carried in the first byte of setup frames and envelopes
pub const FRAME_VERSION: u8 = 1;

/// Size of a length prefix for token bytes and group paths
pub(crate) const LEN_PREFIX_SIZE: usize = 2;

/// Reject lengths that cannot be represented by a `u16` prefix
pub(crate) fn checked_prefix(len: usize, field: &str) -> FabricResult<u16> {
    u16::try_from(len).map_err(|_| {
        FabricError::invalid_argument(format!(
            "{field} has {len} entries, at most {} fit on the wire",
            u16::MAX
        ))
    })
}

/// Bounds-checked cursor over an encoded frame
#[derive(Debug)]
pub(crate) struct FrameReader<'a> {
    frame: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(frame: &'static str, buf: &'a [u8]) -> Self {
        Self { frame, buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> FabricResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let bytes = &self.buf[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(FabricError::malformed_frame(format!(
                "{}: need {} bytes at offset {}, have {}",
                self.frame,
                n,
                self.pos,
                self.buf.len().saturating_sub(self.pos)
            ))),
        }
    }

    pub(crate) fn u8(&mut self) -> FabricResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> FabricResult<u16> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(bytes))
    }

    pub(crate) fn u32(&mut self) -> FabricResult<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(bytes))
    }

    pub(crate) fn u64(&mut self) -> FabricResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    /// `u16` length prefix followed by that many bytes
    pub(crate) fn prefixed_bytes(&mut self) -> FabricResult<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// `u16` count followed by that many `u64` ids
    pub(crate) fn ids(&mut self) -> FabricResult<Vec<u64>> {
        let count = self.u16()? as usize;
        // Check the whole run up front so a bogus count never drives allocation.
        let raw = self.take(count * 8)?;
        Ok(raw
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                u64::from_be_bytes(bytes)
            })
            .collect())
    }

    pub(crate) fn version(&mut self) -> FabricResult<u8> {
        let version = self.u8()?;
        if version != FRAME_VERSION {
            return Err(FabricError::malformed_frame(format!(
                "{}: unsupported version {version}",
                self.frame
            )));
        }
        Ok(version)
    }

    /// Everything not yet consumed
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fail if bytes remain after a fixed-layout frame
    pub(crate) fn finish(self) -> FabricResult<()> {
        if self.pos != self.buf.len() {
            return Err(FabricError::malformed_frame(format!(
                "{}: {} trailing bytes",
                self.frame,
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

pub(crate) fn put_prefixed_bytes(buf: &mut Vec<u8>, len: u16, bytes: &[u8]) {
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
}

pub(crate) fn put_ids(buf: &mut Vec<u8>, count: u16, ids: &[u64]) {
    buf.extend_from_slice(&count.to_be_bytes());
    for id in ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
}
