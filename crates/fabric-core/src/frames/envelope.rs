//! Routing envelope wrapped around every request's metadata
//!
//! ```text
//! [version:1][request_token:4][access_key:8][source_destination_id:8][request_id:8][route][metadata...]
//! ```
//!
//! The route is self-delimiting, and the application metadata is everything
//! after it.

use super::route::{decode_route_prefix, read_route, Route};
use super::{FrameReader, FRAME_VERSION};
use crate::errors::{FabricError, FabricResult};
use crate::identifiers::DestinationId;

/// Bytes before the route
pub const ENVELOPE_HEADER_SIZE: usize = 1 + 4 + 8 + 8 + 8;

/// Fixed-width fields of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Compact per-request authentication tag
    pub request_token: u32,
    /// Account access key
    pub access_key: u64,
    /// Destination the request originates from
    pub source: DestinationId,
    /// Time-based unique request id
    pub request_id: u64,
}

/// Decoded routing envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEnvelope {
    /// Fixed-width header fields
    pub header: EnvelopeHeader,
    /// Where the request goes
    pub route: Route,
    /// Caller-supplied application metadata
    pub metadata: Vec<u8>,
}

/// Exact encoded length of an envelope
pub fn compute_envelope_length(route_len: usize, metadata_len: usize) -> usize {
    ENVELOPE_HEADER_SIZE + route_len + metadata_len
}

/// Encode an envelope around an already encoded route
///
/// `route` must hold exactly one encoded route; anything else is rejected
/// before a byte is written.
pub fn encode_envelope(
    header: &EnvelopeHeader,
    route: &[u8],
    metadata: &[u8],
) -> FabricResult<Vec<u8>> {
    match decode_route_prefix(route) {
        Ok((_, consumed)) if consumed == route.len() => {}
        _ => {
            return Err(FabricError::invalid_argument(
                "envelope route is not a single encoded route",
            ))
        }
    }

    let len = compute_envelope_length(route.len(), metadata.len());
    let mut buf = Vec::with_capacity(len);
    buf.push(FRAME_VERSION);
    buf.extend_from_slice(&header.request_token.to_be_bytes());
    buf.extend_from_slice(&header.access_key.to_be_bytes());
    buf.extend_from_slice(&header.source.value().to_be_bytes());
    buf.extend_from_slice(&header.request_id.to_be_bytes());
    buf.extend_from_slice(route);
    buf.extend_from_slice(metadata);

    debug_assert_eq!(buf.len(), len, "envelope length mismatch");
    Ok(buf)
}

/// Decode a full envelope
pub fn decode_envelope(buf: &[u8]) -> FabricResult<RoutingEnvelope> {
    let mut reader = FrameReader::new("routing envelope", buf);
    let header = read_header(&mut reader)?;
    let route = read_route(&mut reader)?;
    let metadata = reader.rest().to_vec();
    Ok(RoutingEnvelope {
        header,
        route,
        metadata,
    })
}

/// Decode only the header of an envelope
pub fn decode_envelope_header(buf: &[u8]) -> FabricResult<EnvelopeHeader> {
    let mut reader = FrameReader::new("routing envelope", buf);
    read_header(&mut reader)
}

/// Decode only the route of an envelope
pub fn envelope_route(buf: &[u8]) -> FabricResult<Route> {
    let mut reader = FrameReader::new("routing envelope", buf);
    reader.take(ENVELOPE_HEADER_SIZE)?;
    read_route(&mut reader)
}

/// Borrow the application metadata of an envelope without copying
pub fn envelope_metadata(buf: &[u8]) -> FabricResult<&[u8]> {
    let mut reader = FrameReader::new("routing envelope", buf);
    reader.take(ENVELOPE_HEADER_SIZE)?;
    read_route(&mut reader)?;
    Ok(reader.rest())
}

fn read_header(reader: &mut FrameReader<'_>) -> FabricResult<EnvelopeHeader> {
    reader.version()?;
    Ok(EnvelopeHeader {
        request_token: reader.u32()?,
        access_key: reader.u64()?,
        source: DestinationId(reader.u64()?),
        request_id: reader.u64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::route::{encode_route_by_destination, encode_route_by_group};
    use crate::identifiers::{AccountId, GroupPath};
    use assert_matches::assert_matches;

    fn header() -> EnvelopeHeader {
        EnvelopeHeader {
            request_token: 0xDEAD_BEEF,
            access_key: 3_855_261_330_795_754_807,
            source: DestinationId::from_name("tester"),
            request_id: 99,
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let group = GroupPath::from_name("test.server").unwrap();
        let route = encode_route_by_group(AccountId(100), &group).unwrap();
        let bytes = encode_envelope(&header(), &route, b"app-metadata").unwrap();

        assert_eq!(
            bytes.len(),
            compute_envelope_length(route.len(), b"app-metadata".len())
        );

        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.header, header());
        assert_eq!(
            decoded.route,
            Route::ByGroup {
                account_id: AccountId(100),
                group
            }
        );
        assert_eq!(decoded.metadata, b"app-metadata");
    }

    #[test]
    fn test_empty_metadata_is_allowed() {
        let route =
            encode_route_by_destination(AccountId(1), DestinationId(2), &GroupPath::default())
                .unwrap();
        let bytes = encode_envelope(&header(), &route, &[]).unwrap();
        assert!(envelope_metadata(&bytes).unwrap().is_empty());
        assert_eq!(
            envelope_route(&bytes).unwrap().destination_id(),
            Some(DestinationId(2))
        );
    }

    #[test]
    fn test_field_order_on_the_wire() {
        let route = encode_route_by_group(AccountId(1), &GroupPath::from_ids(vec![7])).unwrap();
        let bytes = encode_envelope(&header(), &route, b"m").unwrap();
        assert_eq!(bytes[0], FRAME_VERSION);
        assert_eq!(&bytes[1..5], &0xDEAD_BEEFu32.to_be_bytes());
        assert_eq!(&bytes[5..13], &header().access_key.to_be_bytes());
        assert_eq!(&bytes[21..29], &99u64.to_be_bytes());
        assert_eq!(&bytes[29..29 + route.len()], route.as_slice());
        assert_eq!(bytes.last(), Some(&b'm'));
    }

    #[test]
    fn test_bad_route_rejected_before_encoding() {
        let route = encode_route_by_group(AccountId(1), &GroupPath::from_ids(vec![7])).unwrap();
        assert_matches!(
            encode_envelope(&header(), &route[..route.len() - 1], b""),
            Err(FabricError::InvalidArgument { .. })
        );

        let mut padded = route.clone();
        padded.push(0);
        assert_matches!(
            encode_envelope(&header(), &padded, b""),
            Err(FabricError::InvalidArgument { .. })
        );
    }

    #[test]
    fn test_truncated_envelope_is_malformed() {
        let route = encode_route_by_group(AccountId(1), &GroupPath::from_ids(vec![7])).unwrap();
        let bytes = encode_envelope(&header(), &route, b"").unwrap();
        for cut in 0..bytes.len() {
            assert_matches!(
                decode_envelope(&bytes[..cut]),
                Err(FabricError::MalformedFrame { .. })
            );
        }
    }
}
