//! Destination-setup frame, sent as the handshake metadata of a new connection
//!
//! ```text
//! [version:1]
//! [account_token_len:2][account_token]
//! [access_token_len:2][access_token]
//! [account_id:8][destination_id:8][request_id:8]
//! [group_len:2][group_ids:8*n]
//! ```

use super::{
    checked_prefix, put_ids, put_prefixed_bytes, FrameReader, FRAME_VERSION, LEN_PREFIX_SIZE,
};
use crate::errors::FabricResult;
use crate::identifiers::{AccountId, DestinationId, GroupPath};

/// Decoded destination-setup frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSetup {
    /// Opaque account token, empty when unused
    pub account_token: Vec<u8>,
    /// Access token bytes
    pub access_token: Vec<u8>,
    /// Account the destination belongs to
    pub account_id: AccountId,
    /// Destination announcing itself
    pub destination_id: DestinationId,
    /// Unique id of this handshake
    pub request_id: u64,
    /// Group the destination joins
    pub group: GroupPath,
}

impl DestinationSetup {
    /// Exact encoded length
    pub fn encoded_len(&self) -> usize {
        compute_destination_setup_length(
            self.account_token.len(),
            self.access_token.len(),
            self.group.len(),
        )
    }

    /// Encode this frame
    pub fn encode(&self) -> FabricResult<Vec<u8>> {
        encode_destination_setup(self)
    }
}

/// Exact encoded length of a setup frame
pub fn compute_destination_setup_length(
    account_token_len: usize,
    access_token_len: usize,
    group_len: usize,
) -> usize {
    1 + LEN_PREFIX_SIZE
        + account_token_len
        + LEN_PREFIX_SIZE
        + access_token_len
        + 8
        + 8
        + 8
        + LEN_PREFIX_SIZE
        + group_len * 8
}

/// Encode a setup frame
pub fn encode_destination_setup(setup: &DestinationSetup) -> FabricResult<Vec<u8>> {
    let account_token_len = checked_prefix(setup.account_token.len(), "account token")?;
    let access_token_len = checked_prefix(setup.access_token.len(), "access token")?;
    let group_len = checked_prefix(setup.group.len(), "group path")?;
    let len = setup.encoded_len();

    let mut buf = Vec::with_capacity(len);
    buf.push(FRAME_VERSION);
    put_prefixed_bytes(&mut buf, account_token_len, &setup.account_token);
    put_prefixed_bytes(&mut buf, access_token_len, &setup.access_token);
    buf.extend_from_slice(&setup.account_id.value().to_be_bytes());
    buf.extend_from_slice(&setup.destination_id.value().to_be_bytes());
    buf.extend_from_slice(&setup.request_id.to_be_bytes());
    put_ids(&mut buf, group_len, setup.group.ids());

    debug_assert_eq!(buf.len(), len, "setup length mismatch");
    Ok(buf)
}

/// Decode a setup frame occupying all of `buf`
pub fn decode_destination_setup(buf: &[u8]) -> FabricResult<DestinationSetup> {
    let mut reader = FrameReader::new("destination setup", buf);
    reader.version()?;
    let account_token = reader.prefixed_bytes()?.to_vec();
    let access_token = reader.prefixed_bytes()?.to_vec();
    let account_id = AccountId(reader.u64()?);
    let destination_id = DestinationId(reader.u64()?);
    let request_id = reader.u64()?;
    let group = GroupPath::from_ids(reader.ids()?);
    reader.finish()?;

    Ok(DestinationSetup {
        account_token,
        access_token,
        account_id,
        destination_id,
        request_id,
        group,
    })
}

/// Read only the destination id of a setup frame
pub fn setup_destination_id(buf: &[u8]) -> FabricResult<DestinationId> {
    let mut reader = FrameReader::new("destination setup", buf);
    reader.version()?;
    reader.prefixed_bytes()?;
    reader.prefixed_bytes()?;
    reader.u64()?;
    Ok(DestinationId(reader.u64()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FabricError;
    use assert_matches::assert_matches;

    fn sample() -> DestinationSetup {
        DestinationSetup {
            account_token: Vec::new(),
            access_token: vec![0xAB; 20],
            account_id: AccountId(u64::MAX >> 1),
            destination_id: DestinationId::from_name("tester"),
            request_id: 42,
            group: GroupPath::from_name("test.groupPresence").unwrap(),
        }
    }

    #[test]
    fn test_setup_round_trip() {
        let setup = sample();
        let bytes = setup.encode().unwrap();
        assert_eq!(bytes.len(), setup.encoded_len());
        assert_eq!(decode_destination_setup(&bytes).unwrap(), setup);
    }

    #[test]
    fn test_destination_id_accessor() {
        let setup = sample();
        let bytes = setup.encode().unwrap();
        assert_eq!(setup_destination_id(&bytes).unwrap(), setup.destination_id);
    }

    #[test]
    fn test_length_matches_field_sum() {
        // 1 + (2+0) + (2+20) + 24 + (2 + 2*8)
        assert_eq!(sample().encoded_len(), 1 + 2 + 22 + 24 + 18);
    }

    #[test]
    fn test_truncated_setup_is_malformed() {
        let bytes = sample().encode().unwrap();
        for cut in [0, 1, 3, 10, bytes.len() - 1] {
            assert_matches!(
                decode_destination_setup(&bytes[..cut]),
                Err(FabricError::MalformedFrame { .. })
            );
        }
    }

    #[test]
    fn test_wrong_version_is_malformed() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = FRAME_VERSION + 1;
        assert_matches!(
            decode_destination_setup(&bytes),
            Err(FabricError::MalformedFrame { .. })
        );
    }

    #[test]
    fn test_oversized_token_is_invalid_argument() {
        let mut setup = sample();
        setup.access_token = vec![0; u16::MAX as usize + 1];
        assert_matches!(setup.encode(), Err(FabricError::InvalidArgument { .. }));
    }
}
