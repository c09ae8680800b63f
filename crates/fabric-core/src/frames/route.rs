//! Route-destination frames
//!
//! ```text
//! by destination: [type=1][account_id:8][destination_id:8][group_len:2][group_ids:8*n]
//! by group:       [type=2][account_id:8][group_len:2][group_ids:8*n]
//! ```

use super::{checked_prefix, put_ids, FrameReader, LEN_PREFIX_SIZE};
use crate::errors::{FabricError, FabricResult};
use crate::identifiers::{AccountId, DestinationId, GroupPath};
use serde::{Deserialize, Serialize};

/// Discriminator written as the first byte of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RouteType {
    /// Deliver to one destination
    ByDestination = 1,
    /// Deliver to any member of a group
    ByGroup = 2,
}

impl RouteType {
    /// Wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag
    pub fn from_tag(tag: u8) -> FabricResult<Self> {
        match tag {
            1 => Ok(Self::ByDestination),
            2 => Ok(Self::ByGroup),
            other => Err(FabricError::malformed_frame(format!(
                "route: unknown route type {other}"
            ))),
        }
    }
}

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    /// A single destination, qualified by its group
    ByDestination {
        /// Account the destination belongs to
        account_id: AccountId,
        /// Target destination
        destination_id: DestinationId,
        /// Group of the target destination
        group: GroupPath,
    },
    /// Any destination in a group
    ByGroup {
        /// Account the group belongs to
        account_id: AccountId,
        /// Target group
        group: GroupPath,
    },
}

impl Route {
    /// Route kind
    pub fn route_type(&self) -> RouteType {
        match self {
            Self::ByDestination { .. } => RouteType::ByDestination,
            Self::ByGroup { .. } => RouteType::ByGroup,
        }
    }

    /// Account the route is scoped to
    pub fn account_id(&self) -> AccountId {
        match self {
            Self::ByDestination { account_id, .. } | Self::ByGroup { account_id, .. } => {
                *account_id
            }
        }
    }

    /// Group path of the target
    pub fn group(&self) -> &GroupPath {
        match self {
            Self::ByDestination { group, .. } | Self::ByGroup { group, .. } => group,
        }
    }

    /// Destination id, for destination routes
    pub fn destination_id(&self) -> Option<DestinationId> {
        match self {
            Self::ByDestination { destination_id, .. } => Some(*destination_id),
            Self::ByGroup { .. } => None,
        }
    }

    /// Exact encoded length
    pub fn encoded_len(&self) -> usize {
        compute_route_length(self.route_type(), self.group().len())
    }

    /// Encode this route
    pub fn encode(&self) -> FabricResult<Vec<u8>> {
        match self {
            Self::ByDestination {
                account_id,
                destination_id,
                group,
            } => encode_route_by_destination(*account_id, *destination_id, group),
            Self::ByGroup { account_id, group } => encode_route_by_group(*account_id, group),
        }
    }
}

/// Exact encoded length of a route of `route_type` with `group_len` segments
pub fn compute_route_length(route_type: RouteType, group_len: usize) -> usize {
    let fixed = match route_type {
        RouteType::ByDestination => 1 + 8 + 8,
        RouteType::ByGroup => 1 + 8,
    };
    fixed + LEN_PREFIX_SIZE + group_len * 8
}

/// Encode a route to a single destination
pub fn encode_route_by_destination(
    account_id: AccountId,
    destination_id: DestinationId,
    group: &GroupPath,
) -> FabricResult<Vec<u8>> {
    let count = checked_prefix(group.len(), "group path")?;
    let len = compute_route_length(RouteType::ByDestination, group.len());

    let mut buf = Vec::with_capacity(len);
    buf.push(RouteType::ByDestination.tag());
    buf.extend_from_slice(&account_id.value().to_be_bytes());
    buf.extend_from_slice(&destination_id.value().to_be_bytes());
    put_ids(&mut buf, count, group.ids());

    debug_assert_eq!(buf.len(), len, "route length mismatch");
    Ok(buf)
}

/// Encode a route to any member of a group
pub fn encode_route_by_group(account_id: AccountId, group: &GroupPath) -> FabricResult<Vec<u8>> {
    let count = checked_prefix(group.len(), "group path")?;
    let len = compute_route_length(RouteType::ByGroup, group.len());

    let mut buf = Vec::with_capacity(len);
    buf.push(RouteType::ByGroup.tag());
    buf.extend_from_slice(&account_id.value().to_be_bytes());
    put_ids(&mut buf, count, group.ids());

    debug_assert_eq!(buf.len(), len, "route length mismatch");
    Ok(buf)
}

/// Decode a route occupying all of `buf`
pub fn decode_route(buf: &[u8]) -> FabricResult<Route> {
    let mut reader = FrameReader::new("route", buf);
    let route = read_route(&mut reader)?;
    reader.finish()?;
    Ok(route)
}

/// Decode a route at the start of `buf`, returning it and its encoded length
pub fn decode_route_prefix(buf: &[u8]) -> FabricResult<(Route, usize)> {
    let mut reader = FrameReader::new("route", buf);
    let route = read_route(&mut reader)?;
    Ok((route, reader.position()))
}

pub(crate) fn read_route(reader: &mut FrameReader<'_>) -> FabricResult<Route> {
    let route_type = RouteType::from_tag(reader.u8()?)?;
    let account_id = AccountId(reader.u64()?);
    match route_type {
        RouteType::ByDestination => {
            let destination_id = DestinationId(reader.u64()?);
            let group = GroupPath::from_ids(reader.ids()?);
            Ok(Route::ByDestination {
                account_id,
                destination_id,
                group,
            })
        }
        RouteType::ByGroup => {
            let group = GroupPath::from_ids(reader.ids()?);
            Ok(Route::ByGroup { account_id, group })
        }
    }
}
