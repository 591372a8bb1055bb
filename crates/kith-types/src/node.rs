//! Device types, consensus weights and peer classification.

use serde::{Deserialize, Serialize};

/// Consensus weight of a server device.
pub const WEIGHT_SERVER: u32 = 2_000_000;
/// Consensus weight of a desktop device.
pub const WEIGHT_DESKTOP: u32 = 2_000;
/// Consensus weight of a mobile device.
pub const WEIGHT_MOBILE: u32 = 2;

/// Kind of device running the node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Server,
    #[default]
    Desktop,
    Mobile,
}

impl NodeType {
    pub fn weight(self) -> u32 {
        match self {
            NodeType::Server => WEIGHT_SERVER,
            NodeType::Desktop => WEIGHT_DESKTOP,
            NodeType::Mobile => WEIGHT_MOBILE,
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = crate::TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(NodeType::Server),
            "desktop" => Ok(NodeType::Desktop),
            "mobile" => Ok(NodeType::Mobile),
            other => Err(crate::TypeError::Unknown {
                kind: "node type",
                value: other.to_string(),
            }),
        }
    }
}

/// How a remote peer relates to the local identity. Ordered by trust.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    Random,
    Pending,
    Member,
    Important,
    Me,
}

/// Sort direction for list queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    #[default]
    Asc,
    Desc,
}
