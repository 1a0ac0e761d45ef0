//! Node identifiers and the node-id/port conventions from spec §6.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Lowest valid TCP port for a node (spec §6: ports lie in `[1024, 65535]`).
pub const MIN_PORT: u32 = 1024;

/// Highest valid TCP port for a node.
pub const MAX_PORT: u32 = 65535;

/// Base port offset: `node-<k>` defaults to port `7200 + k`.
pub const PORT_BASE: u32 = 7200;

/// A validated node identifier matching `node-[1-9][0-9]*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Builds a `NodeId` from its numeric suffix `k` (`k >= 1`).
    pub fn new(k: u32) -> Result<Self> {
        if k == 0 {
            return Err(Error::InvalidNodeId(format!("node-{k}")));
        }
        Ok(Self(k))
    }

    /// The numeric suffix `k` in `node-<k>`.
    pub fn index(self) -> u32 {
        self.0
    }

    /// The default port for this node: `7200 + k`.
    pub fn default_port(self) -> u32 {
        PORT_BASE + self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let suffix = s
            .strip_prefix("node-")
            .ok_or_else(|| Error::InvalidNodeId(s.to_string()))?;

        if suffix.is_empty()
            || suffix.starts_with('0')
            || !suffix.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(Error::InvalidNodeId(s.to_string()));
        }

        let k: u32 = suffix
            .parse()
            .map_err(|_| Error::InvalidNodeId(s.to_string()))?;
        NodeId::new(k)
    }
}

/// Validates a port against the `[1024, 65535]` range required by spec §6.
pub fn validate_port(port: u32) -> Result<u32> {
    if (MIN_PORT..=MAX_PORT).contains(&port) {
        Ok(port)
    } else {
        Err(Error::InvalidPort(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parses_well_formed_ids() {
        let id: NodeId = "node-1".parse().unwrap();
        assert_eq!(id.index(), 1);
        assert_eq!(id.to_string(), "node-1");
        assert_eq!(id.default_port(), 7201);
    }

    #[test_case("node-0" ; "zero suffix")]
    #[test_case("node-01" ; "leading zero")]
    #[test_case("peer-1" ; "wrong prefix")]
    #[test_case("node-" ; "empty suffix")]
    #[test_case("node-abc" ; "non-numeric suffix")]
    #[test_case("node--1" ; "double dash")]
    fn rejects_malformed_ids(input: &str) {
        assert!(input.parse::<NodeId>().is_err());
    }

    #[test_case(1, 7201)]
    #[test_case(3, 7203)]
    #[test_case(42, 7242)]
    fn default_port_is_7200_plus_k(k: u32, expected_port: u32) {
        assert_eq!(NodeId::new(k).unwrap().default_port(), expected_port);
    }

    #[test_case(1023, false ; "below range")]
    #[test_case(1024, true ; "lower bound")]
    #[test_case(65535, true ; "upper bound")]
    #[test_case(65536, false ; "above range")]
    fn validates_port_range(port: u32, expect_ok: bool) {
        assert_eq!(validate_port(port).is_ok(), expect_ok);
    }
}
