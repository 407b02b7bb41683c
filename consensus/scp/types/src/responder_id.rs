// Copyright (c) 2018-2022 The Botho Foundation

//! The responder id: the network address a node answers on.

use core::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};
use serde::{Deserialize, Serialize};

/// Node unique identifier for the networking layer, typically `host:port`.
///
/// Two nodes may share a responder id (e.g. behind a load balancer); consensus
/// identity is established by the public key in [`crate::NodeID`], not by this.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ResponderId(
    /// The address string.
    pub String,
);

impl Display for ResponderId {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResponderId {
    type Err = core::convert::Infallible;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        Ok(Self(src.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_round_trips() {
        let id = ResponderId::from_str("node1:8443").unwrap();
        assert_eq!(id.to_string(), "node1:8443");
    }
}
