// Copyright (c) 2018-2022 The Botho Foundation

//! The Node ID type

use crate::{keys::Ed25519Public, responder_id::ResponderId};
use core::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result as FmtResult},
    hash::{Hash, Hasher},
};
use serde::{Deserialize, Serialize};

/// Node unique identifier containing a responder id as well as a unique public
/// key.
///
/// Equality, ordering, and hashing all go through the public key: the
/// responder id is routing information and may change across restarts.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeID {
    /// The responder id for this node.
    pub responder_id: ResponderId,
    /// The public message-signing key for this node.
    pub public_key: Ed25519Public,
}

impl Display for NodeID {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}:{}", self.responder_id, self.public_key)
    }
}

impl Hash for NodeID {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.public_key.hash(hasher);
    }
}

impl PartialEq for NodeID {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for NodeID {}

impl PartialOrd for NodeID {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeID {
    fn cmp(&self, other: &Self) -> Ordering {
        self.public_key.cmp(&other.public_key)
    }
}

impl From<&NodeID> for ResponderId {
    fn from(src: &NodeID) -> Self {
        src.responder_id.clone()
    }
}

impl AsRef<ResponderId> for NodeID {
    fn as_ref(&self) -> &ResponderId {
        &self.responder_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_node_id;

    #[test]
    fn equality_is_by_public_key() {
        // Same key seed, different responder ids: still the same node.
        let node1 = NodeID {
            responder_id: ResponderId("host1:1111".to_string()),
            ..test_node_id(42)
        };
        let node2 = NodeID {
            responder_id: ResponderId("host2:2222".to_string()),
            ..test_node_id(42)
        };
        let node3 = test_node_id(99);

        assert_eq!(node1, node2);
        assert_ne!(node1, node3);
    }

    #[test]
    fn hash_is_by_public_key() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(NodeID {
            responder_id: ResponderId("a:1".to_string()),
            ..test_node_id(7)
        });
        assert!(set.contains(&NodeID {
            responder_id: ResponderId("b:2".to_string()),
            ..test_node_id(7)
        }));
        assert!(!set.contains(&test_node_id(8)));
    }

    #[test]
    fn display_contains_responder_id() {
        let node = test_node_id(1);
        assert!(node.to_string().starts_with("node1.test.com:8443:"));
    }

    #[test]
    fn serde_round_trip() {
        let node = test_node_id(5);
        let json = serde_json::to_string(&node).unwrap();
        let decoded: NodeID = serde_json::from_str(&json).unwrap();
        assert_eq!(node, decoded);
    }
}
