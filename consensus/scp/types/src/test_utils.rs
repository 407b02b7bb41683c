// Copyright (c) 2018-2022 The Botho Foundation

//! Helpers for tests that need concrete node identities.

use crate::{keys::Ed25519Public, node_id::NodeID, responder_id::ResponderId};
use ed25519_dalek::SigningKey;

/// Deterministically create a [`NodeID`] from a small seed.
///
/// The same seed always yields the same identity, so fixtures can refer to
/// "node 3" across test runs.
pub fn test_node_id(n: u32) -> NodeID {
    let (node_id, _signer) = test_node_id_and_signer(n);
    node_id
}

/// Like [`test_node_id`], but also returns the matching signing key for tests
/// that produce signed envelopes.
pub fn test_node_id_and_signer(n: u32) -> (NodeID, SigningKey) {
    let mut seed = [0u8; 32];
    seed[..4].copy_from_slice(&n.to_be_bytes());
    let signer = SigningKey::from_bytes(&seed);
    let node_id = NodeID {
        responder_id: ResponderId(format!("node{n}.test.com:8443")),
        public_key: Ed25519Public(signer.verifying_key().to_bytes()),
    };
    (node_id, signer)
}
