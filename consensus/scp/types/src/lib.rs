// Copyright (c) 2018-2022 The Botho Foundation

//! Foundational data model for the federated consensus core: identifiers,
//! values, and quorum-slice configuration. Contains no protocol logic.

#![deny(missing_docs)]

pub mod core_types;
pub mod keys;
pub mod node_id;
pub mod quorum_set;
pub mod responder_id;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use crate::{
    core_types::{GenericNodeId, SlotIndex, Value},
    keys::{Ed25519Public, Ed25519Signature},
    node_id::NodeID,
    quorum_set::{QuorumSlice, QuorumSliceSet},
    responder_id::ResponderId,
};
