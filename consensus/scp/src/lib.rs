// Copyright (c) 2018-2022 The Botho Foundation

#![doc = include_str!("../README.md")]
#![allow(non_snake_case)]
#![deny(missing_docs)]

pub mod ballot;
pub mod ballot_protocol;
mod error;
pub mod msg;
pub mod node;
pub mod nomination_protocol;
pub mod predicates;
pub mod quorum_set_ext;
pub mod slot;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

#[doc(inline)]
pub use bth_consensus_scp_types::{core_types, quorum_set};

#[doc(inline)]
pub use crate::{
    ballot::Ballot,
    core_types::{GenericNodeId, SlotIndex, Value},
    error::{ScpError, ScpResult},
    msg::{Msg, Topic},
    node::{MockScpNode, Node, NodeConfig, ScpNode},
    quorum_set::{QuorumSlice, QuorumSliceSet},
    quorum_set_ext::QuorumSliceSetExt,
    slot::{CombineFn, ValidityFn},
};
