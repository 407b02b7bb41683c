// Copyright (c) 2018-2022 The Botho Foundation

//! Helpers for tests: trivial callbacks, mesh topologies, and a deterministic
//! synchronous network pump.

use crate::{
    msg::Msg,
    node::{Node, ScpNode},
    slot::{CombineFn, ValidityFn},
};
use bth_consensus_scp_types::{GenericNodeId, QuorumSliceSet, Value};
use std::{collections::VecDeque, sync::Arc};

pub use bth_consensus_scp_types::test_utils::{test_node_id, test_node_id_and_signer};

/// A validity callback that accepts everything.
pub fn test_validity_fn<V: Value>() -> ValidityFn<V> {
    Arc::new(|_| Ok(()))
}

/// A combine callback that deterministically picks the greatest candidate.
pub fn test_combine_fn<V: Value>() -> CombineFn<V> {
    Arc::new(|candidates| {
        candidates
            .iter()
            .next_back()
            .cloned()
            .ok_or_else(|| "combine called with no candidates".to_string())
    })
}

/// A fully-connected quorum configuration: every node trusts the same
/// `threshold`-of-all slice.
pub fn mesh_quorum_slices<ID: GenericNodeId>(
    node_ids: &[ID],
    threshold: u32,
) -> QuorumSliceSet<ID> {
    QuorumSliceSet::single(threshold, node_ids.iter().cloned())
}

/// Deliver messages to every node but the sender, collecting responses, until
/// the network goes quiet. Delivery is synchronous and deterministic: this is
/// the single-threaded serialized pipeline the engine is designed for.
///
/// Returns the full delivery log in order. Panics if the network does not
/// quiesce (a protocol loop) or a node rejects a message.
pub fn deliver_until_quiet<V: Value, ID: GenericNodeId>(
    nodes: &mut [Node<V, ID>],
    initial: Vec<Msg<V, ID>>,
) -> Vec<Msg<V, ID>> {
    let mut queue: VecDeque<Msg<V, ID>> = initial.into();
    let mut log = Vec::new();
    while let Some(msg) = queue.pop_front() {
        assert!(log.len() < 100_000, "network did not quiesce");
        for node in nodes.iter_mut() {
            if node.node_id() == msg.sender_id {
                continue;
            }
            let responses = node
                .handle_message(&msg)
                .unwrap_or_else(|err| panic!("{} rejected {msg}: {err}", node.node_id()));
            queue.extend(responses);
        }
        log.push(msg);
    }
    log
}

/// One round of timeout processing across all nodes, followed by delivery of
/// everything it produced.
pub fn tick_and_deliver<V: Value, ID: GenericNodeId>(
    nodes: &mut [Node<V, ID>],
) -> Vec<Msg<V, ID>> {
    let mut produced = Vec::new();
    for node in nodes.iter_mut() {
        produced.extend(node.process_timeouts());
    }
    deliver_until_quiet(nodes, produced)
}
