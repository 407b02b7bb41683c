// Copyright (c) 2018-2022 The Botho Foundation

//! End-to-end agreement over fully-connected mesh topologies, driven through
//! a deterministic synchronous message pump.

use bth_consensus_scp::{
    test_utils::{
        deliver_until_quiet, mesh_quorum_slices, test_combine_fn, test_node_id,
        test_validity_fn, tick_and_deliver,
    },
    Node, NodeConfig, ScpNode,
};
use bth_consensus_scp_types::NodeID;
use maplit::btreeset;
use std::time::Duration;

const SLOT: u64 = 1;

fn new_mesh(n: u32, threshold: u32, config: NodeConfig) -> Vec<Node<String, NodeID>> {
    let ids: Vec<NodeID> = (1..=n).map(test_node_id).collect();
    let slices = mesh_quorum_slices(&ids, threshold);
    ids.iter()
        .map(|id| {
            Node::new(
                id.clone(),
                slices.clone(),
                test_validity_fn(),
                test_combine_fn(),
                SLOT,
                config.clone(),
            )
            .unwrap()
        })
        .collect()
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn mesh_of_four_agrees_on_common_value() {
    init_logging();
    let mut nodes = new_mesh(4, 3, NodeConfig::default());

    let mut initial = Vec::new();
    for node in nodes.iter_mut() {
        initial.extend(
            node.propose_values(SLOT, btreeset! {"X".to_string()})
                .unwrap(),
        );
    }
    deliver_until_quiet(&mut nodes, initial);

    for node in nodes.iter_mut() {
        assert_eq!(
            node.externalized_value(SLOT),
            Some("X".to_string()),
            "{} did not externalize",
            node.node_id()
        );
        // Each decision is reported upward exactly once.
        assert_eq!(node.take_externalized(), vec![(SLOT, "X".to_string())]);
        assert!(node.take_externalized().is_empty());
    }
}

#[test]
fn mesh_of_four_agrees_despite_conflicting_proposals() {
    init_logging();
    let mut nodes = new_mesh(4, 3, NodeConfig::default());

    let proposals: Vec<String> = (0..4).map(|i| format!("value-{i}")).collect();
    let mut initial = Vec::new();
    for (node, value) in nodes.iter_mut().zip(&proposals) {
        initial.extend(node.propose_values(SLOT, btreeset! {value.clone()}).unwrap());
    }
    deliver_until_quiet(&mut nodes, initial);

    // Safety: every node must decide, and all decisions must be identical.
    let decisions: Vec<String> = nodes
        .iter()
        .map(|node| node.externalized_value(SLOT).expect("no decision"))
        .collect();
    for decision in &decisions {
        assert_eq!(decision, &decisions[0]);
    }
    assert!(proposals.contains(&decisions[0]));
}

#[test]
fn double_delivery_changes_nothing() {
    init_logging();
    // The network tolerates duplication: delivering every message twice must
    // yield the same decisions and no extra emissions on the replay.
    let mut nodes = new_mesh(4, 3, NodeConfig::default());

    let mut initial = Vec::new();
    for node in nodes.iter_mut() {
        initial.extend(
            node.propose_values(SLOT, btreeset! {"X".to_string()})
                .unwrap(),
        );
    }
    let log = deliver_until_quiet(&mut nodes, initial);

    for msg in &log {
        for node in nodes.iter_mut() {
            if node.node_id() == msg.sender_id {
                continue;
            }
            let responses = node.handle_message(msg).unwrap();
            assert!(responses.is_empty(), "replay produced {responses:?}");
        }
    }
    for node in &nodes {
        assert_eq!(node.externalized_value(SLOT), Some("X".to_string()));
    }
}

#[test]
fn mesh_of_three_agrees() {
    init_logging();
    let mut nodes = new_mesh(3, 2, NodeConfig::default());

    let mut initial = Vec::new();
    for node in nodes.iter_mut() {
        initial.extend(
            node.propose_values(SLOT, btreeset! {"B".to_string()})
                .unwrap(),
        );
    }
    deliver_until_quiet(&mut nodes, initial);

    for node in &nodes {
        assert_eq!(node.externalized_value(SLOT), Some("B".to_string()));
    }
}

#[test]
fn mesh_survives_a_silent_node() {
    init_logging();
    // Four-node configuration, but node 4 never comes up. Round timeouts
    // accumulate leaders until an online node leads, then 3-of-4 carries the
    // slot.
    let config = NodeConfig {
        nomination_timebase: Duration::ZERO,
        ballot_timebase: Duration::ZERO,
        ..NodeConfig::default()
    };
    let mut nodes = new_mesh(4, 3, config);
    nodes.truncate(3);

    let mut initial = Vec::new();
    for node in nodes.iter_mut() {
        initial.extend(
            node.propose_values(SLOT, btreeset! {"X".to_string()})
                .unwrap(),
        );
    }
    deliver_until_quiet(&mut nodes, initial);

    let mut rounds = 0;
    while nodes
        .iter()
        .any(|node| node.externalized_value(SLOT).is_none())
    {
        rounds += 1;
        assert!(rounds < 100, "no agreement after {rounds} timeout rounds");
        tick_and_deliver(&mut nodes);
    }

    for node in &nodes {
        assert_eq!(node.externalized_value(SLOT), Some("X".to_string()));
    }
}

#[test]
fn late_joiner_is_dragged_to_the_decision() {
    init_logging();
    // Three of four nodes agree while the fourth is offline. Replaying the
    // traffic it missed pulls it to the same decision without it ever
    // nominating: the decided quorum's statements are v-blocking.
    let mut nodes = new_mesh(4, 3, NodeConfig::default());
    let mut late = nodes.pop().unwrap();

    let mut initial = Vec::new();
    for node in nodes.iter_mut() {
        initial.extend(
            node.propose_values(SLOT, btreeset! {"X".to_string()})
                .unwrap(),
        );
    }
    let log = deliver_until_quiet(&mut nodes, initial);
    for node in &nodes {
        assert_eq!(node.externalized_value(SLOT), Some("X".to_string()));
    }

    for msg in &log {
        late.handle_message(msg).unwrap();
    }
    assert_eq!(late.externalized_value(SLOT), Some("X".to_string()));
}

#[test]
fn externalize_statements_alone_decide_a_fresh_node() {
    init_logging();
    // Even hearing nothing but the final externalize statements, a node is
    // forced to the decision: two externalizing peers are v-blocking for a
    // 3-of-4 slice, and three of them are a full quorum.
    let mut nodes = new_mesh(4, 3, NodeConfig::default());
    let mut fresh = nodes.pop().unwrap();

    let mut initial = Vec::new();
    for node in nodes.iter_mut() {
        initial.extend(
            node.propose_values(SLOT, btreeset! {"X".to_string()})
                .unwrap(),
        );
    }
    let log = deliver_until_quiet(&mut nodes, initial);

    for msg in log.iter().filter(|msg| {
        matches!(msg.topic, bth_consensus_scp::Topic::Externalize(_))
    }) {
        fresh.handle_message(msg).unwrap();
    }
    assert_eq!(fresh.externalized_value(SLOT), Some("X".to_string()));
}
