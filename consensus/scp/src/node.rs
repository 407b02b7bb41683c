// Copyright (c) 2018-2022 The Botho Foundation

//! The consensus engine: owns the local identity, the quorum configuration,
//! and the bounded window of active slots, and routes messages to them.

use crate::{
    error::{ScpError, ScpResult},
    msg::Msg,
    slot::{CombineFn, Slot, ValidityFn},
};
use bth_consensus_scp_types::{GenericNodeId, NodeID, QuorumSliceSet, SlotIndex, Value};
use mockall::automock;
use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};
use tracing::{debug, info, trace};

/// Tuning parameters for the engine.
///
/// These are operational knobs, not safety parameters: retention and horizon
/// bound memory, the timeout curve trades latency for stability under
/// contention.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// How many slots below the highest externalized slot stay addressable.
    /// Messages below the resulting floor are rejected as stale.
    pub retention_window: u64,

    /// How far above the current slot messages may lazily create slots.
    /// Messages beyond the horizon are rejected.
    pub future_horizon: u64,

    /// Base of the linear nomination round timeout (round `n` waits
    /// `n * nomination_timebase`, capped).
    pub nomination_timebase: Duration,

    /// Base of the linear ballot timeout (counter `n` waits
    /// `n * ballot_timebase`, capped).
    pub ballot_timebase: Duration,

    /// Upper bound for both timeout curves.
    pub max_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            retention_window: 10,
            future_horizon: 1000,
            nomination_timebase: Duration::from_secs(1),
            ballot_timebase: Duration::from_secs(1),
            max_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl NodeConfig {
    /// Timeout before nomination round `round` advances.
    pub fn nomination_timeout(&self, round: u32) -> Duration {
        (self.nomination_timebase * round).min(self.max_timeout)
    }

    /// Timeout before the ballot counter bumps past `counter`.
    pub fn ballot_timeout(&self, counter: u32) -> Duration {
        (self.ballot_timebase * counter).min(self.max_timeout)
    }
}

/// The external interface of the consensus engine.
///
/// Outbound statements are returned from each call for the caller to
/// broadcast; decided slots are drained through [`ScpNode::take_externalized`],
/// which reports each decision exactly once.
#[automock]
pub trait ScpNode<V: Value, ID: GenericNodeId>: Send {
    /// The local node's identity.
    fn node_id(&self) -> ID;

    /// The local node's quorum slices.
    fn quorum_slices(&self) -> QuorumSliceSet<ID>;

    /// The next undecided slot index.
    fn current_slot_index(&self) -> SlotIndex;

    /// Propose values for a slot, starting nomination.
    fn propose_values(
        &mut self,
        slot_index: SlotIndex,
        values: BTreeSet<V>,
    ) -> ScpResult<Vec<Msg<V, ID>>>;

    /// Fold one validated message into the owning slot.
    fn handle_message(&mut self, msg: &Msg<V, ID>) -> ScpResult<Vec<Msg<V, ID>>>;

    /// Fire due timers across all active slots.
    fn process_timeouts(&mut self) -> Vec<Msg<V, ID>>;

    /// The decided value for a slot, if it externalized and is retained.
    fn externalized_value(&self, slot_index: SlotIndex) -> Option<V>;

    /// Drain newly decided slots. Each (slot, value) pair is returned exactly
    /// once, in slot order.
    fn take_externalized(&mut self) -> Vec<(SlotIndex, V)>;
}

/// The engine implementation.
pub struct Node<V: Value, ID: GenericNodeId = NodeID> {
    local_id: ID,
    quorum_slices: QuorumSliceSet<ID>,
    validity_fn: ValidityFn<V>,
    combine_fn: CombineFn<V>,
    config: NodeConfig,

    /// Active slots, keyed by index. Sub-protocols hold no reference back
    /// here; everything they produce is returned as values and propagated up.
    slots: BTreeMap<SlotIndex, Slot<V, ID>>,

    /// Decided values within the retention window.
    externalized: BTreeMap<SlotIndex, V>,

    /// Decisions not yet drained by the caller.
    pending_externalized: Vec<(SlotIndex, V)>,

    /// Highest externalized slot ever, the anchor of the retention floor.
    max_externalized: Option<SlotIndex>,

    /// The next undecided slot index.
    current_slot: SlotIndex,
}

impl<V: Value, ID: GenericNodeId> Node<V, ID> {
    /// Create an engine.
    ///
    /// Fails if the local quorum-slice configuration is structurally invalid;
    /// no slot could ever make progress under it.
    pub fn new(
        local_id: ID,
        quorum_slices: QuorumSliceSet<ID>,
        validity_fn: ValidityFn<V>,
        combine_fn: CombineFn<V>,
        current_slot_index: SlotIndex,
        config: NodeConfig,
    ) -> ScpResult<Self> {
        if !quorum_slices.is_valid() {
            return Err(ScpError::QuorumSetConfig(format!(
                "unusable local quorum slices {quorum_slices}"
            )));
        }
        Ok(Self {
            local_id,
            quorum_slices,
            validity_fn,
            combine_fn,
            config,
            slots: BTreeMap::new(),
            externalized: BTreeMap::new(),
            pending_externalized: Vec::new(),
            max_externalized: None,
            current_slot: current_slot_index,
        })
    }

    /// The lowest slot index still addressable, once anything externalized.
    pub fn retention_floor(&self) -> Option<SlotIndex> {
        self.max_externalized
            .map(|max| max.saturating_sub(self.config.retention_window))
    }

    fn get_or_create_slot(&mut self, slot_index: SlotIndex) -> &mut Slot<V, ID> {
        let local_id = self.local_id.clone();
        let quorum_slices = self.quorum_slices.clone();
        let validity_fn = self.validity_fn.clone();
        let combine_fn = self.combine_fn.clone();
        let config = self.config.clone();
        self.slots.entry(slot_index).or_insert_with(|| {
            trace!(slot = slot_index, "creating slot");
            Slot::new(
                slot_index,
                local_id,
                quorum_slices,
                validity_fn,
                combine_fn,
                config,
            )
        })
    }

    // Pick up newly decided slots, advance the floor, and evict what fell
    // below it.
    fn collect_externalized(&mut self) {
        let mut newly: Vec<(SlotIndex, V)> = Vec::new();
        for (index, slot) in self.slots.iter_mut() {
            if let Some(value) = slot.take_externalized_event() {
                newly.push((*index, value));
            }
        }

        for (index, value) in &newly {
            info!(slot = *index, "externalized");
            self.externalized.insert(*index, value.clone());
            if self.max_externalized.is_none_or(|max| *index > max) {
                self.max_externalized = Some(*index);
            }
            if *index >= self.current_slot {
                self.current_slot = index + 1;
            }
        }
        self.pending_externalized.extend(newly);

        if let Some(floor) = self.retention_floor() {
            let before = self.slots.len();
            self.slots.retain(|index, _| *index >= floor);
            self.externalized.retain(|index, _| *index >= floor);
            if self.slots.len() != before {
                debug!(floor, evicted = before - self.slots.len(), "evicted stale slots");
            }
        }
    }

    fn check_slot_bounds(&self, slot_index: SlotIndex) -> ScpResult<()> {
        if let Some(floor) = self.retention_floor() {
            if slot_index < floor {
                return Err(ScpError::StaleSlot { slot_index, floor });
            }
        }
        let horizon = self.current_slot.saturating_add(self.config.future_horizon);
        if slot_index > horizon {
            return Err(ScpError::SlotBeyondHorizon {
                slot_index,
                horizon,
            });
        }
        Ok(())
    }
}

impl<V: Value, ID: GenericNodeId> ScpNode<V, ID> for Node<V, ID> {
    fn node_id(&self) -> ID {
        self.local_id.clone()
    }

    fn quorum_slices(&self) -> QuorumSliceSet<ID> {
        self.quorum_slices.clone()
    }

    fn current_slot_index(&self) -> SlotIndex {
        self.current_slot
    }

    fn propose_values(
        &mut self,
        slot_index: SlotIndex,
        values: BTreeSet<V>,
    ) -> ScpResult<Vec<Msg<V, ID>>> {
        self.check_slot_bounds(slot_index)?;
        if self.externalized.contains_key(&slot_index) {
            return Ok(Vec::new());
        }
        let outbound = self.get_or_create_slot(slot_index).propose_values(values)?;
        self.collect_externalized();
        Ok(outbound)
    }

    fn handle_message(&mut self, msg: &Msg<V, ID>) -> ScpResult<Vec<Msg<V, ID>>> {
        self.check_slot_bounds(msg.slot_index)?;
        let outbound = self.get_or_create_slot(msg.slot_index).process_msg(msg)?;
        self.collect_externalized();
        Ok(outbound)
    }

    fn process_timeouts(&mut self) -> Vec<Msg<V, ID>> {
        let now = Instant::now();
        let mut outbound = Vec::new();
        for slot in self.slots.values_mut() {
            outbound.extend(slot.process_timeouts(now));
        }
        self.collect_externalized();
        outbound
    }

    fn externalized_value(&self, slot_index: SlotIndex) -> Option<V> {
        self.externalized.get(&slot_index).cloned()
    }

    fn take_externalized(&mut self) -> Vec<(SlotIndex, V)> {
        let mut drained = std::mem::take(&mut self.pending_externalized);
        drained.sort_by_key(|(index, _)| *index);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_combine_fn, test_validity_fn};
    use maplit::btreeset;

    fn solo_node(config: NodeConfig) -> Node<String, u32> {
        Node::new(
            1,
            QuorumSliceSet::single(1, [1u32]),
            test_validity_fn(),
            test_combine_fn(),
            1,
            config,
        )
        .unwrap()
    }

    #[test]
    fn invalid_quorum_config_is_fatal_at_construction() {
        let result = Node::<String, u32>::new(
            1,
            QuorumSliceSet::default(),
            test_validity_fn(),
            test_combine_fn(),
            1,
            NodeConfig::default(),
        );
        assert!(matches!(result, Err(ScpError::QuorumSetConfig(_))));
    }

    #[test]
    fn solo_node_externalizes_immediately() {
        // A 1-of-1 quorum is its own quorum for everything: proposing walks
        // the whole pipeline to externalization in one call.
        let mut node = solo_node(NodeConfig::default());
        let out = node
            .propose_values(1, btreeset! {"X".to_string()})
            .unwrap();
        assert!(!out.is_empty());
        assert_eq!(node.externalized_value(1), Some("X".to_string()));
        assert_eq!(node.current_slot_index(), 2);
    }

    #[test]
    fn take_externalized_reports_exactly_once() {
        let mut node = solo_node(NodeConfig::default());
        node.propose_values(1, btreeset! {"X".to_string()}).unwrap();

        let drained = node.take_externalized();
        assert_eq!(drained, vec![(1, "X".to_string())]);
        assert!(node.take_externalized().is_empty());

        // The value itself stays queryable.
        assert_eq!(node.externalized_value(1), Some("X".to_string()));
    }

    #[test]
    fn stale_slot_below_retention_floor_is_rejected() {
        let mut node = solo_node(NodeConfig {
            retention_window: 2,
            ..NodeConfig::default()
        });

        // Externalize slot 5: the floor becomes 3.
        node.propose_values(5, btreeset! {"X".to_string()}).unwrap();
        assert_eq!(node.retention_floor(), Some(3));

        let msg = Msg::<String, u32>::new(
            2,
            QuorumSliceSet::single(1, [2u32]),
            2,
            crate::msg::Topic::Nominate(crate::msg::NominatePayload {
                X: btreeset! {"Y".to_string()},
                Y: BTreeSet::new(),
            }),
        );
        assert!(matches!(
            node.handle_message(&msg),
            Err(ScpError::StaleSlot {
                slot_index: 2,
                floor: 3
            })
        ));
    }

    #[test]
    fn message_beyond_future_horizon_is_rejected() {
        let mut node = solo_node(NodeConfig {
            future_horizon: 10,
            ..NodeConfig::default()
        });
        let msg = Msg::<String, u32>::new(
            2,
            QuorumSliceSet::single(1, [2u32]),
            100,
            crate::msg::Topic::Nominate(crate::msg::NominatePayload {
                X: btreeset! {"Y".to_string()},
                Y: BTreeSet::new(),
            }),
        );
        assert!(matches!(
            node.handle_message(&msg),
            Err(ScpError::SlotBeyondHorizon { slot_index: 100, .. })
        ));

        // Within the horizon the slot is created lazily.
        let mut near = msg.clone();
        near.slot_index = 5;
        assert!(node.handle_message(&near).is_ok());
    }

    #[test]
    fn externalized_slot_stays_terminal() {
        let mut node = solo_node(NodeConfig::default());
        node.propose_values(1, btreeset! {"X".to_string()}).unwrap();

        // Proposing a different value for the decided slot changes nothing.
        let out = node.propose_values(1, btreeset! {"Y".to_string()}).unwrap();
        assert!(out.is_empty());
        assert_eq!(node.externalized_value(1), Some("X".to_string()));
    }

    #[test]
    fn timeouts_are_a_no_op_without_due_timers() {
        let mut node = solo_node(NodeConfig::default());
        assert!(node.process_timeouts().is_empty());
    }

    #[test]
    fn mock_scp_node_is_available() {
        let mut mock = MockScpNode::<String, u32>::new();
        mock.expect_current_slot_index().return_const(7u64);
        assert_eq!(mock.current_slot_index(), 7);
    }
}
