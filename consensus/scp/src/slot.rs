// Copyright (c) 2018-2022 The Botho Foundation

//! A slot: one consensus round, owning the nomination and ballot state and the
//! per-node latest-statement map both protocols evaluate quorums over.

use crate::{
    ballot_protocol::{BallotState, Phase},
    error::{ScpError, ScpResult},
    msg::{Msg, Topic},
    node::NodeConfig,
    nomination_protocol::NominationState,
};
use bth_consensus_scp_types::{GenericNodeId, NodeID, QuorumSliceSet, SlotIndex, Value};
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tracing::{info, trace};

/// Application-supplied check that a peer-proposed value is well formed.
pub type ValidityFn<V> = Arc<dyn Fn(&V) -> Result<(), String> + Send + Sync>;

/// Application-supplied deterministic composition of the confirmed candidate
/// set into the single value the ballot protocol runs on.
pub type CombineFn<V> = Arc<dyn Fn(&std::collections::BTreeSet<V>) -> Result<V, String> + Send + Sync>;

/// One consensus round.
///
/// The slot owns all mutable state for its index and is only ever driven from
/// one thread: quorum evaluation reads a consistent snapshot of the
/// latest-message map, which no one else mutates.
pub struct Slot<V: Value, ID: GenericNodeId = NodeID> {
    /// The slot index.
    pub(crate) index: SlotIndex,

    /// The local node.
    pub(crate) local_id: ID,

    /// The local node's quorum slices, snapshotted at slot creation.
    pub(crate) quorum_slices: QuorumSliceSet<ID>,

    pub(crate) validity_fn: ValidityFn<V>,
    pub(crate) combine_fn: CombineFn<V>,
    pub(crate) config: NodeConfig,

    /// The latest statement from each node, ours included. Federated voting
    /// reasons about current positions, not history.
    pub(crate) M: BTreeMap<ID, Msg<V, ID>>,

    pub(crate) nomination: NominationState<V, ID>,
    pub(crate) ballot: BallotState<V>,

    /// The decided value. Set at most once, then immutable.
    externalized: Option<V>,

    /// Whether the decision has been reported upward yet.
    externalized_reported: bool,
}

impl<V: Value, ID: GenericNodeId> Slot<V, ID> {
    /// Create a slot.
    pub fn new(
        index: SlotIndex,
        local_id: ID,
        quorum_slices: QuorumSliceSet<ID>,
        validity_fn: ValidityFn<V>,
        combine_fn: CombineFn<V>,
        config: NodeConfig,
    ) -> Self {
        Self {
            index,
            local_id,
            quorum_slices,
            validity_fn,
            combine_fn,
            config,
            M: BTreeMap::new(),
            nomination: NominationState::default(),
            ballot: BallotState::default(),
            externalized: None,
            externalized_reported: false,
        }
    }

    /// The slot index.
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// The decided value, if the slot has externalized.
    pub fn externalized_value(&self) -> Option<&V> {
        self.externalized.as_ref()
    }

    /// One-shot accessor used by the engine to report the decision exactly
    /// once.
    pub(crate) fn take_externalized_event(&mut self) -> Option<V> {
        if self.externalized_reported {
            return None;
        }
        match &self.externalized {
            Some(value) => {
                self.externalized_reported = true;
                Some(value.clone())
            }
            None => None,
        }
    }

    /// The latest statement recorded for a node.
    pub fn latest_msg(&self, node_id: &ID) -> Option<&Msg<V, ID>> {
        self.M.get(node_id)
    }

    /// Fold one validated message into the slot state.
    ///
    /// Returns the statements this node emits in response, for broadcast.
    /// Superseded, duplicate, and post-externalization messages are
    /// acknowledged with no state change and no emission.
    pub fn process_msg(&mut self, msg: &Msg<V, ID>) -> ScpResult<Vec<Msg<V, ID>>> {
        if msg.slot_index != self.index {
            return Err(ScpError::WrongSlot {
                expected: self.index,
                got: msg.slot_index,
            });
        }
        msg.validate()?;

        if self.externalized.is_some() {
            trace!(slot = self.index, "message for externalized slot ignored");
            return Ok(Vec::new());
        }

        if let Some(existing) = self.M.get(&msg.sender_id) {
            if !msg.supersedes(existing) {
                trace!(slot = self.index, sender = %msg.sender_id, "stale or duplicate statement ignored");
                return Ok(Vec::new());
            }
        }
        self.M.insert(msg.sender_id.clone(), msg.clone());

        let outbound = match &msg.topic {
            Topic::Nominate(_) => self.process_nominate_msg(msg)?,
            Topic::Prepare(_) | Topic::Commit(_) | Topic::Externalize(_) => {
                self.process_ballot_msg()
            }
        };

        self.check_externalized();
        Ok(outbound)
    }

    /// Seed the slot with application-proposed values and start nominating.
    pub fn propose_values(&mut self, values: std::collections::BTreeSet<V>) -> ScpResult<Vec<Msg<V, ID>>> {
        if self.externalized.is_some() {
            return Ok(Vec::new());
        }
        let outbound = self.propose(values)?;
        self.check_externalized();
        Ok(outbound)
    }

    /// Fire any due timers: nomination round advancement and ballot counter
    /// bumps. Timeouts are externally driven ticks, never part of message
    /// processing.
    pub fn process_timeouts(&mut self, now: Instant) -> Vec<Msg<V, ID>> {
        if self.externalized.is_some() {
            return Vec::new();
        }

        let mut outbound = Vec::new();

        if self
            .nomination
            .next_timeout
            .is_some_and(|deadline| now >= deadline)
        {
            outbound.extend(self.advance_nomination_round(now));
        }

        if self
            .ballot
            .next_timeout
            .is_some_and(|deadline| now >= deadline)
        {
            self.ballot.next_timeout = None;
            outbound.extend(self.ballot_timeout_fired());
        }

        self.check_externalized();
        outbound
    }

    /// Record one of our own statements in the latest-message map. Our own
    /// statements are authoritative and always current.
    pub(crate) fn record_own_msg(&mut self, msg: &Msg<V, ID>) {
        self.M.insert(self.local_id.clone(), msg.clone());
    }

    fn check_externalized(&mut self) {
        if self.externalized.is_some() || self.ballot.phase != Phase::Externalize {
            return;
        }
        if let Some(commit) = &self.ballot.C {
            info!(slot = self.index, ballot = %commit, "slot externalized");
            self.externalized = Some(commit.X.clone());
        }
    }
}
