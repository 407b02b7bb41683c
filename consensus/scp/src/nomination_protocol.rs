// Copyright (c) 2018-2022 The Botho Foundation

//! The nomination protocol: federated voting that converges a growing
//! candidate-value set, with deterministic per-round leader weighting.

use crate::{
    error::{ScpError, ScpResult},
    msg::{Msg, NominatePayload, Topic},
    predicates::ValueSetPredicate,
    quorum_set_ext::QuorumSliceSetExt,
    slot::Slot,
};
use bth_consensus_scp_types::{GenericNodeId, QuorumSliceSet, SlotIndex, Value};
use primitive_types::U256;
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeSet,
    time::Instant,
};
use tracing::{debug, trace, warn};

// Statement merging and federated-voting promotion both converge in a handful
// of passes; the bound only guards against a logic bug looping forever.
const MAX_NOMINATION_ITERATIONS: usize = 8;

/// Per-slot nomination state.
pub struct NominationState<V: Value, ID: GenericNodeId> {
    /// Voted values.
    pub(crate) X: BTreeSet<V>,

    /// Accepted values.
    pub(crate) Y: BTreeSet<V>,

    /// Confirmed candidate values.
    pub(crate) Z: BTreeSet<V>,

    /// Values the application asked this node to nominate.
    pub(crate) W: BTreeSet<V>,

    /// Current nomination round.
    pub(crate) round: u32,

    /// Leaders accumulated across rounds; we echo their proposals.
    pub(crate) round_leaders: BTreeSet<ID>,

    pub(crate) nomination_started: bool,

    /// Composite of the confirmed candidates, fed to the ballot protocol.
    pub(crate) latest_composite: Option<V>,

    /// Last nominate payload we emitted, for idempotent re-emission.
    last_sent: Option<NominatePayload<V>>,

    /// Deadline for the next round advancement.
    pub(crate) next_timeout: Option<Instant>,
}

impl<V: Value, ID: GenericNodeId> Default for NominationState<V, ID> {
    fn default() -> Self {
        Self {
            X: BTreeSet::new(),
            Y: BTreeSet::new(),
            Z: BTreeSet::new(),
            W: BTreeSet::new(),
            round: 0,
            round_leaders: BTreeSet::new(),
            nomination_started: false,
            latest_composite: None,
            last_sent: None,
            next_timeout: None,
        }
    }
}

impl<V: Value, ID: GenericNodeId> NominationState<V, ID> {
    /// The confirmed candidates.
    pub fn candidates(&self) -> &BTreeSet<V> {
        &self.Z
    }

    /// The current round number.
    pub fn round(&self) -> u32 {
        self.round
    }
}

fn nominate_payload_of<V: Value, ID: GenericNodeId>(
    msg: &Msg<V, ID>,
) -> Option<&NominatePayload<V>> {
    match &msg.topic {
        Topic::Nominate(payload) => Some(payload),
        _ => None,
    }
}

impl<V: Value, ID: GenericNodeId> Slot<V, ID> {
    /// Seed nomination with application-proposed values.
    pub(crate) fn propose(&mut self, values: BTreeSet<V>) -> ScpResult<Vec<Msg<V, ID>>> {
        for value in &values {
            (self.validity_fn)(value).map_err(ScpError::InvalidValue)?;
        }
        self.nomination.W.extend(values);

        if !self.nomination.nomination_started {
            self.nomination.nomination_started = true;
            self.nomination.round = 1;
            self.update_round_leaders();
            self.nomination.next_timeout =
                Some(Instant::now() + self.config.nomination_timeout(1));
        }

        Ok(self.run_nomination())
    }

    /// Fold a peer's nominate statement (already recorded in the map).
    pub(crate) fn process_nominate_msg(
        &mut self,
        msg: &Msg<V, ID>,
    ) -> ScpResult<Vec<Msg<V, ID>>> {
        trace!(slot = self.index, sender = %msg.sender_id, "processing nominate statement");
        Ok(self.run_nomination())
    }

    /// Advance the nomination round after a timeout.
    pub(crate) fn advance_nomination_round(&mut self, now: Instant) -> Vec<Msg<V, ID>> {
        // The ballot protocol has taken over; nomination stops contributing.
        if self.ballot.B.is_some() {
            self.nomination.next_timeout = None;
            return Vec::new();
        }

        self.nomination.round = self.nomination.round.saturating_add(1);
        debug!(
            slot = self.index,
            round = self.nomination.round,
            "nomination round advanced"
        );
        self.update_round_leaders();
        self.nomination.next_timeout =
            Some(now + self.config.nomination_timeout(self.nomination.round));
        self.run_nomination()
    }

    /// Run voting, promotion, and emission to a fixpoint.
    fn run_nomination(&mut self) -> Vec<Msg<V, ID>> {
        let mut outbound = Vec::new();
        for _ in 0..MAX_NOMINATION_ITERATIONS {
            let mut changed = self.update_own_votes();
            changed |= self.update_nomination_state();
            let emitted = self.emit_nominate();
            let emitted_any = !emitted.is_empty();
            outbound.extend(emitted);
            if !changed && !emitted_any {
                break;
            }
        }
        outbound.extend(self.maybe_start_balloting());
        outbound
    }

    /// Seed our voted set: our own proposals when we lead the round, the
    /// leaders' proposals otherwise.
    fn update_own_votes(&mut self) -> bool {
        if !self.nomination.nomination_started || self.ballot.B.is_some() {
            return false;
        }

        let mut additions: BTreeSet<V> = BTreeSet::new();
        if self.nomination.round_leaders.contains(&self.local_id) {
            additions.extend(self.nomination.W.iter().cloned());
        }
        for leader in &self.nomination.round_leaders {
            if let Some(payload) = self.M.get(leader).and_then(nominate_payload_of) {
                additions.extend(payload.voted_or_accepted());
            }
        }

        let mut changed = false;
        for value in additions {
            if self.nomination.X.contains(&value) || self.nomination.Y.contains(&value) {
                continue;
            }
            if let Err(reason) = (self.validity_fn)(&value) {
                warn!(slot = self.index, %reason, "discarding invalid nominated value");
                continue;
            }
            self.nomination.X.insert(value);
            changed = true;
        }
        changed
    }

    /// Re-evaluate federated voting: promote voted values to accepted and
    /// accepted values to confirmed candidates.
    fn update_nomination_state(&mut self) -> bool {
        let mut changed = false;

        // Values any peer has voted or accepted, not yet accepted by us.
        let mut candidates: BTreeSet<V> = BTreeSet::new();
        for msg in self.M.values() {
            if let Some(payload) = nominate_payload_of(msg) {
                candidates.extend(payload.voted_or_accepted());
            }
        }
        candidates.extend(self.nomination.X.iter().cloned());
        candidates.retain(|value| !self.nomination.Y.contains(value));

        let intersect_accepted = |msg: &Msg<V, ID>, values: &BTreeSet<V>| -> BTreeSet<V> {
            match nominate_payload_of(msg) {
                Some(payload) => values.intersection(&payload.Y).cloned().collect(),
                None => BTreeSet::new(),
            }
        };
        let intersect_voted_or_accepted =
            |msg: &Msg<V, ID>, values: &BTreeSet<V>| -> BTreeSet<V> {
                match nominate_payload_of(msg) {
                    Some(payload) => {
                        let supported = payload.voted_or_accepted();
                        values.intersection(&supported).cloned().collect()
                    }
                    None => BTreeSet::new(),
                }
            };

        if !candidates.is_empty() {
            let mut newly_accepted: BTreeSet<V> = BTreeSet::new();

            // Accepted when a v-blocking set has accepted...
            let (blocking, pred) = self.quorum_slices.find_blocking_set(
                &self.M,
                ValueSetPredicate {
                    values: candidates.clone(),
                    test_fn: &intersect_accepted,
                },
            );
            if !blocking.is_empty() {
                newly_accepted.extend(pred.values);
            }

            // ...or when a quorum has voted-or-accepted.
            let remaining: BTreeSet<V> = candidates
                .difference(&newly_accepted)
                .cloned()
                .collect();
            if !remaining.is_empty() {
                let (quorum, pred) = self.quorum_slices.find_quorum(
                    &self.local_id,
                    &self.M,
                    ValueSetPredicate {
                        values: remaining,
                        test_fn: &intersect_voted_or_accepted,
                    },
                );
                if !quorum.is_empty() {
                    newly_accepted.extend(pred.values);
                }
            }

            for value in newly_accepted {
                if let Err(reason) = (self.validity_fn)(&value) {
                    warn!(slot = self.index, %reason, "discarding invalid accepted value");
                    continue;
                }
                changed |= self.nomination.Y.insert(value);
            }
        }

        // Accepted values become candidates once a quorum accepts them.
        let confirmable: BTreeSet<V> = self
            .nomination
            .Y
            .difference(&self.nomination.Z)
            .cloned()
            .collect();
        if !confirmable.is_empty() {
            let (quorum, pred) = self.quorum_slices.find_quorum(
                &self.local_id,
                &self.M,
                ValueSetPredicate {
                    values: confirmable,
                    test_fn: &intersect_accepted,
                },
            );
            if !quorum.is_empty() {
                for value in pred.values {
                    changed |= self.nomination.Z.insert(value);
                }
            }
        }

        if changed && !self.nomination.Z.is_empty() {
            match (self.combine_fn)(&self.nomination.Z) {
                Ok(composite) => {
                    debug!(
                        slot = self.index,
                        candidates = self.nomination.Z.len(),
                        "combined candidate set"
                    );
                    self.nomination.latest_composite = Some(composite);
                }
                Err(reason) => {
                    warn!(slot = self.index, %reason, "combine callback failed");
                }
            }
        }

        changed
    }

    /// Emit an updated nominate statement when our position changed.
    fn emit_nominate(&mut self) -> Vec<Msg<V, ID>> {
        if self.nomination.X.is_empty() && self.nomination.Y.is_empty() {
            return Vec::new();
        }
        let payload = NominatePayload {
            X: self.nomination.X.clone(),
            Y: self.nomination.Y.clone(),
        };
        if self.nomination.last_sent.as_ref() == Some(&payload) {
            return Vec::new();
        }
        self.nomination.last_sent = Some(payload.clone());

        let msg = Msg::new(
            self.local_id.clone(),
            self.quorum_slices.clone(),
            self.index,
            Topic::Nominate(payload),
        );
        self.record_own_msg(&msg);
        vec![msg]
    }

    /// Kick the ballot protocol once the first candidates are confirmed.
    fn maybe_start_balloting(&mut self) -> Vec<Msg<V, ID>> {
        if self.ballot.B.is_some() || self.nomination.Z.is_empty() {
            return Vec::new();
        }
        let composite = match &self.nomination.latest_composite {
            Some(value) => value.clone(),
            None => return Vec::new(),
        };
        debug!(slot = self.index, "candidates confirmed, starting ballot protocol");
        self.bump_ballot_state(composite, 1)
    }

    /// Recompute the leader set for the current round.
    ///
    /// Weighting is deterministic across nodes: everyone hashing the same
    /// (slot, round, node) triple agrees on who leads, so followers can echo
    /// the leader's proposals without coordination.
    fn update_round_leaders(&mut self) {
        let mut nodes = self.quorum_slices.nodes();
        nodes.insert(self.local_id.clone());

        let round = self.nomination.round;
        let mut best: Option<(U256, ID)> = None;
        let mut fallback: Option<(U256, ID)> = None;
        for node in nodes {
            let priority = leader_hash(self.index, round, HashTag::Priority, &node);
            if fallback.as_ref().is_none_or(|(p, _)| priority > *p) {
                fallback = Some((priority, node.clone()));
            }
            let weight = node_weight(&self.quorum_slices, &node);
            if leader_hash(self.index, round, HashTag::Neighbor, &node) >= weight {
                continue;
            }
            if best.as_ref().is_none_or(|(p, _)| priority > *p) {
                best = Some((priority, node));
            }
        }

        // When nobody clears the weight filter this round, the highest
        // priority overall leads; every node computes the same fallback, so
        // the leader stays consistent across the network.
        let leader = match best.or(fallback) {
            Some((_, node)) => node,
            None => self.local_id.clone(),
        };
        debug!(slot = self.index, round, leader = %leader, "round leader");
        self.nomination.round_leaders.insert(leader);
    }
}

#[derive(Clone, Copy)]
enum HashTag {
    Neighbor,
    Priority,
}

/// A node's nomination weight: the best threshold/size fraction over the
/// slices that contain it, as a fraction of 2^256.
fn node_weight<ID: GenericNodeId>(slices: &QuorumSliceSet<ID>, node: &ID) -> U256 {
    let mut weight = U256::zero();
    for slice in &slices.slices {
        if !slice.members.contains(node) {
            continue;
        }
        let slice_weight =
            U256::MAX / U256::from(slice.members.len() as u64) * U256::from(slice.threshold);
        if slice_weight > weight {
            weight = slice_weight;
        }
    }
    weight
}

/// Deterministic, bit-reproducible hash of (slot, round, node) used for
/// leader selection. The byte layout is fixed: domain string, tag byte,
/// big-endian slot index, big-endian round, then the serialized node id.
fn leader_hash<ID: GenericNodeId>(
    slot_index: SlotIndex,
    round: u32,
    tag: HashTag,
    node: &ID,
) -> U256 {
    let mut hasher = Sha256::new();
    hasher.update(b"scp-nomination-leader");
    hasher.update([match tag {
        HashTag::Neighbor => 1u8,
        HashTag::Priority => 2u8,
    }]);
    hasher.update(slot_index.to_be_bytes());
    hasher.update(round.to_be_bytes());
    match bincode::serialize(node) {
        Ok(bytes) => hasher.update(&bytes),
        Err(err) => {
            warn!(%err, "node id did not serialize for leader hashing");
        }
    }
    U256::from_big_endian(&hasher.finalize())
}
