// Copyright (c) 2018-2022 The Botho Foundation

//! The ballot protocol: prepare, commit, externalize.
//!
//! Drives agreement on exactly one value per slot through successively higher
//! ballots. Transitions follow the federated-voting pattern of the nomination
//! protocol, with two primitives per step: accept via v-blocking set or
//! quorum, confirm via quorum only. Externalization requires a true quorum,
//! never merely a v-blocking set.

use crate::{
    ballot::Ballot,
    msg::{CommitPayload, ExternalizePayload, Msg, PreparePayload, Topic},
    predicates::{BallotRangePredicate, FuncPredicate},
    quorum_set_ext::QuorumSliceSetExt,
    slot::Slot,
};
use bth_consensus_scp_types::{GenericNodeId, Value};
use std::{collections::BTreeSet, time::Instant};
use tracing::{debug, info, trace};

// Transitions only move the state forward (counters and phases never
// regress), so advancement converges quickly; the bound guards against a
// logic bug looping forever.
const MAX_ADVANCE_ITERATIONS: usize = 16;

/// The phases of the ballot protocol. Externalize is terminal.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    /// Voting to prepare ballots; commit not yet accepted.
    Prepare,

    /// Commit accepted over a counter range; awaiting confirmation.
    Confirm,

    /// Commit confirmed; the slot value is decided forever.
    Externalize,
}

/// Per-slot ballot state.
pub struct BallotState<V: Value> {
    /// Current phase.
    pub(crate) phase: Phase,

    /// Current ballot.
    pub(crate) B: Option<Ballot<V>>,

    /// Highest accepted prepared ballot.
    pub(crate) P: Option<Ballot<V>>,

    /// Highest accepted prepared ballot incompatible with `P`.
    pub(crate) PP: Option<Ballot<V>>,

    /// Highest confirmed prepared ballot (Prepare phase), or the high end of
    /// the accepted committed range (Confirm/Externalize).
    pub(crate) H: Option<Ballot<V>>,

    /// Low end of the committed range being voted/accepted.
    pub(crate) C: Option<Ballot<V>>,

    /// Once a ballot is confirmed prepared or commit is accepted, later bumps
    /// must carry its value.
    pub(crate) value_override: Option<V>,

    /// Whether a quorum is participating at our current counter.
    pub(crate) heard_from_quorum: bool,

    /// Last ballot statement we emitted, for idempotent re-emission.
    last_sent: Option<Topic<V>>,

    /// Deadline for the next counter bump.
    pub(crate) next_timeout: Option<Instant>,
}

impl<V: Value> Default for BallotState<V> {
    fn default() -> Self {
        Self {
            phase: Phase::Prepare,
            B: None,
            P: None,
            PP: None,
            H: None,
            C: None,
            value_override: None,
            heard_from_quorum: false,
            last_sent: None,
            next_timeout: None,
        }
    }
}

impl<V: Value> BallotState<V> {
    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The current ballot.
    pub fn current_ballot(&self) -> Option<&Ballot<V>> {
        self.B.as_ref()
    }

    // The ballot value to use when bumping: pinned by confirmed-prepared or
    // accepted-commit state when present.
    fn bump_value(&self, fallback: V) -> V {
        self.value_override.clone().unwrap_or(fallback)
    }

    fn in_ballot_phases(&self) -> bool {
        matches!(self.phase, Phase::Prepare | Phase::Confirm)
    }

    fn check_invariants(&self) {
        if let Some(b) = &self.B {
            debug_assert!(b.N >= 1);
        }
        if self.phase != Phase::Prepare {
            debug_assert!(self.B.is_some());
            debug_assert!(self.P.is_some());
            debug_assert!(self.C.is_some());
            debug_assert!(self.H.is_some());
        }
        if let (Some(p), Some(pp)) = (&self.P, &self.PP) {
            debug_assert!(pp.less_and_incompatible(p));
        }
        if let (Some(c), Some(h)) = (&self.C, &self.H) {
            debug_assert!(c.less_and_compatible(h));
        }
    }
}

// What a peer's statement says about preparing ballot `b`.
fn statement_accepts_prepared<V: Value, ID: GenericNodeId>(
    msg: &Msg<V, ID>,
    b: &Ballot<V>,
) -> bool {
    match &msg.topic {
        Topic::Nominate(_) => false,
        Topic::Prepare(payload) => {
            payload
                .P
                .as_ref()
                .is_some_and(|p| b.less_and_compatible(p))
                || payload
                    .PP
                    .as_ref()
                    .is_some_and(|pp| b.less_and_compatible(pp))
        }
        Topic::Commit(payload) => {
            b.less_and_compatible(&Ballot::new(payload.PN, payload.B.X.clone()))
        }
        Topic::Externalize(payload) => b.compatible(&payload.C),
    }
}

fn statement_votes_prepare<V: Value, ID: GenericNodeId>(
    msg: &Msg<V, ID>,
    b: &Ballot<V>,
) -> bool {
    match &msg.topic {
        Topic::Nominate(_) => false,
        Topic::Prepare(payload) => b.less_and_compatible(&payload.B),
        Topic::Commit(payload) => b.compatible(&payload.B),
        Topic::Externalize(payload) => b.compatible(&payload.C),
    }
}

// The counter interval over which a statement ACCEPTS commit for value `w`.
fn accepts_commit_interval<V: Value, ID: GenericNodeId>(
    msg: &Msg<V, ID>,
    w: &V,
) -> Option<(u32, u32)> {
    match &msg.topic {
        Topic::Nominate(_) | Topic::Prepare(_) => None,
        Topic::Commit(payload) => (payload.B.X == *w).then_some((payload.CN, payload.HN)),
        Topic::Externalize(payload) => {
            (payload.C.X == *w).then_some((payload.C.N, u32::MAX))
        }
    }
}

// The counter interval over which a statement VOTES OR ACCEPTS commit for `w`.
fn votes_or_accepts_commit_interval<V: Value, ID: GenericNodeId>(
    msg: &Msg<V, ID>,
    w: &V,
) -> Option<(u32, u32)> {
    match &msg.topic {
        Topic::Nominate(_) => None,
        Topic::Prepare(payload) => {
            (payload.CN != 0 && payload.B.X == *w).then_some((payload.CN, payload.HN))
        }
        Topic::Commit(payload) => (payload.B.X == *w).then_some((payload.CN, u32::MAX)),
        Topic::Externalize(payload) => {
            (payload.C.X == *w).then_some((payload.C.N, u32::MAX))
        }
    }
}

impl<V: Value, ID: GenericNodeId> Slot<V, ID> {
    /// Fold a peer's ballot statement (already recorded in the map).
    pub(crate) fn process_ballot_msg(&mut self) -> Vec<Msg<V, ID>> {
        if self.ballot.phase == Phase::Externalize {
            return Vec::new();
        }
        let outbound = self.ballot_advance();
        self.check_heard_from_quorum();
        outbound
    }

    /// Bump to a new ballot at `counter`, carrying `value` (or the pinned
    /// override). Entry point for nomination hand-off and timeouts.
    pub(crate) fn bump_ballot_state(&mut self, value: V, counter: u32) -> Vec<Msg<V, ID>> {
        if !self.ballot.in_ballot_phases() {
            return Vec::new();
        }
        let target = Ballot::new(counter, self.ballot.bump_value(value));
        if !self.update_current_value(&target) {
            return Vec::new();
        }
        let outbound = self.ballot_advance();
        self.check_heard_from_quorum();
        outbound
    }

    /// A ballot timer fired: move one counter up.
    pub(crate) fn ballot_timeout_fired(&mut self) -> Vec<Msg<V, ID>> {
        let (value, counter) = match &self.ballot.B {
            Some(b) => (b.X.clone(), b.N.saturating_add(1)),
            None => return Vec::new(),
        };
        debug!(slot = self.index, counter, "ballot timeout, bumping counter");
        self.bump_ballot_state(value, counter)
    }

    // Run the transition steps to a fixpoint, emitting statements as the
    // state advances.
    fn ballot_advance(&mut self) -> Vec<Msg<V, ID>> {
        let mut outbound = Vec::new();
        for _ in 0..MAX_ADVANCE_ITERATIONS {
            let mut changed = false;
            if self.ballot.in_ballot_phases() {
                changed |= self.attempt_accept_prepared();
                changed |= self.attempt_confirm_prepared();
                changed |= self.attempt_accept_commit();
                changed |= self.attempt_confirm_commit();
                changed |= self.attempt_bump();
            }
            self.ballot.check_invariants();
            // Our own emitted statement lands in the map and can enable the
            // next transition, so emission keeps the loop going too.
            let emitted = self.emit_ballot_msg();
            let emitted_any = !emitted.is_empty();
            outbound.extend(emitted);
            if !changed && !emitted_any {
                break;
            }
        }
        outbound
    }

    // Candidate ballots for the prepare steps, drawn from every statement in
    // the map.
    fn prepare_candidate_ballots(&self) -> BTreeSet<Ballot<V>> {
        let mut candidates = BTreeSet::new();
        for msg in self.M.values() {
            match &msg.topic {
                Topic::Nominate(_) => {}
                Topic::Prepare(payload) => {
                    candidates.insert(payload.B.clone());
                    if let Some(p) = &payload.P {
                        candidates.insert(p.clone());
                    }
                    if let Some(pp) = &payload.PP {
                        candidates.insert(pp.clone());
                    }
                }
                Topic::Commit(payload) => {
                    candidates.insert(Ballot::new(payload.PN, payload.B.X.clone()));
                    candidates.insert(Ballot::new(u32::MAX, payload.B.X.clone()));
                }
                Topic::Externalize(payload) => {
                    candidates.insert(Ballot::new(u32::MAX, payload.C.X.clone()));
                }
            }
        }
        candidates
    }

    // Step 1/5: accept ballots as prepared.
    fn attempt_accept_prepared(&mut self) -> bool {
        if !self.ballot.in_ballot_phases() {
            return false;
        }

        let candidates = self.prepare_candidate_ballots();
        for b in candidates.iter().rev() {
            // In the Confirm phase the prepared ballot must stay compatible
            // with the committed value.
            if self.ballot.phase == Phase::Confirm {
                if let Some(c) = &self.ballot.C {
                    if !b.compatible(c) {
                        continue;
                    }
                }
            }

            // Skip candidates that can improve neither `P` nor `PP`.
            if let Some(p) = &self.ballot.P {
                if b.less_and_compatible(p) {
                    continue;
                }
                if *b < *p
                    && self
                        .ballot
                        .PP
                        .as_ref()
                        .is_some_and(|pp| b.less_and_compatible(pp))
                {
                    continue;
                }
            }

            if self.federated_accept_prepared(b) {
                return self.set_accept_prepared(b.clone());
            }
        }
        false
    }

    fn federated_accept_prepared(&self, b: &Ballot<V>) -> bool {
        let accepts = |msg: &Msg<V, ID>| statement_accepts_prepared(msg, b);
        let (blocking, _) = self
            .quorum_slices
            .find_blocking_set(&self.M, FuncPredicate { func: &accepts });
        if !blocking.is_empty() {
            return true;
        }

        let votes_or_accepts = |msg: &Msg<V, ID>| {
            statement_votes_prepare(msg, b) || statement_accepts_prepared(msg, b)
        };
        let (quorum, _) = self.quorum_slices.find_quorum(
            &self.local_id,
            &self.M,
            FuncPredicate {
                func: &votes_or_accepts,
            },
        );
        !quorum.is_empty()
    }

    // A quorum accepts `b` as prepared.
    fn federated_ratify_prepared(&self, b: &Ballot<V>) -> bool {
        let accepts = |msg: &Msg<V, ID>| statement_accepts_prepared(msg, b);
        let (quorum, _) = self
            .quorum_slices
            .find_quorum(&self.local_id, &self.M, FuncPredicate { func: &accepts });
        !quorum.is_empty()
    }

    fn set_accept_prepared(&mut self, b: Ballot<V>) -> bool {
        trace!(slot = self.index, ballot = %b, "accepted prepared");
        let mut did_work = self.set_prepared(b);

        // An accepted-prepared ballot above and incompatible with our commit
        // votes aborts them: preparing implies voting against lower
        // incompatible ballots.
        if self.ballot.C.is_some() {
            if let Some(h) = &self.ballot.H {
                let aborted_by_p = self
                    .ballot
                    .P
                    .as_ref()
                    .is_some_and(|p| h.less_and_incompatible(p));
                let aborted_by_pp = self
                    .ballot
                    .PP
                    .as_ref()
                    .is_some_and(|pp| h.less_and_incompatible(pp));
                if aborted_by_p || aborted_by_pp {
                    debug_assert!(self.ballot.phase == Phase::Prepare);
                    self.ballot.C = None;
                    did_work = true;
                }
            }
        }
        did_work
    }

    // Maintain `P` as the highest accepted prepared ballot and `PP` as the
    // highest one incompatible with `P`.
    fn set_prepared(&mut self, b: Ballot<V>) -> bool {
        match &self.ballot.P {
            None => {
                self.ballot.P = Some(b);
                true
            }
            Some(p) if *p < b => {
                if !p.compatible(&b) {
                    self.ballot.PP = Some(p.clone());
                }
                self.ballot.P = Some(b);
                true
            }
            Some(p) if *p > b && !p.compatible(&b) => {
                let improves_pp = match &self.ballot.PP {
                    Some(pp) => *pp < b,
                    None => true,
                };
                if improves_pp {
                    self.ballot.PP = Some(b);
                    true
                } else {
                    false
                }
            }
            Some(_) => false,
        }
    }

    // Steps 2+3+8: confirm ballots prepared, advancing `H` and `C`.
    fn attempt_confirm_prepared(&mut self) -> bool {
        if self.ballot.phase != Phase::Prepare || self.ballot.P.is_none() {
            return false;
        }

        let candidates = self.prepare_candidate_ballots();

        let mut new_h = None;
        for b in candidates.iter().rev() {
            if self.ballot.H.as_ref().is_some_and(|h| b <= h) {
                break;
            }
            if self.federated_ratify_prepared(b) {
                new_h = Some(b.clone());
                break;
            }
        }
        let new_h = match new_h {
            Some(h) => h,
            None => return false,
        };

        // Find the lowest ballot we can vote commit for: compatible with the
        // new high ballot, not already aborted by an incompatible prepared
        // ballot above it, and not below our current ballot.
        let mut new_c = None;
        if self.ballot.C.is_none() {
            let aborted = self
                .ballot
                .P
                .as_ref()
                .is_some_and(|p| new_h.less_and_incompatible(p))
                || self
                    .ballot
                    .PP
                    .as_ref()
                    .is_some_and(|pp| new_h.less_and_incompatible(pp));
            if !aborted {
                for b in candidates.iter() {
                    if *b > new_h {
                        break;
                    }
                    if !b.compatible(&new_h) {
                        continue;
                    }
                    if self.ballot.B.as_ref().is_some_and(|cur| b < cur) {
                        continue;
                    }
                    if self.federated_ratify_prepared(b) {
                        new_c = Some(b.clone());
                        break;
                    }
                }
            }
        }

        info!(slot = self.index, high = %new_h, "confirmed prepared");
        self.ballot.H = Some(new_h.clone());
        if let Some(c) = new_c {
            self.ballot.C = Some(c);
        }
        self.ballot.value_override = Some(new_h.X.clone());
        self.update_current_if_needed(&new_h);
        true
    }

    // Steps 4+6: accept commit over a counter range, moving to Confirm.
    fn attempt_accept_commit(&mut self) -> bool {
        if !self.ballot.in_ballot_phases() {
            return false;
        }

        // Candidate commit values seen in ballot statements.
        let mut values: BTreeSet<V> = BTreeSet::new();
        for msg in self.M.values() {
            match &msg.topic {
                Topic::Nominate(_) => {}
                Topic::Prepare(payload) => {
                    if payload.CN != 0 {
                        values.insert(payload.B.X.clone());
                    }
                }
                Topic::Commit(payload) => {
                    values.insert(payload.B.X.clone());
                }
                Topic::Externalize(payload) => {
                    values.insert(payload.C.X.clone());
                }
            }
        }
        // Once a high ballot is pinned, only its value can be committed.
        if let Some(h) = &self.ballot.H {
            let h_value = h.X.clone();
            values.retain(|w| *w == h_value);
        }

        for w in values {
            let accepts = |msg: &Msg<V, ID>| accepts_commit_interval(msg, &w);
            let (blocking, pred) = self.quorum_slices.find_blocking_set(
                &self.M,
                BallotRangePredicate {
                    range: (1, u32::MAX),
                    interval_fn: &accepts,
                },
            );
            if !blocking.is_empty() && self.set_accept_commit(&w, pred.range()) {
                return true;
            }

            let votes_or_accepts =
                |msg: &Msg<V, ID>| votes_or_accepts_commit_interval(msg, &w);
            let (quorum, pred) = self.quorum_slices.find_quorum(
                &self.local_id,
                &self.M,
                BallotRangePredicate {
                    range: (1, u32::MAX),
                    interval_fn: &votes_or_accepts,
                },
            );
            if !quorum.is_empty() && self.set_accept_commit(&w, pred.range()) {
                return true;
            }
        }
        false
    }

    fn set_accept_commit(&mut self, w: &V, (cn, hn): (u32, u32)) -> bool {
        // Only apply ranges that move the accepted-committed state forward.
        if self.ballot.phase == Phase::Confirm {
            let cur_h = self.ballot.H.as_ref().map(|h| h.N).unwrap_or(0);
            let cur_c = self.ballot.C.as_ref().map(|c| c.N).unwrap_or(0);
            let extends = hn > cur_h || (hn == cur_h && cn < cur_c);
            if !extends {
                return false;
            }
        }

        let c = Ballot::new(cn, w.clone());
        let h = Ballot::new(hn, w.clone());
        info!(slot = self.index, low = %c, high = %h, "accepted commit");

        self.ballot.C = Some(c);
        self.ballot.H = Some(h.clone());
        self.ballot.value_override = Some(w.clone());
        // Accepting commit presumes the high ballot prepared.
        self.set_prepared(h.clone());
        self.ballot.phase = Phase::Confirm;
        self.update_current_if_needed(&h);
        true
    }

    // Step 7: confirm commit by quorum and externalize.
    fn attempt_confirm_commit(&mut self) -> bool {
        if self.ballot.phase != Phase::Confirm {
            return false;
        }
        let w = match &self.ballot.C {
            Some(c) => c.X.clone(),
            None => return false,
        };

        let accepts = |msg: &Msg<V, ID>| accepts_commit_interval(msg, &w);
        let (quorum, pred) = self.quorum_slices.find_quorum(
            &self.local_id,
            &self.M,
            BallotRangePredicate {
                range: (1, u32::MAX),
                interval_fn: &accepts,
            },
        );
        if quorum.is_empty() {
            return false;
        }

        let (cn, hn) = pred.range();
        self.ballot.C = Some(Ballot::new(cn, w.clone()));
        self.ballot.H = Some(Ballot::new(hn, w.clone()));
        self.ballot.phase = Phase::Externalize;
        self.ballot.next_timeout = None;
        info!(slot = self.index, counter = cn, "confirmed commit, externalizing");
        true
    }

    // Step 9: when a v-blocking set sits at counters strictly above ours,
    // jump to the lowest counter that clears the blockade.
    fn attempt_bump(&mut self) -> bool {
        if !self.ballot.in_ballot_phases() {
            return false;
        }
        let local_n = match &self.ballot.B {
            Some(b) => b.N,
            None => return false,
        };

        let blocked_above = |n: u32| -> bool {
            let ahead = |msg: &Msg<V, ID>| msg.ballot_counter().is_some_and(|c| c > n);
            let (blocking, _) = self
                .quorum_slices
                .find_blocking_set(&self.M, FuncPredicate { func: &ahead });
            !blocking.is_empty()
        };

        if !blocked_above(local_n) {
            return false;
        }

        let counters: BTreeSet<u32> = self
            .M
            .values()
            .filter_map(|msg| msg.ballot_counter())
            .filter(|c| *c > local_n)
            .collect();
        for n in counters {
            if !blocked_above(n) {
                debug!(slot = self.index, counter = n, "jumping to unblocked counter");
                let value = self
                    .ballot
                    .bump_value(match &self.ballot.B {
                        Some(b) => b.X.clone(),
                        None => return false,
                    });
                return self.update_current_value(&Ballot::new(n, value));
            }
        }
        false
    }

    // Step 8 helper: our current ballot tracks the confirmed-prepared /
    // accepted-committed high ballot.
    fn update_current_if_needed(&mut self, h: &Ballot<V>) {
        let behind = match &self.ballot.B {
            Some(b) => b < h,
            None => true,
        };
        if behind {
            self.update_current_value(h);
        }
    }

    // Adopt a new current ballot, enforcing the invariants: never decrease,
    // never contradict the committed value.
    fn update_current_value(&mut self, target: &Ballot<V>) -> bool {
        if !self.ballot.in_ballot_phases() {
            return false;
        }
        if let Some(c) = &self.ballot.C {
            if !c.compatible(target) {
                return false;
            }
        }
        match &self.ballot.B {
            None => {}
            Some(b) if *b < *target => {}
            Some(_) => return false,
        }

        let counter_changed = self
            .ballot
            .B
            .as_ref()
            .map(|b| b.N != target.N)
            .unwrap_or(true);
        self.ballot.B = Some(target.clone());
        if counter_changed {
            self.ballot.heard_from_quorum = false;
            self.ballot.next_timeout = None;
        }
        trace!(slot = self.index, ballot = %target, "current ballot updated");
        true
    }

    // Emit the statement for the current phase, once per distinct state.
    fn emit_ballot_msg(&mut self) -> Vec<Msg<V, ID>> {
        let topic = match self.ballot.phase {
            Phase::Prepare => {
                let b = match &self.ballot.B {
                    Some(b) => b.clone(),
                    None => return Vec::new(),
                };
                Topic::Prepare(PreparePayload {
                    B: b,
                    P: self.ballot.P.clone(),
                    PP: self.ballot.PP.clone(),
                    CN: self.ballot.C.as_ref().map(|c| c.N).unwrap_or(0),
                    HN: self.ballot.H.as_ref().map(|h| h.N).unwrap_or(0),
                })
            }
            Phase::Confirm => {
                let (b, p, c, h) = match (
                    &self.ballot.B,
                    &self.ballot.P,
                    &self.ballot.C,
                    &self.ballot.H,
                ) {
                    (Some(b), Some(p), Some(c), Some(h)) => {
                        (b.clone(), p.clone(), c.clone(), h.clone())
                    }
                    _ => return Vec::new(),
                };
                Topic::Commit(CommitPayload {
                    B: b,
                    PN: p.N,
                    CN: c.N,
                    HN: h.N,
                })
            }
            Phase::Externalize => {
                let (c, h) = match (&self.ballot.C, &self.ballot.H) {
                    (Some(c), Some(h)) => (c.clone(), h.clone()),
                    _ => return Vec::new(),
                };
                Topic::Externalize(ExternalizePayload { C: c, HN: h.N })
            }
        };

        if self.ballot.last_sent.as_ref() == Some(&topic) {
            return Vec::new();
        }
        self.ballot.last_sent = Some(topic.clone());

        let msg = Msg::new(
            self.local_id.clone(),
            self.quorum_slices.clone(),
            self.index,
            topic,
        );
        debug_assert!(msg.validate().is_ok(), "emitted malformed statement {msg}");
        self.record_own_msg(&msg);
        vec![msg]
    }

    // Arm the bump timer once a quorum participates at our counter.
    fn check_heard_from_quorum(&mut self) {
        if !self.ballot.in_ballot_phases() {
            self.ballot.next_timeout = None;
            return;
        }
        let local_n = match &self.ballot.B {
            Some(b) => b.N,
            None => return,
        };

        let at_or_above = |msg: &Msg<V, ID>| msg.ballot_counter().is_some_and(|c| c >= local_n);
        let (quorum, _) = self.quorum_slices.find_quorum(
            &self.local_id,
            &self.M,
            FuncPredicate {
                func: &at_or_above,
            },
        );

        if quorum.is_empty() {
            self.ballot.heard_from_quorum = false;
            return;
        }
        if !self.ballot.heard_from_quorum {
            self.ballot.heard_from_quorum = true;
            self.ballot.next_timeout =
                Some(Instant::now() + self.config.ballot_timeout(local_n));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::NodeConfig,
        quorum_set::QuorumSliceSet,
        test_utils::{test_combine_fn, test_validity_fn},
    };

    fn mesh_slices() -> QuorumSliceSet<u32> {
        QuorumSliceSet::single(3, [1u32, 2, 3, 4])
    }

    fn new_slot(local: u32) -> Slot<String, u32> {
        Slot::new(
            3,
            local,
            mesh_slices(),
            test_validity_fn(),
            test_combine_fn(),
            NodeConfig::default(),
        )
    }

    fn prepare_msg(sender: u32, ballot: Ballot<String>) -> Msg<String, u32> {
        Msg::new(
            sender,
            mesh_slices(),
            3,
            Topic::Prepare(PreparePayload {
                B: ballot,
                P: None,
                PP: None,
                CN: 0,
                HN: 0,
            }),
        )
    }

    fn prepared_msg(
        sender: u32,
        ballot: Ballot<String>,
        prepared: Ballot<String>,
    ) -> Msg<String, u32> {
        Msg::new(
            sender,
            mesh_slices(),
            3,
            Topic::Prepare(PreparePayload {
                B: ballot,
                P: Some(prepared),
                PP: None,
                CN: 0,
                HN: 0,
            }),
        )
    }

    fn ballot_x(n: u32) -> Ballot<String> {
        Ballot::new(n, "X".to_string())
    }

    #[test]
    fn quorum_of_votes_accepts_prepared() {
        let mut slot = new_slot(1);
        let out = slot.bump_ballot_state("X".to_string(), 1);
        assert!(!out.is_empty());
        assert!(slot.ballot.P.is_none());

        slot.process_msg(&prepare_msg(2, ballot_x(1))).unwrap();
        assert!(slot.ballot.P.is_none());

        // Third vote completes the 3-of-4 quorum over "ballot >= (1, X)".
        slot.process_msg(&prepare_msg(3, ballot_x(1))).unwrap();
        assert_eq!(slot.ballot.P, Some(ballot_x(1)));
    }

    #[test]
    fn v_blocking_accepts_prepared_directly() {
        let mut slot = new_slot(1);
        slot.bump_ballot_state("X".to_string(), 1);

        // Two peers claiming (2, X) prepared are v-blocking for 3-of-4.
        slot.process_msg(&prepared_msg(2, ballot_x(2), ballot_x(2)))
            .unwrap();
        assert!(slot.ballot.P.is_none());
        slot.process_msg(&prepared_msg(3, ballot_x(2), ballot_x(2)))
            .unwrap();
        assert_eq!(slot.ballot.P, Some(ballot_x(2)));
    }

    #[test]
    fn incompatible_lower_prepared_lands_in_prepared_prime() {
        let mut slot = new_slot(1);
        slot.ballot.B = Some(ballot_x(3));
        assert!(slot.set_prepared(ballot_x(3)));

        let other = Ballot::new(2, "Y".to_string());
        assert!(slot.set_prepared(other.clone()));
        assert_eq!(slot.ballot.P, Some(ballot_x(3)));
        assert_eq!(slot.ballot.PP, Some(other));

        // A lower compatible ballot changes nothing.
        assert!(!slot.set_prepared(ballot_x(2)));
    }

    #[test]
    fn full_mesh_drives_to_externalize() {
        // Four slots, one per node, all voting "X"; deliver everything to
        // slot 1 and check it walks prepare -> commit -> externalize.
        let mut slot = new_slot(1);
        slot.bump_ballot_state("X".to_string(), 1);
        assert_eq!(slot.ballot.phase, Phase::Prepare);

        // Quorum votes (1, X): prepared accepted.
        slot.process_msg(&prepare_msg(2, ballot_x(1))).unwrap();
        slot.process_msg(&prepare_msg(3, ballot_x(1))).unwrap();
        assert_eq!(slot.ballot.P, Some(ballot_x(1)));

        // Quorum accepts prepared: confirmed prepared, commit votes go out.
        slot.process_msg(&prepared_msg(2, ballot_x(1), ballot_x(1)))
            .unwrap();
        slot.process_msg(&prepared_msg(3, ballot_x(1), ballot_x(1)))
            .unwrap();
        assert_eq!(slot.ballot.H, Some(ballot_x(1)));
        assert_eq!(slot.ballot.C, Some(ballot_x(1)));

        // Quorum votes commit [1,1]: accepted, phase moves to Confirm.
        let commit_vote = |sender: u32| {
            Msg::new(
                sender,
                mesh_slices(),
                3,
                Topic::Prepare(PreparePayload {
                    B: ballot_x(1),
                    P: Some(ballot_x(1)),
                    PP: None,
                    CN: 1,
                    HN: 1,
                }),
            )
        };
        slot.process_msg(&commit_vote(2)).unwrap();
        slot.process_msg(&commit_vote(3)).unwrap();
        assert_eq!(slot.ballot.phase, Phase::Confirm);

        // Quorum accepts commit [1,1]: confirmed, externalized.
        let commit_accept = |sender: u32| {
            Msg::new(
                sender,
                mesh_slices(),
                3,
                Topic::Commit(CommitPayload {
                    B: ballot_x(1),
                    PN: 1,
                    CN: 1,
                    HN: 1,
                }),
            )
        };
        slot.process_msg(&commit_accept(2)).unwrap();
        slot.process_msg(&commit_accept(3)).unwrap();
        assert_eq!(slot.ballot.phase, Phase::Externalize);
        assert_eq!(slot.externalized_value(), Some(&"X".to_string()));
    }

    #[test]
    fn externalized_slot_ignores_further_messages() {
        let mut slot = new_slot(1);
        slot.bump_ballot_state("X".to_string(), 1);
        for sender in [2u32, 3] {
            slot.process_msg(&prepare_msg(sender, ballot_x(1))).unwrap();
            slot.process_msg(&prepared_msg(sender, ballot_x(1), ballot_x(1)))
                .unwrap();
            slot.process_msg(&Msg::new(
                sender,
                mesh_slices(),
                3,
                Topic::Commit(CommitPayload {
                    B: ballot_x(1),
                    PN: 1,
                    CN: 1,
                    HN: 1,
                }),
            ))
            .unwrap();
        }
        assert_eq!(slot.ballot.phase, Phase::Externalize);
        let decided = slot.externalized_value().cloned();
        assert_eq!(decided, Some("X".to_string()));

        // A late conflicting statement must change nothing.
        let out = slot
            .process_msg(&prepare_msg(4, Ballot::new(9, "Y".to_string())))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(slot.externalized_value().cloned(), decided);
    }

    #[test]
    fn v_blocking_ahead_forces_counter_jump() {
        let mut slot = new_slot(1);
        slot.bump_ballot_state("X".to_string(), 1);

        slot.process_msg(&prepare_msg(2, ballot_x(5))).unwrap();
        assert_eq!(slot.ballot.B.as_ref().map(|b| b.N), Some(1));

        // Second node at counter 5 makes {2,3} v-blocking: jump to 5.
        slot.process_msg(&prepare_msg(3, ballot_x(5))).unwrap();
        assert_eq!(slot.ballot.B.as_ref().map(|b| b.N), Some(5));
    }

    #[test]
    fn local_counters_never_decrease() {
        let mut slot = new_slot(1);
        slot.bump_ballot_state("X".to_string(), 4);
        assert_eq!(slot.ballot.B.as_ref().map(|b| b.N), Some(4));

        let out = slot.bump_ballot_state("X".to_string(), 2);
        assert!(out.is_empty());
        assert_eq!(slot.ballot.B.as_ref().map(|b| b.N), Some(4));
    }

    #[test]
    fn timeout_bumps_by_one() {
        let mut slot = new_slot(1);
        slot.bump_ballot_state("X".to_string(), 1);
        let out = slot.ballot_timeout_fired();
        assert!(!out.is_empty());
        assert_eq!(slot.ballot.B.as_ref().map(|b| b.N), Some(2));
    }

    #[test]
    fn emitted_counters_are_monotonic() {
        let mut slot = new_slot(1);
        let mut emitted = Vec::new();
        emitted.extend(slot.bump_ballot_state("X".to_string(), 1));
        emitted.extend(slot.ballot_timeout_fired());
        emitted.extend(slot.ballot_timeout_fired());
        slot.process_msg(&prepare_msg(2, ballot_x(7))).unwrap();
        emitted.extend(slot.process_msg(&prepare_msg(3, ballot_x(7))).unwrap());

        let counters: Vec<u32> = emitted
            .iter()
            .filter_map(|msg| msg.ballot_counter())
            .collect();
        assert!(counters.windows(2).all(|w| w[0] <= w[1]));
    }
}
