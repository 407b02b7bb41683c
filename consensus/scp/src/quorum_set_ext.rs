// Copyright (c) 2018-2022 The Botho Foundation

//! Quorum evaluation over quorum-slice configurations.
//!
//! These are the two primitives every "accepted"/"confirmed" transition in
//! both sub-protocols is built from. Both are pure: they read a snapshot of
//! the latest message per node and mutate nothing.

use crate::{msg::Msg, predicates::Predicate};
use bth_consensus_scp_types::{GenericNodeId, QuorumSliceSet, Value};
use std::collections::{BTreeMap, HashSet};

/// Quorum evaluation methods on a node's quorum-slice configuration.
pub trait QuorumSliceSetExt<ID: GenericNodeId> {
    /// Find a v-blocking set of message senders satisfying `pred`.
    ///
    /// A set is v-blocking when it intersects every slice beyond avoidance:
    /// no slice can reach its threshold without one of the set's members.
    /// Returns the blocking senders and the narrowed predicate, or an empty
    /// set (and the original predicate) if none exists.
    fn find_blocking_set<V: Value, P: Predicate<V, ID>>(
        &self,
        msgs: &BTreeMap<ID, Msg<V, ID>>,
        pred: P,
    ) -> (HashSet<ID>, P);

    /// Find a quorum, containing `node_id`, of senders satisfying `pred`.
    ///
    /// Seeds with every sender whose latest message satisfies the predicate,
    /// then prunes to the transitive-closure fixpoint: a member survives only
    /// while one of its own slices (taken from its message) reaches threshold
    /// inside the set. The search succeeds when one of the local node's
    /// slices reaches threshold inside the fixpoint; the local node counts
    /// toward thresholds whenever its own latest message satisfies the
    /// predicate. Returns the quorum and the narrowed predicate, or an empty
    /// set (and the original predicate) if none exists.
    fn find_quorum<V: Value, P: Predicate<V, ID>>(
        &self,
        node_id: &ID,
        msgs: &BTreeMap<ID, Msg<V, ID>>,
        pred: P,
    ) -> (HashSet<ID>, P);
}

impl<ID: GenericNodeId> QuorumSliceSetExt<ID> for QuorumSliceSet<ID> {
    fn find_blocking_set<V: Value, P: Predicate<V, ID>>(
        &self,
        msgs: &BTreeMap<ID, Msg<V, ID>>,
        pred: P,
    ) -> (HashSet<ID>, P) {
        if self.slices.is_empty() {
            return (HashSet::new(), pred);
        }

        let mut narrowed = pred.clone();
        let mut blocking: HashSet<ID> = HashSet::new();

        for slice in &self.slices {
            let needed = slice.blocking_threshold();
            let mut found = slice
                .members
                .iter()
                .filter(|member| blocking.contains(*member))
                .count();

            for member in &slice.members {
                if found >= needed {
                    break;
                }
                if blocking.contains(member) {
                    continue;
                }
                if let Some(msg) = msgs.get(member) {
                    let (next, passed) = narrowed.test(msg);
                    if passed {
                        narrowed = next;
                        blocking.insert(member.clone());
                        found += 1;
                    }
                }
            }

            if found < needed {
                return (HashSet::new(), pred);
            }
        }

        (blocking, narrowed)
    }

    fn find_quorum<V: Value, P: Predicate<V, ID>>(
        &self,
        node_id: &ID,
        msgs: &BTreeMap<ID, Msg<V, ID>>,
        pred: P,
    ) -> (HashSet<ID>, P) {
        let mut narrowed = pred.clone();

        // Seed with every sender whose latest message passes.
        let mut candidates: HashSet<ID> = HashSet::new();
        for (sender_id, msg) in msgs {
            let (next, passed) = narrowed.test(msg);
            if passed {
                narrowed = next;
                candidates.insert(sender_id.clone());
            }
        }

        // Prune to the fixpoint: each member must have a slice of its own
        // that reaches threshold inside the candidate set.
        loop {
            let surviving: HashSet<ID> = candidates
                .iter()
                .filter(|member| {
                    let slices = if *member == node_id {
                        self
                    } else {
                        match msgs.get(*member) {
                            Some(msg) => &msg.quorum_slices,
                            None => return false,
                        }
                    };
                    slices.is_satisfied_by(&candidates)
                })
                .cloned()
                .collect();

            if surviving.len() == candidates.len() {
                break;
            }
            candidates = surviving;
        }

        // The fixpoint is a quorum for the local node when one of its own
        // slices reaches threshold inside it.
        if self.is_satisfied_by(&candidates) {
            candidates.insert(node_id.clone());
            (candidates, narrowed)
        } else {
            (HashSet::new(), pred)
        }
    }
}
