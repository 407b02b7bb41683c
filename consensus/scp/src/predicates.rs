// Copyright (c) 2018-2022 The Botho Foundation

//! Predicates over consensus messages, used by quorum evaluation.
//!
//! A predicate may *narrow* itself as it accepts messages: testing a message
//! returns both the pass/fail verdict and a refined predicate that subsequent
//! messages are tested against. This lets a single quorum search answer
//! set-valued questions ("which of these values does a quorum accept?",
//! "over which counter interval does a quorum vote commit?") instead of one
//! search per candidate.

use crate::{ballot::Ballot, msg::Msg};
use bth_consensus_scp_types::{GenericNodeId, Value};
use std::collections::BTreeSet;

/// A predicate on messages, possibly narrowing as it accepts.
pub trait Predicate<V: Value, ID: GenericNodeId>: Clone {
    /// Test a message. Returns the (possibly narrowed) predicate to use for
    /// further messages, and whether this message passed.
    fn test(&self, msg: &Msg<V, ID>) -> (Self, bool);
}

/// A plain boolean predicate.
#[derive(Clone)]
pub struct FuncPredicate<'a, V: Value, ID: GenericNodeId> {
    /// The test function.
    pub func: &'a dyn Fn(&Msg<V, ID>) -> bool,
}

impl<V: Value, ID: GenericNodeId> Predicate<V, ID> for FuncPredicate<'_, V, ID> {
    fn test(&self, msg: &Msg<V, ID>) -> (Self, bool) {
        (self.clone(), (self.func)(msg))
    }
}

/// A predicate carrying a set of candidate values, narrowed to the subset each
/// accepted message supports.
#[derive(Clone)]
pub struct ValueSetPredicate<'a, V: Value, ID: GenericNodeId> {
    /// Candidate values still in play.
    pub values: BTreeSet<V>,

    /// Maps a message and the current candidates to the candidates the
    /// message supports.
    pub test_fn: &'a dyn Fn(&Msg<V, ID>, &BTreeSet<V>) -> BTreeSet<V>,
}

impl<V: Value, ID: GenericNodeId> Predicate<V, ID> for ValueSetPredicate<'_, V, ID> {
    fn test(&self, msg: &Msg<V, ID>) -> (Self, bool) {
        let intersection = (self.test_fn)(msg, &self.values);
        let passed = !intersection.is_empty();
        (
            Self {
                values: intersection,
                test_fn: self.test_fn,
            },
            passed,
        )
    }
}

/// Like [`ValueSetPredicate`], over candidate ballots.
#[derive(Clone)]
pub struct BallotSetPredicate<'a, V: Value, ID: GenericNodeId> {
    /// Candidate ballots still in play.
    pub ballots: BTreeSet<Ballot<V>>,

    /// Maps a message and the current candidates to the candidates the
    /// message supports.
    pub test_fn: &'a dyn Fn(&Msg<V, ID>, &BTreeSet<Ballot<V>>) -> BTreeSet<Ballot<V>>,
}

impl<V: Value, ID: GenericNodeId> Predicate<V, ID> for BallotSetPredicate<'_, V, ID> {
    fn test(&self, msg: &Msg<V, ID>) -> (Self, bool) {
        let intersection = (self.test_fn)(msg, &self.ballots);
        let passed = !intersection.is_empty();
        (
            Self {
                ballots: intersection,
                test_fn: self.test_fn,
            },
            passed,
        )
    }
}

/// A predicate carrying an inclusive ballot-counter interval, narrowed to the
/// intersection with each accepted message's interval.
///
/// Used for commit acceptance and confirmation, where the question is asked
/// about every counter in a range at once.
#[derive(Clone)]
pub struct BallotRangePredicate<'a, V: Value, ID: GenericNodeId> {
    /// The inclusive counter interval still in play.
    pub range: (u32, u32),

    /// Maps a message to the inclusive counter interval it supports, if any.
    pub interval_fn: &'a dyn Fn(&Msg<V, ID>) -> Option<(u32, u32)>,
}

impl<'a, V: Value, ID: GenericNodeId> BallotRangePredicate<'a, V, ID> {
    /// The narrowed interval.
    pub fn range(&self) -> (u32, u32) {
        self.range
    }
}

impl<V: Value, ID: GenericNodeId> Predicate<V, ID> for BallotRangePredicate<'_, V, ID> {
    fn test(&self, msg: &Msg<V, ID>) -> (Self, bool) {
        match (self.interval_fn)(msg) {
            Some((lo, hi)) => {
                let narrowed = (self.range.0.max(lo), self.range.1.min(hi));
                if narrowed.0 <= narrowed.1 {
                    (
                        Self {
                            range: narrowed,
                            interval_fn: self.interval_fn,
                        },
                        true,
                    )
                } else {
                    (self.clone(), false)
                }
            }
            None => (self.clone(), false),
        }
    }
}
