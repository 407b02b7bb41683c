// Copyright (c) 2018-2022 The Botho Foundation

//! Quorum-slice configuration.
//!
//! Each node declares the sets of peers it trusts: a [`QuorumSlice`] is a
//! member set with a threshold, and a [`QuorumSliceSet`] is the node's ordered
//! list of slices. A node's statement is quorum-satisfied as soon as any one
//! of its slices is satisfied.

use crate::core_types::GenericNodeId;
use crate::node_id::NodeID;
use core::fmt::{Display, Formatter, Result as FmtResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// A set of nodes with a threshold.
///
/// The slice is satisfied when at least `threshold` of its members (possibly
/// including the declaring node itself) have taken the action in question.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(bound(deserialize = "ID: GenericNodeId"))]
pub struct QuorumSlice<ID: GenericNodeId = NodeID> {
    /// Number of members that must act for the slice to be satisfied.
    pub threshold: u32,

    /// Member identities.
    pub members: BTreeSet<ID>,
}

impl<ID: GenericNodeId> QuorumSlice<ID> {
    /// Create a new slice from a threshold and a list of members.
    pub fn new(threshold: u32, members: impl IntoIterator<Item = ID>) -> Self {
        Self {
            threshold,
            members: members.into_iter().collect(),
        }
    }

    /// A slice is structurally valid when `1 <= threshold <= |members|`.
    pub fn is_valid(&self) -> bool {
        self.threshold >= 1 && (self.threshold as usize) <= self.members.len()
    }

    /// True if at least `threshold` members are in `acting`.
    pub fn is_satisfied_by(&self, acting: &HashSet<ID>) -> bool {
        let count = self.members.iter().filter(|m| acting.contains(m)).count();
        count >= self.threshold as usize
    }

    /// True if the slice could still reach its threshold using only members
    /// outside `blocked`, i.e. `blocked` does not block this slice.
    pub fn can_be_satisfied_avoiding(&self, blocked: &HashSet<ID>) -> bool {
        let available = self.members.iter().filter(|m| !blocked.contains(m)).count();
        available >= self.threshold as usize
    }

    /// How many members of this slice must act to make it unavoidable.
    pub fn blocking_threshold(&self) -> usize {
        self.members.len() - self.threshold as usize + 1
    }
}

impl<ID: GenericNodeId> Display for QuorumSlice<ID> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "[{}-of-{}]", self.threshold, self.members.len())
    }
}

/// A node's complete quorum configuration: an ordered list of slices.
///
/// Immutable for the lifetime of any slot that snapshotted it; changing a
/// node's slices requires restarting the affected slots.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(bound(deserialize = "ID: GenericNodeId"))]
pub struct QuorumSliceSet<ID: GenericNodeId = NodeID> {
    /// The slices. Any one being satisfied satisfies the node.
    pub slices: Vec<QuorumSlice<ID>>,
}

impl<ID: GenericNodeId> QuorumSliceSet<ID> {
    /// Create a new slice set.
    pub fn new(slices: Vec<QuorumSlice<ID>>) -> Self {
        Self { slices }
    }

    /// Convenience constructor for the common single-slice configuration.
    pub fn single(threshold: u32, members: impl IntoIterator<Item = ID>) -> Self {
        Self {
            slices: vec![QuorumSlice::new(threshold, members)],
        }
    }

    /// Structural validity: at least one slice, and every slice valid.
    ///
    /// An invalid configuration is a fatal per-slot error: no statement could
    /// ever be quorum-satisfied under it.
    pub fn is_valid(&self) -> bool {
        !self.slices.is_empty() && self.slices.iter().all(QuorumSlice::is_valid)
    }

    /// The union of all member identities across slices.
    pub fn nodes(&self) -> BTreeSet<ID> {
        self.slices
            .iter()
            .flat_map(|slice| slice.members.iter().cloned())
            .collect()
    }

    /// True if any slice is satisfied by `acting`.
    pub fn is_satisfied_by(&self, acting: &HashSet<ID>) -> bool {
        self.slices.iter().any(|slice| slice.is_satisfied_by(acting))
    }

    /// True if `blocked` intersects every slice beyond avoidance: no slice can
    /// reach its threshold without touching `blocked`.
    pub fn is_blocked_by(&self, blocked: &HashSet<ID>) -> bool {
        !self.slices.is_empty()
            && self
                .slices
                .iter()
                .all(|slice| !slice.can_be_satisfied_avoiding(blocked))
    }
}

impl<ID: GenericNodeId> Display for QuorumSliceSet<ID> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "(")?;
        for (i, slice) in self.slices.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{slice}")?;
        }
        write!(f, ")")
    }
}
