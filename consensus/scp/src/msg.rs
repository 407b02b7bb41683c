// Copyright (c) 2018-2022 The Botho Foundation

//! Consensus statements and the message wrapper the core consumes.
//!
//! A [`Msg`] is the payload of a validated envelope: the sender's identity,
//! the slot it belongs to, the sender's quorum-slice configuration, and one of
//! the four statement kinds. Authenticity is established before a `Msg`
//! reaches the core; the core trusts the (sender, statement) pairing but not
//! the statement's claims about other nodes.

use crate::{
    ballot::Ballot,
    error::{ScpError, ScpResult},
};
use bth_consensus_scp_types::{GenericNodeId, NodeID, QuorumSliceSet, SlotIndex, Value};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeSet, fmt};

/// Nominate statement: the sender's federated-voting position on candidate
/// values.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(bound(deserialize = "V: Value"))]
pub struct NominatePayload<V: Value> {
    /// Voted values.
    pub X: BTreeSet<V>,

    /// Accepted values.
    pub Y: BTreeSet<V>,
}

impl<V: Value> NominatePayload<V> {
    /// Union of voted and accepted values.
    pub fn voted_or_accepted(&self) -> BTreeSet<V> {
        self.X.union(&self.Y).cloned().collect()
    }

    // Nominate statements form a partial order: a statement is newer when its
    // votes and accepted sets have both grown (or stayed equal, one growing).
    fn grew_from(&self, old: &Self) -> bool {
        old.X.is_subset(&self.X)
            && old.Y.is_subset(&self.Y)
            && (old.X.len() < self.X.len() || old.Y.len() < self.Y.len())
    }
}

/// Prepare statement: the sender is voting to prepare its current ballot and
/// reports the highest ballot(s) it has accepted prepared.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(bound(deserialize = "V: Value"))]
pub struct PreparePayload<V: Value> {
    /// Current ballot.
    pub B: Ballot<V>,

    /// Highest accepted prepared ballot, if any.
    pub P: Option<Ballot<V>>,

    /// Highest accepted prepared ballot incompatible with `P`, if any.
    pub PP: Option<Ballot<V>>,

    /// Lowest ballot counter for which the sender votes commit, 0 if none.
    pub CN: u32,

    /// Highest ballot counter for which the sender votes commit, 0 if none.
    pub HN: u32,
}

/// Commit statement: the sender has accepted commit over a counter range and
/// reports its confirmed-prepared bounds. (This is the "confirm" step of the
/// ballot protocol.)
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(bound(deserialize = "V: Value"))]
pub struct CommitPayload<V: Value> {
    /// Current ballot.
    pub B: Ballot<V>,

    /// Counter of the highest accepted prepared ballot.
    pub PN: u32,

    /// Lowest counter of the accepted committed range.
    pub CN: u32,

    /// Highest counter of the accepted committed range.
    pub HN: u32,
}

/// Externalize statement: the sender has confirmed commit; the slot value is
/// irrevocably decided.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(bound(deserialize = "V: Value"))]
pub struct ExternalizePayload<V: Value> {
    /// The lowest confirmed committed ballot.
    pub C: Ballot<V>,

    /// Highest counter of the confirmed committed range.
    pub HN: u32,
}

/// The statement kinds, as a closed sum type dispatched exhaustively.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(bound(deserialize = "V: Value"))]
pub enum Topic<V: Value> {
    /// Nomination, converging the candidate value set.
    Nominate(NominatePayload<V>),

    /// Ballot protocol: voting to prepare.
    Prepare(PreparePayload<V>),

    /// Ballot protocol: commit accepted over a counter range.
    Commit(CommitPayload<V>),

    /// Ballot protocol: commit confirmed, value decided.
    Externalize(ExternalizePayload<V>),
}

impl<V: Value> Topic<V> {
    // Ballot-phase statements are ordered Prepare < Commit < Externalize;
    // Nominate sits below all of them for supersession purposes.
    fn phase_rank(&self) -> u8 {
        match self {
            Topic::Nominate(_) => 0,
            Topic::Prepare(_) => 1,
            Topic::Commit(_) => 2,
            Topic::Externalize(_) => 3,
        }
    }
}

/// A consensus message: one statement from one sender about one slot.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(bound(deserialize = "V: Value, ID: GenericNodeId"))]
pub struct Msg<V: Value, ID: GenericNodeId = NodeID> {
    /// The sender of this message.
    pub sender_id: ID,

    /// The slot this message is about.
    pub slot_index: SlotIndex,

    /// The sender's quorum-slice configuration, carried so receivers can walk
    /// the transitive quorum closure.
    pub quorum_slices: QuorumSliceSet<ID>,

    /// The statement.
    pub topic: Topic<V>,
}

impl<V: Value, ID: GenericNodeId> Msg<V, ID> {
    /// Create a new message.
    pub fn new(
        sender_id: ID,
        quorum_slices: QuorumSliceSet<ID>,
        slot_index: SlotIndex,
        topic: Topic<V>,
    ) -> Self {
        Self {
            sender_id,
            slot_index,
            quorum_slices,
            topic,
        }
    }

    /// The ballot counter this statement sits at, used when deciding whether
    /// peers are ahead of us. Externalize pins the counter at infinity.
    pub fn ballot_counter(&self) -> Option<u32> {
        match &self.topic {
            Topic::Nominate(_) => None,
            Topic::Prepare(payload) => Some(payload.B.N),
            Topic::Commit(payload) => Some(payload.B.N),
            Topic::Externalize(_) => Some(u32::MAX),
        }
    }

    /// All values referenced by this statement.
    pub fn values(&self) -> BTreeSet<V> {
        match &self.topic {
            Topic::Nominate(payload) => payload.voted_or_accepted(),
            Topic::Prepare(payload) => {
                let mut values = BTreeSet::new();
                values.insert(payload.B.X.clone());
                if let Some(p) = &payload.P {
                    values.insert(p.X.clone());
                }
                if let Some(pp) = &payload.PP {
                    values.insert(pp.X.clone());
                }
                values
            }
            Topic::Commit(payload) => BTreeSet::from([payload.B.X.clone()]),
            Topic::Externalize(payload) => BTreeSet::from([payload.C.X.clone()]),
        }
    }

    /// Structural sanity of the statement. A message failing this check is a
    /// protocol violation by its sender and must be dropped.
    pub fn validate(&self) -> ScpResult<()> {
        if !self.quorum_slices.is_valid() {
            return Err(ScpError::MalformedStatement(format!(
                "invalid quorum slices {}",
                self.quorum_slices
            )));
        }

        match &self.topic {
            Topic::Nominate(payload) => {
                if payload.X.is_empty() && payload.Y.is_empty() {
                    return Err(ScpError::MalformedStatement(
                        "nominate with no votes and no accepted values".into(),
                    ));
                }
            }
            Topic::Prepare(payload) => {
                if payload.B.N < 1 {
                    return Err(ScpError::MalformedStatement("prepare with zero ballot".into()));
                }
                if let (Some(p), Some(pp)) = (&payload.P, &payload.PP) {
                    if !pp.less_and_incompatible(p) || pp == p {
                        return Err(ScpError::MalformedStatement(
                            "prepared-prime must be lower than and incompatible with prepared"
                                .into(),
                        ));
                    }
                }
                if payload.PP.is_some() && payload.P.is_none() {
                    return Err(ScpError::MalformedStatement(
                        "prepared-prime without prepared".into(),
                    ));
                }
                if payload.HN != 0 {
                    let p_counter = payload.P.as_ref().map(|p| p.N).unwrap_or(0);
                    if payload.HN > p_counter || payload.HN > payload.B.N {
                        return Err(ScpError::MalformedStatement(
                            "commit-vote high above prepared or current ballot".into(),
                        ));
                    }
                }
                if payload.CN != 0 && (payload.HN == 0 || payload.CN > payload.HN) {
                    return Err(ScpError::MalformedStatement(
                        "commit-vote range is inverted".into(),
                    ));
                }
            }
            Topic::Commit(payload) => {
                if payload.B.N < 1 {
                    return Err(ScpError::MalformedStatement("commit with zero ballot".into()));
                }
                if payload.CN < 1 || payload.CN > payload.HN || payload.HN > payload.B.N {
                    return Err(ScpError::MalformedStatement(
                        "committed counter range is inverted".into(),
                    ));
                }
            }
            Topic::Externalize(payload) => {
                if payload.C.N < 1 || payload.HN < payload.C.N {
                    return Err(ScpError::MalformedStatement(
                        "externalized counter range is inverted".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Per-sender supersession: true when `self` is strictly newer than `old`
    /// and should replace it in the latest-message map. Equal or older
    /// statements are ignored by the receiving slot (per-peer monotonicity).
    pub fn supersedes(&self, old: &Self) -> bool {
        let (new_rank, old_rank) = (self.topic.phase_rank(), old.topic.phase_rank());
        match new_rank.cmp(&old_rank) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (&self.topic, &old.topic) {
                (Topic::Nominate(new), Topic::Nominate(old)) => new.grew_from(old),
                (Topic::Prepare(new), Topic::Prepare(old)) => {
                    (&new.B, &new.P, &new.PP, new.HN) > (&old.B, &old.P, &old.PP, old.HN)
                }
                (Topic::Commit(new), Topic::Commit(old)) => {
                    (&new.B, new.PN, new.HN) > (&old.B, old.PN, old.HN)
                }
                // A second externalize can never say anything new.
                (Topic::Externalize(_), Topic::Externalize(_)) => false,
                _ => false,
            },
        }
    }
}

impl<V: Value, ID: GenericNodeId> fmt::Display for Msg<V, ID> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(V={} I={} ", self.sender_id, self.slot_index)?;
        match &self.topic {
            Topic::Nominate(payload) => {
                write!(f, "NOM X.len={} Y.len={}", payload.X.len(), payload.Y.len())?
            }
            Topic::Prepare(payload) => {
                write!(f, "PREP B={}", payload.B)?;
                if let Some(p) = &payload.P {
                    write!(f, " P={p}")?;
                }
                if let Some(pp) = &payload.PP {
                    write!(f, " PP={pp}")?;
                }
                write!(f, " CN={} HN={}", payload.CN, payload.HN)?;
            }
            Topic::Commit(payload) => write!(
                f,
                "COMMIT B={} PN={} CN={} HN={}",
                payload.B, payload.PN, payload.CN, payload.HN
            )?,
            Topic::Externalize(payload) => {
                write!(f, "EXT C={} HN={}", payload.C, payload.HN)?
            }
        }
        write!(f, ")")
    }
}
