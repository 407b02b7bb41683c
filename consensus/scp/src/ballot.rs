// Copyright (c) 2018-2022 The Botho Foundation

//! The ballot contains the value on which to consense.

use bth_consensus_scp_types::Value;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

/// The ballot contains the value on which to consense.
///
/// The balloting protocol centers around successively higher ballots
/// which are moving through the phases of the federated voting.
///
/// Ballots are totally ordered, with "counter" more significant than "value."
/// A live ballot always has `N >= 1`; absence of a ballot is `Option::None`,
/// never a zero counter.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "V: Value"))]
pub struct Ballot<V: Value> {
    /// Counter.
    pub N: u32,

    /// Value.
    pub X: V,
}

impl<V: Value> Ballot<V> {
    /// Create a new Ballot with the given counter and value.
    pub fn new(counter: u32, value: V) -> Self {
        Ballot {
            N: counter,
            X: value,
        }
    }

    /// Two ballots are compatible when they carry the same value.
    pub fn compatible(&self, other: &Self) -> bool {
        self.X == other.X
    }

    /// `self <= other` with the same value.
    pub fn less_and_compatible(&self, other: &Self) -> bool {
        self <= other && self.compatible(other)
    }

    /// `self <= other` with a different value.
    pub fn less_and_incompatible(&self, other: &Self) -> bool {
        self <= other && !self.compatible(other)
    }
}

// Ballots are totally ordered with N more significant than X.
impl<V: Value> Ord for Ballot<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.N != other.N {
            return self.N.cmp(&other.N);
        }

        self.X.cmp(&other.X)
    }
}

impl<V: Value> PartialOrd for Ballot<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// This makes debugging easier when looking at ballots over large values.
impl<V: Value> fmt::Display for Ballot<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut hasher = DefaultHasher::new();
        self.X.hash(&mut hasher);
        write!(f, "<{}, {:x}>", self.N, hasher.finish())
    }
}
