// Copyright (c) 2018-2022 The Botho Foundation

//! Core types shared by every layer of the consensus stack.

use core::{fmt::Debug, hash::Hash};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;

/// The index of a consensus round. Each slot agrees on exactly one value.
pub type SlotIndex = u64;

/// A value on which consensus is run.
///
/// The core treats values as opaque, atomic tokens: it only compares, hashes,
/// and forwards them. Application-level semantics (what the value means, and
/// whether it is well formed) are supplied by the application through the
/// validity callback.
pub trait Value:
    Clone + Debug + Eq + Hash + Ord + PartialEq + PartialOrd + Serialize + DeserializeOwned + Send + 'static
{
}

impl<T> Value for T where
    T: Clone
        + Debug
        + Eq
        + Hash
        + Ord
        + PartialEq
        + PartialOrd
        + Serialize
        + DeserializeOwned
        + Send
        + 'static
{
}

/// An identifier of a consensus participant.
///
/// The core is generic over the identifier type; production code uses
/// [`crate::NodeID`], tests frequently use small integers.
pub trait GenericNodeId:
    Clone
    + Debug
    + Display
    + Eq
    + Hash
    + Ord
    + PartialEq
    + PartialOrd
    + Serialize
    + DeserializeOwned
    + Send
    + 'static
{
}

impl<T> GenericNodeId for T where
    T: Clone
        + Debug
        + Display
        + Eq
        + Hash
        + Ord
        + PartialEq
        + PartialOrd
        + Serialize
        + DeserializeOwned
        + Send
        + 'static
{
}
