// Copyright (c) 2018-2022 The Botho Foundation

//! Errors for signed consensus envelopes.

use displaydoc::Display;

/// Failures while signing or verifying a consensus envelope.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum ConsensusMsgError {
    /// The signature does not verify against the sender's public key
    InvalidSignature,

    /// The sender's public key is not a valid Ed25519 point
    InvalidPublicKey,

    /// Envelope serialization failed: {0}
    Serialization(String),
}

impl std::error::Error for ConsensusMsgError {}
