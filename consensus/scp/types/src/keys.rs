// Copyright (c) 2018-2022 The Botho Foundation

//! Public-key material carried inside node identifiers.

use core::fmt::{Display, Formatter, Result as FmtResult};
use serde::{Deserialize, Serialize};

/// An Ed25519 public key, stored as its 32-byte compressed form.
///
/// Kept as raw bytes so identifiers stay `Ord + Hash` and serializable without
/// dragging curve arithmetic into the data-model crate; the gateway converts
/// to a verifying key when it actually checks signatures.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Ed25519Public(
    /// The compressed key bytes.
    pub [u8; 32],
);

impl Ed25519Public {
    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for Ed25519Public {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Ed25519Public {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Display for Ed25519Public {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        // Eight hex chars is enough to tell nodes apart in logs.
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

/// An Ed25519 signature, stored as its 64-byte form.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ed25519Signature(
    /// The signature bytes.
    pub [u8; 64],
);

impl Ed25519Signature {
    /// The raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl From<[u8; 64]> for Ed25519Signature {
    fn from(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Ed25519Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Ed25519Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self(bytes))
    }
}

impl Display for Ed25519Signature {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}
