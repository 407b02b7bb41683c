// Copyright (c) 2018-2022 The Botho Foundation

//! The signed envelope exchanged between peers.

use crate::error::ConsensusMsgError;
use bth_consensus_scp::Msg;
use bth_consensus_scp_types::{Ed25519Signature, NodeID, Value};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A consensus statement plus the sender's signature over it.
///
/// The signature covers the SHA-256 digest of the serialized statement and is
/// verified against the public key inside the sender's node id, so a validated
/// envelope pins the (sender, statement) pairing. Verification fails closed:
/// any malformed key or signature rejects the envelope.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(bound(deserialize = "V: Value"))]
pub struct ConsensusMsg<V: Value> {
    /// The statement.
    pub scp_msg: Msg<V, NodeID>,

    /// Signature over the digest of `scp_msg`.
    pub signature: Ed25519Signature,
}

impl<V: Value> ConsensusMsg<V> {
    /// Sign a statement produced by the local node.
    pub fn from_scp_msg(
        scp_msg: Msg<V, NodeID>,
        signer: &SigningKey,
    ) -> Result<Self, ConsensusMsgError> {
        let digest = Self::digest_of(&scp_msg)?;
        let signature = signer.sign(&digest);
        Ok(Self {
            scp_msg,
            signature: Ed25519Signature(signature.to_bytes()),
        })
    }

    /// Verify the signature against the sender's public key.
    pub fn verify_signature(&self) -> Result<(), ConsensusMsgError> {
        let key = VerifyingKey::from_bytes(self.scp_msg.sender_id.public_key.as_bytes())
            .map_err(|_| ConsensusMsgError::InvalidPublicKey)?;
        let digest = Self::digest_of(&self.scp_msg)?;
        let signature = Signature::from_bytes(self.signature.as_bytes());
        key.verify(&digest, &signature)
            .map_err(|_| ConsensusMsgError::InvalidSignature)
    }

    /// The digest identifying this statement, also used for duplicate
    /// suppression.
    pub fn digest(&self) -> Result<[u8; 32], ConsensusMsgError> {
        Self::digest_of(&self.scp_msg)
    }

    fn digest_of(scp_msg: &Msg<V, NodeID>) -> Result<[u8; 32], ConsensusMsgError> {
        let bytes = bincode::serialize(scp_msg)
            .map_err(|err| ConsensusMsgError::Serialization(err.to_string()))?;
        Ok(Sha256::digest(&bytes).into())
    }
}

impl<V: Value> fmt::Display for ConsensusMsg<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} sig={}", self.scp_msg, self.signature)
    }
}
