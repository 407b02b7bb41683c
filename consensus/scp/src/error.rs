// Copyright (c) 2018-2022 The Botho Foundation

//! Error types for the consensus core.

use bth_consensus_scp_types::SlotIndex;
use thiserror::Error;

/// Errors that can occur while folding messages into consensus state.
///
/// All of these are per-message recoverable outcomes; none is fatal to the
/// process. `QuorumSetConfig` halts processing for the affected slot only.
#[derive(Debug, Error)]
pub enum ScpError {
    /// Message routed to the wrong slot (expected {expected}, got {got})
    #[error("Message routed to the wrong slot (expected {expected}, got {got})")]
    WrongSlot {
        /// The index of the slot the message was handed to.
        expected: SlotIndex,
        /// The slot index the message carries.
        got: SlotIndex,
    },

    /// Structurally invalid statement: {0}
    #[error("Structurally invalid statement: {0}")]
    MalformedStatement(String),

    /// Slot {slot_index} is below the retention floor {floor}
    #[error("Slot {slot_index} is below the retention floor {floor}")]
    StaleSlot {
        /// The stale slot index.
        slot_index: SlotIndex,
        /// The lowest slot index still accepted.
        floor: SlotIndex,
    },

    /// Slot {slot_index} is beyond the future horizon {horizon}
    #[error("Slot {slot_index} is beyond the future horizon {horizon}")]
    SlotBeyondHorizon {
        /// The too-far-ahead slot index.
        slot_index: SlotIndex,
        /// The highest slot index currently accepted.
        horizon: SlotIndex,
    },

    /// Invalid quorum slice configuration: {0}
    #[error("Invalid quorum slice configuration: {0}")]
    QuorumSetConfig(String),

    /// Value rejected by the application: {0}
    #[error("Value rejected by the application: {0}")]
    InvalidValue(String),

    /// Serialization error: {0}
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for ScpError {
    fn from(err: serde_json::Error) -> Self {
        ScpError::SerializationError(err.to_string())
    }
}

/// Result type for consensus operations.
pub type ScpResult<T> = Result<T, ScpError>;
