// Copyright (c) 2018-2022 The Botho Foundation

//! Admission control and message routing in front of the consensus core.
//!
//! The gateway verifies envelope signatures, rejects stale and malformed
//! traffic, suppresses duplicates, and buffers while the local node is out of
//! sync, before anything reaches the consensus engine. The router
//! demultiplexes raw peer messages by type, handing consensus traffic to the
//! gateway. Both report outcomes through an injected counter observer.

#![deny(missing_docs)]

pub mod counters;
mod error;
pub mod gateway;
pub mod msg;
pub mod router;

pub use crate::{
    counters::{GatewayMetrics, NopCounters, TrackingCounters},
    error::ConsensusMsgError,
    gateway::{Admission, ConsensusGateway, DropReason, GatewayConfig},
    msg::ConsensusMsg,
    router::{PeerMessage, PeerMessageRouter},
};
