// Copyright (c) 2018-2022 The Botho Foundation

//! Demultiplexing of raw authenticated peer messages by type.

use crate::{
    counters::TrackingCounters,
    gateway::{Admission, ConsensusGateway},
    msg::ConsensusMsg,
};
use bth_consensus_scp_types::{ResponderId, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// A message arriving from an authenticated peer channel.
///
/// Only the consensus variant is interpreted here; the rest are opaque
/// payloads owned by other subsystems.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(bound(deserialize = "V: Value"))]
pub enum PeerMessage<V: Value> {
    /// A signed consensus envelope.
    Consensus(ConsensusMsg<V>),

    /// Transaction gossip, handled by the mempool layer.
    Transactions(Vec<u8>),

    /// Sync and control traffic, handled by the sync layer.
    Control(Vec<u8>),
}

impl<V: Value> PeerMessage<V> {
    fn type_label(&self) -> &'static str {
        match self {
            PeerMessage::Consensus(_) => "consensus",
            PeerMessage::Transactions(_) => "transactions",
            PeerMessage::Control(_) => "control",
        }
    }
}

/// Handler for the message types the router does not own.
pub type OtherMessageHandler<V> =
    Box<dyn FnMut(&ResponderId, PeerMessage<V>) + Send>;

/// Routes peer messages: consensus traffic into the gateway, everything else
/// to the registered handler. Updates per-peer traffic accounting either way.
pub struct PeerMessageRouter<V: Value> {
    gateway: ConsensusGateway<V>,
    counters: Arc<dyn TrackingCounters>,
    other_handler: Option<OtherMessageHandler<V>>,
}

impl<V: Value> PeerMessageRouter<V> {
    /// Create a router in front of `gateway`.
    pub fn new(gateway: ConsensusGateway<V>, counters: Arc<dyn TrackingCounters>) -> Self {
        Self {
            gateway,
            counters,
            other_handler: None,
        }
    }

    /// Register the handler for non-consensus message types.
    pub fn set_other_handler(&mut self, handler: OtherMessageHandler<V>) {
        self.other_handler = Some(handler);
    }

    /// Access the gateway, e.g. for proposing values or firing timers.
    pub fn gateway_mut(&mut self) -> &mut ConsensusGateway<V> {
        &mut self.gateway
    }

    /// Route one message from `peer`. Returns the admission outcome for
    /// consensus messages, `None` for everything else.
    pub fn route(&mut self, peer: &ResponderId, msg: PeerMessage<V>) -> Option<Admission<V>> {
        self.counters.peer_traffic(peer, msg.type_label());
        match msg {
            PeerMessage::Consensus(envelope) => Some(self.gateway.admit(envelope)),
            other => {
                trace!(%peer, msg_type = other.type_label(), "forwarding non-consensus message");
                if let Some(handler) = &mut self.other_handler {
                    handler(peer, other);
                }
                None
            }
        }
    }
}
