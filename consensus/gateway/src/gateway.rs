// Copyright (c) 2018-2022 The Botho Foundation

//! Admission control in front of the consensus engine.

use crate::{counters::TrackingCounters, msg::ConsensusMsg};
use bth_consensus_scp::{ScpError, ScpNode, SlotIndex};
use bth_consensus_scp_types::{NodeID, Value};
use ed25519_dalek::SigningKey;
use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// Why an envelope was dropped at admission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The signature did not verify.
    InvalidSignature,

    /// The statement was structurally invalid (a sender protocol violation).
    Malformed,

    /// The slot is below the retention floor.
    StaleSlot,

    /// The slot is beyond the future horizon.
    BeyondHorizon,

    /// The exact statement was already processed.
    Duplicate,

    /// The out-of-sync buffer overflowed.
    OutOfSync,
}

impl DropReason {
    fn label(&self) -> &'static str {
        match self {
            DropReason::InvalidSignature => "invalid_signature",
            DropReason::Malformed => "malformed",
            DropReason::StaleSlot => "stale_slot",
            DropReason::BeyondHorizon => "beyond_horizon",
            DropReason::Duplicate => "duplicate",
            DropReason::OutOfSync => "out_of_sync",
        }
    }
}

/// The outcome of admitting one envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Admission<V: Value> {
    /// Admitted and applied; the engine's responses are signed and ready for
    /// broadcast.
    Accepted {
        /// Outbound envelopes to broadcast.
        outbound: Vec<ConsensusMsg<V>>,
    },

    /// Held back while the local node is out of sync.
    Buffered,

    /// Rejected; the reason was counted.
    Dropped(DropReason),
}

/// Bounds for the gateway's caches.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// How many statement digests the duplicate-suppression window holds.
    pub seen_capacity: usize,

    /// How many envelopes the out-of-sync buffer holds before dropping the
    /// oldest.
    pub buffer_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            seen_capacity: 10_000,
            buffer_capacity: 1_000,
        }
    }
}

/// Admission control: every inbound envelope passes here before the engine.
///
/// Checks run cheapest-first and fail closed: signature, structure, duplicate
/// suppression, sync state, then slot bounds inside the engine. Every outcome
/// ticks the injected counter observer.
pub struct ConsensusGateway<V: Value> {
    node: Box<dyn ScpNode<V, NodeID>>,
    signer: SigningKey,
    counters: Arc<dyn TrackingCounters>,
    config: GatewayConfig,

    /// Digests of already-processed statements, in arrival order.
    seen: HashSet<[u8; 32]>,
    seen_order: VecDeque<[u8; 32]>,

    /// Whether the local node is caught up enough to process consensus
    /// traffic.
    in_sync: bool,
    buffer: VecDeque<ConsensusMsg<V>>,
}

impl<V: Value> ConsensusGateway<V> {
    /// Create a gateway in front of `node`, signing outbound envelopes with
    /// `signer`.
    pub fn new(
        node: Box<dyn ScpNode<V, NodeID>>,
        signer: SigningKey,
        counters: Arc<dyn TrackingCounters>,
        config: GatewayConfig,
    ) -> Self {
        debug_assert_eq!(
            node.node_id().public_key.as_bytes(),
            &signer.verifying_key().to_bytes(),
            "signer does not match the node identity"
        );
        Self {
            node,
            signer,
            counters,
            config,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            in_sync: true,
            buffer: VecDeque::new(),
        }
    }

    /// Admit one inbound envelope.
    pub fn admit(&mut self, msg: ConsensusMsg<V>) -> Admission<V> {
        if msg.verify_signature().is_err() {
            return self.drop_msg(DropReason::InvalidSignature);
        }
        if msg.scp_msg.validate().is_err() {
            warn!(sender = %msg.scp_msg.sender_id, "malformed statement from peer");
            return self.drop_msg(DropReason::Malformed);
        }

        let digest = match msg.digest() {
            Ok(digest) => digest,
            Err(_) => return self.drop_msg(DropReason::Malformed),
        };
        if self.seen.contains(&digest) {
            trace!(sender = %msg.scp_msg.sender_id, "duplicate statement suppressed");
            self.counters.msg_duplicate();
            return Admission::Dropped(DropReason::Duplicate);
        }

        if !self.in_sync {
            if self.buffer.len() >= self.config.buffer_capacity {
                self.buffer.pop_front();
                self.counters.msg_dropped(DropReason::OutOfSync.label());
            }
            self.buffer.push_back(msg);
            self.counters.msg_buffered();
            return Admission::Buffered;
        }

        self.deliver(msg, digest)
    }

    /// Flip the sync flag. Coming back in sync replays the buffered envelopes
    /// in arrival order; the outbound responses are returned for broadcast.
    pub fn set_in_sync(&mut self, in_sync: bool) -> Vec<ConsensusMsg<V>> {
        if self.in_sync == in_sync {
            return Vec::new();
        }
        self.in_sync = in_sync;
        if !in_sync {
            return Vec::new();
        }

        let buffered: Vec<ConsensusMsg<V>> = self.buffer.drain(..).collect();
        debug!(count = buffered.len(), "replaying buffered envelopes");
        let mut outbound = Vec::new();
        for msg in buffered {
            if let Ok(digest) = msg.digest() {
                if let Admission::Accepted { outbound: out } = self.deliver(msg, digest) {
                    outbound.extend(out);
                }
            }
        }
        outbound
    }

    /// Propose values for a slot; outbound statements come back signed.
    pub fn propose_values(
        &mut self,
        slot_index: SlotIndex,
        values: BTreeSet<V>,
    ) -> Result<Vec<ConsensusMsg<V>>, ScpError> {
        let responses = self.node.propose_values(slot_index, values)?;
        Ok(self.sign_outbound(responses))
    }

    /// Fire the engine's timers; outbound statements come back signed.
    pub fn process_timeouts(&mut self) -> Vec<ConsensusMsg<V>> {
        let responses = self.node.process_timeouts();
        self.sign_outbound(responses)
    }

    /// Drain newly externalized slots, each reported exactly once.
    pub fn take_externalized(&mut self) -> Vec<(SlotIndex, V)> {
        self.node.take_externalized()
    }

    /// The decided value for a slot, if retained.
    pub fn externalized_value(&self, slot_index: SlotIndex) -> Option<V> {
        self.node.externalized_value(slot_index)
    }

    fn deliver(&mut self, msg: ConsensusMsg<V>, digest: [u8; 32]) -> Admission<V> {
        match self.node.handle_message(&msg.scp_msg) {
            Ok(responses) => {
                self.mark_seen(digest);
                self.counters.msg_accepted();
                Admission::Accepted {
                    outbound: self.sign_outbound(responses),
                }
            }
            Err(ScpError::StaleSlot { slot_index, floor }) => {
                debug!(slot_index, floor, "stale envelope");
                self.drop_msg(DropReason::StaleSlot)
            }
            Err(ScpError::SlotBeyondHorizon { slot_index, horizon }) => {
                debug!(slot_index, horizon, "envelope beyond horizon");
                self.drop_msg(DropReason::BeyondHorizon)
            }
            Err(err) => {
                warn!(%err, "engine rejected envelope");
                self.drop_msg(DropReason::Malformed)
            }
        }
    }

    fn drop_msg(&self, reason: DropReason) -> Admission<V> {
        self.counters.msg_dropped(reason.label());
        Admission::Dropped(reason)
    }

    fn mark_seen(&mut self, digest: [u8; 32]) {
        if self.seen.insert(digest) {
            self.seen_order.push_back(digest);
            while self.seen_order.len() > self.config.seen_capacity {
                if let Some(evicted) = self.seen_order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }

    fn sign_outbound(
        &self,
        responses: Vec<bth_consensus_scp::Msg<V, NodeID>>,
    ) -> Vec<ConsensusMsg<V>> {
        responses
            .into_iter()
            .filter_map(|response| match ConsensusMsg::from_scp_msg(response, &self.signer) {
                Ok(signed) => Some(signed),
                Err(err) => {
                    warn!(%err, "could not sign outbound statement");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bth_consensus_scp::{
        msg::NominatePayload, test_utils::test_node_id_and_signer, MockScpNode, Msg, Topic,
    };
    use bth_consensus_scp_types::{QuorumSliceSet, ResponderId};
    use maplit::btreeset;
    use std::sync::Mutex;

    /// A counter observer that records what it saw.
    #[derive(Default)]
    struct RecordingCounters {
        accepted: Mutex<u64>,
        buffered: Mutex<u64>,
        duplicate: Mutex<u64>,
        dropped: Mutex<Vec<String>>,
    }

    impl TrackingCounters for RecordingCounters {
        fn msg_accepted(&self) {
            *self.accepted.lock().unwrap() += 1;
        }
        fn msg_buffered(&self) {
            *self.buffered.lock().unwrap() += 1;
        }
        fn msg_dropped(&self, reason: &str) {
            self.dropped.lock().unwrap().push(reason.to_string());
        }
        fn msg_duplicate(&self) {
            *self.duplicate.lock().unwrap() += 1;
        }
        fn peer_traffic(&self, _peer: &ResponderId, _msg_type: &str) {}
    }

    fn peer_msg(seed: u32, slot_index: u64) -> ConsensusMsg<String> {
        let (node_id, signer) = test_node_id_and_signer(seed);
        let scp_msg = Msg::new(
            node_id.clone(),
            QuorumSliceSet::single(1, [node_id]),
            slot_index,
            Topic::Nominate(NominatePayload {
                X: btreeset! {"X".to_string()},
                Y: BTreeSet::new(),
            }),
        );
        ConsensusMsg::from_scp_msg(scp_msg, &signer).unwrap()
    }

    fn gateway_with(
        node: MockScpNode<String, NodeID>,
        counters: Arc<dyn TrackingCounters>,
    ) -> ConsensusGateway<String> {
        let (node_id, signer) = test_node_id_and_signer(1);
        let mut node = node;
        node.expect_node_id().return_const(node_id);
        ConsensusGateway::new(Box::new(node), signer, counters, GatewayConfig::default())
    }

    #[test]
    fn invalid_signature_fails_closed() {
        let counters = Arc::new(RecordingCounters::default());
        let mut node = MockScpNode::new();
        node.expect_handle_message().never();
        let mut gateway = gateway_with(node, counters.clone());

        let mut msg = peer_msg(2, 1);
        msg.scp_msg.slot_index = 9;
        assert_eq!(
            gateway.admit(msg),
            Admission::Dropped(DropReason::InvalidSignature)
        );
        assert_eq!(*counters.dropped.lock().unwrap(), ["invalid_signature"]);
    }

    #[test]
    fn accepted_envelope_reaches_the_engine_and_responses_are_signed() {
        let counters = Arc::new(RecordingCounters::default());
        let mut node = MockScpNode::new();
        let (node_id, _) = test_node_id_and_signer(1);
        let response = Msg::<String, NodeID>::new(
            node_id.clone(),
            QuorumSliceSet::single(1, [node_id]),
            1,
            Topic::Nominate(NominatePayload {
                X: btreeset! {"X".to_string()},
                Y: BTreeSet::new(),
            }),
        );
        node.expect_handle_message()
            .times(1)
            .return_once(move |_| Ok(vec![response]));
        let mut gateway = gateway_with(node, counters.clone());

        match gateway.admit(peer_msg(2, 1)) {
            Admission::Accepted { outbound } => {
                assert_eq!(outbound.len(), 1);
                assert!(outbound[0].verify_signature().is_ok());
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
        assert_eq!(*counters.accepted.lock().unwrap(), 1);
    }

    #[test]
    fn duplicate_is_suppressed_without_reprocessing() {
        let counters = Arc::new(RecordingCounters::default());
        let mut node = MockScpNode::new();
        // The engine sees the envelope exactly once.
        node.expect_handle_message()
            .times(1)
            .returning(|_| Ok(Vec::new()));
        let mut gateway = gateway_with(node, counters.clone());

        let msg = peer_msg(2, 1);
        assert!(matches!(
            gateway.admit(msg.clone()),
            Admission::Accepted { .. }
        ));
        assert_eq!(
            gateway.admit(msg),
            Admission::Dropped(DropReason::Duplicate)
        );
        assert_eq!(*counters.duplicate.lock().unwrap(), 1);
        assert_eq!(*counters.accepted.lock().unwrap(), 1);
    }

    #[test]
    fn out_of_sync_buffers_then_replays_in_order() {
        let counters = Arc::new(RecordingCounters::default());
        let mut node = MockScpNode::new();
        let delivered: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered_in_mock = delivered.clone();
        node.expect_handle_message().returning(move |msg| {
            delivered_in_mock.lock().unwrap().push(msg.slot_index);
            Ok(Vec::new())
        });
        let mut gateway = gateway_with(node, counters.clone());

        gateway.set_in_sync(false);
        assert_eq!(gateway.admit(peer_msg(2, 1)), Admission::Buffered);
        assert_eq!(gateway.admit(peer_msg(2, 2)), Admission::Buffered);
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(*counters.buffered.lock().unwrap(), 2);

        gateway.set_in_sync(true);
        assert_eq!(*delivered.lock().unwrap(), [1, 2]);
    }

    #[test]
    fn out_of_sync_buffer_is_bounded() {
        let counters = Arc::new(RecordingCounters::default());
        let mut node = MockScpNode::new();
        let delivered: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered_in_mock = delivered.clone();
        node.expect_handle_message().returning(move |msg| {
            delivered_in_mock.lock().unwrap().push(msg.slot_index);
            Ok(Vec::new())
        });
        let (node_id, signer) = test_node_id_and_signer(1);
        let mut mock = node;
        mock.expect_node_id().return_const(node_id);
        let mut gateway = ConsensusGateway::new(
            Box::new(mock),
            signer,
            counters.clone(),
            GatewayConfig {
                buffer_capacity: 2,
                ..GatewayConfig::default()
            },
        );

        gateway.set_in_sync(false);
        for slot in 1..=3u64 {
            gateway.admit(peer_msg(2, slot));
        }
        gateway.set_in_sync(true);

        // The oldest envelope was dropped and counted.
        assert_eq!(*delivered.lock().unwrap(), [2, 3]);
        assert!(counters
            .dropped
            .lock()
            .unwrap()
            .contains(&"out_of_sync".to_string()));
    }

    #[test]
    fn stale_and_horizon_rejections_are_counted() {
        let counters = Arc::new(RecordingCounters::default());
        let mut node = MockScpNode::new();
        node.expect_handle_message()
            .returning(|msg| match msg.slot_index {
                2 => Err(ScpError::StaleSlot {
                    slot_index: 2,
                    floor: 3,
                }),
                _ => Err(ScpError::SlotBeyondHorizon {
                    slot_index: 999,
                    horizon: 100,
                }),
            });
        let mut gateway = gateway_with(node, counters.clone());

        assert_eq!(
            gateway.admit(peer_msg(2, 2)),
            Admission::Dropped(DropReason::StaleSlot)
        );
        assert_eq!(
            gateway.admit(peer_msg(2, 999)),
            Admission::Dropped(DropReason::BeyondHorizon)
        );
        assert_eq!(
            *counters.dropped.lock().unwrap(),
            ["stale_slot", "beyond_horizon"]
        );
    }
}
