// Copyright (c) 2018-2022 The Botho Foundation

//! Tracking counters for admission and routing outcomes.
//!
//! The observer is injected rather than global so tests can assert on
//! outcomes (or ignore them with [`NopCounters`]) without touching a shared
//! registry.

use bth_consensus_scp_types::ResponderId;
use prometheus::{
    core::{Collector, Desc},
    proto::MetricFamily,
    IntCounter, IntCounterVec, Opts,
};

/// Observer for per-outcome admission counters and per-peer traffic
/// accounting.
pub trait TrackingCounters: Send + Sync {
    /// An envelope passed admission and reached the consensus engine.
    fn msg_accepted(&self);

    /// An envelope was buffered while the local node is out of sync.
    fn msg_buffered(&self);

    /// An envelope was dropped; `reason` is a stable label.
    fn msg_dropped(&self, reason: &str);

    /// A duplicate envelope was suppressed.
    fn msg_duplicate(&self);

    /// A raw peer message of `msg_type` arrived from `peer`.
    fn peer_traffic(&self, peer: &ResponderId, msg_type: &str);
}

/// An observer that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopCounters;

impl TrackingCounters for NopCounters {
    fn msg_accepted(&self) {}
    fn msg_buffered(&self) {}
    fn msg_dropped(&self, _reason: &str) {}
    fn msg_duplicate(&self) {}
    fn peer_traffic(&self, _peer: &ResponderId, _msg_type: &str) {}
}

/// Prometheus-backed counters.
#[derive(Clone)]
pub struct GatewayMetrics {
    accepted: IntCounter,
    buffered: IntCounter,
    duplicate: IntCounter,
    dropped: IntCounterVec,
    peer_traffic: IntCounterVec,
}

impl GatewayMetrics {
    /// Create unregistered counters.
    pub fn new() -> Self {
        Self {
            accepted: IntCounter::new(
                "consensus_gateway_msgs_accepted",
                "Envelopes accepted into the consensus engine",
            )
            .unwrap(),
            buffered: IntCounter::new(
                "consensus_gateway_msgs_buffered",
                "Envelopes buffered while out of sync",
            )
            .unwrap(),
            duplicate: IntCounter::new(
                "consensus_gateway_msgs_duplicate",
                "Duplicate envelopes suppressed",
            )
            .unwrap(),
            dropped: IntCounterVec::new(
                Opts::new(
                    "consensus_gateway_msgs_dropped",
                    "Envelopes dropped at admission, by reason",
                ),
                &["reason"],
            )
            .unwrap(),
            peer_traffic: IntCounterVec::new(
                Opts::new(
                    "consensus_gateway_peer_traffic",
                    "Raw peer messages routed, by peer and type",
                ),
                &["peer", "msg_type"],
            )
            .unwrap(),
        }
    }

    /// Create counters and register them on the default Prometheus registry.
    pub fn new_and_registered() -> Self {
        let metrics = Self::new();
        prometheus::register(Box::new(metrics.clone()))
            .expect("GatewayMetrics registration on Prometheus failed.");
        metrics
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingCounters for GatewayMetrics {
    fn msg_accepted(&self) {
        self.accepted.inc();
    }

    fn msg_buffered(&self) {
        self.buffered.inc();
    }

    fn msg_dropped(&self, reason: &str) {
        self.dropped.with_label_values(&[reason]).inc();
    }

    fn msg_duplicate(&self) {
        self.duplicate.inc();
    }

    fn peer_traffic(&self, peer: &ResponderId, msg_type: &str) {
        self.peer_traffic
            .with_label_values(&[&peer.0, msg_type])
            .inc();
    }
}

impl Collector for GatewayMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.accepted.desc();
        descs.extend(self.buffered.desc());
        descs.extend(self.duplicate.desc());
        descs.extend(self.dropped.desc());
        descs.extend(self.peer_traffic.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.accepted.collect();
        families.extend(self.buffered.collect());
        families.extend(self.duplicate.collect());
        families.extend(self.dropped.collect());
        families.extend(self.peer_traffic.collect());
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_count_outcomes() {
        let metrics = GatewayMetrics::new();
        metrics.msg_accepted();
        metrics.msg_accepted();
        metrics.msg_dropped("invalid_signature");
        metrics.msg_duplicate();

        assert_eq!(metrics.accepted.get(), 2);
        assert_eq!(
            metrics
                .dropped
                .with_label_values(&["invalid_signature"])
                .get(),
            1
        );
        assert_eq!(metrics.duplicate.get(), 1);
        assert_eq!(metrics.buffered.get(), 0);
    }

    #[test]
    fn peer_traffic_is_labelled_per_peer() {
        let metrics = GatewayMetrics::new();
        let peer = ResponderId("node1:8443".to_string());
        metrics.peer_traffic(&peer, "consensus");
        metrics.peer_traffic(&peer, "consensus");
        metrics.peer_traffic(&peer, "transactions");

        assert_eq!(
            metrics
                .peer_traffic
                .with_label_values(&["node1:8443", "consensus"])
                .get(),
            2
        );
    }
}
