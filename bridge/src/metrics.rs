// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const RPC_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10., 20., 30.,
];

#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    pub(crate) vt_request_event: IntCounter,
    pub(crate) vt_handle_event: IntCounter,
    pub(crate) vt_recovered_request_event: IntCounterVec,
    pub(crate) vt_pending_request_event: IntGaugeVec,

    pub(crate) vt_request_nonce_count: IntGaugeVec,
    pub(crate) vt_handle_nonce_count: IntGaugeVec,
    pub(crate) vt_lower_handle_nonce_count: IntGaugeVec,

    pub(crate) handle_tx_submitted: IntCounterVec,
    pub(crate) err_handle_tx_submission: IntCounterVec,

    pub(crate) last_anchored_block_num: IntGauge,
    pub(crate) anchoring_tx_submitted: IntCounter,
    pub(crate) bridge_tx_pool_size: IntGauge,

    pub(crate) peer_count: IntGauge,
    pub(crate) peer_messages_received: IntCounterVec,

    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            vt_request_event: register_int_counter_with_registry!(
                "vt_request_event",
                "Total number of value transfer request events received",
                registry,
            )
            .unwrap(),
            vt_handle_event: register_int_counter_with_registry!(
                "vt_handle_event",
                "Total number of value transfer handle events received",
                registry,
            )
            .unwrap(),
            vt_recovered_request_event: register_int_counter_vec_with_registry!(
                "vt_recovered_request_event",
                "Total number of request events re-injected by value transfer recovery",
                &["direction"],
                registry,
            )
            .unwrap(),
            vt_pending_request_event: register_int_gauge_vec_with_registry!(
                "vt_pending_request_event",
                "Number of request events waiting to be handled, by bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            vt_request_nonce_count: register_int_gauge_vec_with_registry!(
                "vt_request_nonce_count",
                "Highest request nonce observed on the counterpart bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            vt_handle_nonce_count: register_int_gauge_vec_with_registry!(
                "vt_handle_nonce_count",
                "Handle nonce of the bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            vt_lower_handle_nonce_count: register_int_gauge_vec_with_registry!(
                "vt_lower_handle_nonce_count",
                "Lower handle nonce of the bridge",
                &["bridge"],
                registry,
            )
            .unwrap(),
            handle_tx_submitted: register_int_counter_vec_with_registry!(
                "vt_handle_tx_submitted",
                "Total number of handle transactions submitted, by token type",
                &["token_type"],
                registry,
            )
            .unwrap(),
            err_handle_tx_submission: register_int_counter_vec_with_registry!(
                "err_handle_tx_submission",
                "Total number of failed handle transaction submissions, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            last_anchored_block_num: register_int_gauge_with_registry!(
                "last_anchored_block_num",
                "Latest child block number anchored on the parent chain",
                registry,
            )
            .unwrap(),
            anchoring_tx_submitted: register_int_counter_with_registry!(
                "anchoring_tx_submitted",
                "Total number of anchoring transactions queued",
                registry,
            )
            .unwrap(),
            bridge_tx_pool_size: register_int_gauge_with_registry!(
                "bridge_tx_pool_size",
                "Number of transactions in the bridge tx pool",
                registry,
            )
            .unwrap(),
            peer_count: register_int_gauge_with_registry!(
                "bridge_peer_count",
                "Number of connected bridge peers",
                registry,
            )
            .unwrap(),
            peer_messages_received: register_int_counter_vec_with_registry!(
                "peer_messages_received",
                "Total number of peer messages received, by message code",
                &["code"],
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "bridge_rpc_queries",
                "Total number of chain rpc queries, by chain and method",
                &["chain", "method"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "bridge_rpc_queries_latency",
                "Latency of chain rpc queries, by chain and method",
                &["chain", "method"],
                RPC_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
