// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

const SWEEP_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Clone, Debug)]
pub struct WatcherMetrics {
    pub(crate) locks_observed: IntCounter,
    pub(crate) locks_confirmed: IntCounter,
    pub(crate) locks_dropped: IntCounter,
    pub(crate) pending_locks: IntGauge,
    pub(crate) last_processed_head: IntGauge,

    pub(crate) current_guardian_set_index: IntGauge,
    pub(crate) guardian_sets_forwarded: IntCounter,

    pub(crate) header_sweep_latency: Histogram,

    pub(crate) subscription_errors: IntCounterVec,
    pub(crate) watcher_errors: IntCounterVec,
    pub(crate) watcher_restarts: IntCounter,
}

impl WatcherMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            locks_observed: register_int_counter_with_registry!(
                "watcher_locks_observed",
                "Total number of token lockup events observed",
                registry,
            )
            .unwrap(),
            locks_confirmed: register_int_counter_with_registry!(
                "watcher_locks_confirmed",
                "Total number of lockups forwarded after reaching confirmation depth",
                registry,
            )
            .unwrap(),
            locks_dropped: register_int_counter_with_registry!(
                "watcher_locks_dropped",
                "Total number of lockups dropped after the timeout window",
                registry,
            )
            .unwrap(),
            pending_locks: register_int_gauge_with_registry!(
                "watcher_pending_locks",
                "Number of lockups waiting for confirmation after the last sweep",
                registry,
            )
            .unwrap(),
            last_processed_head: register_int_gauge_with_registry!(
                "watcher_last_processed_head",
                "Height of the last block head swept",
                registry,
            )
            .unwrap(),
            current_guardian_set_index: register_int_gauge_with_registry!(
                "watcher_current_guardian_set_index",
                "Index of the last guardian set forwarded",
                registry,
            )
            .unwrap(),
            guardian_sets_forwarded: register_int_counter_with_registry!(
                "watcher_guardian_sets_forwarded",
                "Total number of guardian set snapshots forwarded",
                registry,
            )
            .unwrap(),
            header_sweep_latency: register_histogram_with_registry!(
                "watcher_header_sweep_latency",
                "Time spent sweeping pending lockups on a new head, in seconds",
                SWEEP_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            subscription_errors: register_int_counter_vec_with_registry!(
                "watcher_subscription_errors",
                "Total number of failed subscriptions, by stream",
                &["stream"],
                registry,
            )
            .unwrap(),
            watcher_errors: register_int_counter_vec_with_registry!(
                "watcher_errors",
                "Total number of watcher runs ended by an error, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            watcher_restarts: register_int_counter_with_registry!(
                "watcher_restarts",
                "Total number of watcher restarts by the supervisor",
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
