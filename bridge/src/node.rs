// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::WatcherConfig;
use crate::connector::EthConnectorFactory;
use crate::health::HealthSignal;
use crate::metrics::WatcherMetrics;
use crate::server::{run_server, ServerState};
use crate::supervisor::run_supervised;
use crate::types::{ChainLock, GuardianSet};
use crate::watcher::{Watcher, WatcherOutputs};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Validates `config` and starts the supervised Ethereum watcher, plus the
/// health and metrics server when configured.
///
/// The returned handle completes once `cancel` fires and the watcher has shut
/// down.
pub async fn run_watcher_node(
    config: WatcherConfig,
    prometheus_registry: prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let settings = config.validate()?;
    let metrics = Arc::new(WatcherMetrics::new(&prometheus_registry));
    let health = HealthSignal::new();

    let (lock_tx, lock_rx) = mpsc::channel(settings.output_buffer);
    let (guardian_set_tx, guardian_set_rx) = mpsc::channel(settings.output_buffer);
    let sink = tokio::spawn(run_logging_sink(lock_rx, guardian_set_rx));

    let factory = EthConnectorFactory::new(
        &settings.eth_rpc_url,
        settings.bridge_address,
        settings.watcher.query_timeout,
        settings.watcher.event_buffer,
    );
    let watcher = Watcher::new(
        factory,
        settings.watcher.clone(),
        WatcherOutputs {
            locks: lock_tx,
            guardian_sets: guardian_set_tx,
        },
        health.clone(),
        metrics.clone(),
    );

    let server = match settings.metrics_address {
        Some(address) => Some(
            run_server(
                address,
                ServerState {
                    health,
                    watcher_state: watcher.subscribe_state(),
                    registry: prometheus_registry,
                },
            )
            .await?,
        ),
        None => None,
    };

    info!(
        "Watching bridge contract {:?} via {} with {} confirmations",
        settings.bridge_address, settings.eth_rpc_url, settings.watcher.min_confirmations
    );
    let restart = settings.restart;
    Ok(tokio::spawn(async move {
        run_supervised(&watcher, &restart, &metrics, cancel).await;
        // Dropping the watcher closes both output queues, which ends the sink.
        drop(watcher);
        let _ = sink.await;
        if let Some(server) = server {
            server.abort();
        }
    }))
}

/// Stands in for the signing pipeline: logs every confirmed lockup and
/// guardian set until both queues close.
async fn run_logging_sink(
    mut locks: mpsc::Receiver<ChainLock>,
    mut guardian_sets: mpsc::Receiver<GuardianSet>,
) {
    let mut locks_open = true;
    let mut guardian_sets_open = true;
    while locks_open || guardian_sets_open {
        tokio::select! {
            lock = locks.recv(), if locks_open => match lock {
                Some(lock) => info!(
                    "Confirmed lockup: tx={:?}, {} -> {}, token={:?}@{}, amount={}",
                    lock.tx_hash,
                    lock.source_chain,
                    lock.target_chain,
                    lock.token_address,
                    lock.token_chain,
                    lock.amount
                ),
                None => locks_open = false,
            },
            set = guardian_sets.recv(), if guardian_sets_open => match set {
                Some(set) => info!(
                    "Guardian set {}: {:?}",
                    set.index, set.keys
                ),
                None => guardian_sets_open = false,
            },
        }
    }
}
