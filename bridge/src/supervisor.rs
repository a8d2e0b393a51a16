// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Restarts the watcher after fatal errors.
//!
//! The watcher itself never retries. This loop calls [`Watcher::run`] again
//! after every error other than cancellation, waiting an exponentially growing
//! delay in between. The delay starts over once a run reaches `Running`.

use crate::connector::ConnectorFactory;
use crate::metrics::WatcherMetrics;
use crate::watcher::Watcher;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            randomization_factor: 0.1,
        }
    }
}

impl RestartPolicy {
    /// Backoff that never gives up.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Runs `watcher` until `cancel` fires, restarting it after every failure.
pub async fn run_supervised<F: ConnectorFactory>(
    watcher: &Watcher<F>,
    policy: &RestartPolicy,
    metrics: &WatcherMetrics,
    cancel: CancellationToken,
) {
    let mut backoff = policy.backoff();
    loop {
        let mut health = watcher.health().subscribe();
        health.borrow_and_update();

        let error = watcher.run(cancel.clone()).await;
        if error.is_cancelled() || cancel.is_cancelled() {
            info!("Supervisor stopped");
            return;
        }

        // Any health change means the run got as far as Running.
        if health.has_changed().unwrap_or(false) {
            backoff.reset();
        }
        let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
        metrics.watcher_restarts.inc();
        warn!("Restarting watcher in {:?} after error: {}", delay, error);

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Supervisor stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
