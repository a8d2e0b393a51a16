// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Liveness signal for an external process supervisor
//!
//! A watcher run sets the signal once its subscriptions are established and
//! both processing loops are started. It is reset when the run terminates, so
//! a restarting watcher reports unhealthy until it is back in `Running`.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Cloneable handle to the shared liveness flag.
#[derive(Debug, Clone)]
pub struct HealthSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl HealthSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Mark the watcher healthy
    pub fn signal_healthy(&self) {
        if self.set(true) {
            info!("Watcher reported healthy");
        }
    }

    /// Mark the watcher unhealthy
    pub fn reset(&self) {
        if self.set(false) {
            info!("Watcher no longer healthy");
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self.sender.borrow()
    }

    // Subscribers are only notified when the flag actually flips.
    fn set(&self, healthy: bool) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == healthy {
                return false;
            }
            *current = healthy;
            true
        })
    }

    /// Subscribe to health changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Waits until the signal is set.
    pub async fn wait_healthy(&self) -> bool {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            // The sender lives as long as `self`.
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

impl Default for HealthSignal {
    fn default() -> Self {
        Self::new()
    }
}
