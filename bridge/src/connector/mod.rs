// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain connection seam.
//!
//! The watcher only talks to the chain through [`ChainConnector`]: three
//! event subscriptions and two point queries. Connecting is a separate step
//! owned by a [`ConnectorFactory`] so every watcher run starts from a fresh
//! connection.

use crate::error::{ConnectorError, ConnectorResult};
use crate::types::{GuardianSetChangedEvent, LockEvent, NewHead};
use async_trait::async_trait;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod eth;

pub use eth::{EthConnector, EthConnectorFactory};

/// Identifies one of the three streams a watcher subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Locks,
    GuardianSet,
    Heads,
}

impl StreamKind {
    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Locks => "locks",
            StreamKind::GuardianSet => "guardian_set",
            StreamKind::Heads => "heads",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Locks => write!(f, "token lockup"),
            StreamKind::GuardianSet => write!(f, "guardian set"),
            StreamKind::Heads => write!(f, "header"),
        }
    }
}

/// An item delivered by a subscription: an event, or the transport error that
/// ended it.
pub type SubscriptionItem<T> = Result<T, ConnectorError>;

/// Cancels the producer side of a subscription.
///
/// Unsubscribing is idempotent and also happens when the guard is dropped.
#[derive(Debug)]
pub struct SubscriptionGuard {
    kind: StreamKind,
    token: CancellationToken,
}

impl SubscriptionGuard {
    pub fn new(kind: StreamKind, token: CancellationToken) -> Self {
        Self { kind, token }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn unsubscribe(&self) {
        if !self.token.is_cancelled() {
            debug!("Unsubscribing from {} events", self.kind);
            self.token.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// An established subscription: an ordered item queue plus its guard.
#[derive(Debug)]
pub struct Subscription<T> {
    items: mpsc::Receiver<SubscriptionItem<T>>,
    guard: SubscriptionGuard,
}

impl<T> Subscription<T> {
    pub fn new(
        kind: StreamKind,
        items: mpsc::Receiver<SubscriptionItem<T>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            items,
            guard: SubscriptionGuard::new(kind, token),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.guard.kind
    }

    /// Splits into the item queue (handed to a forwarding task) and the guard
    /// (kept by whoever owns the subscription's lifetime).
    pub fn into_parts(self) -> (mpsc::Receiver<SubscriptionItem<T>>, SubscriptionGuard) {
        (self.items, self.guard)
    }
}

#[async_trait]
pub trait ChainConnector: Send + Sync + 'static {
    /// Token lockup events emitted by the bridge contract.
    async fn subscribe_locks(&self) -> ConnectorResult<Subscription<LockEvent>>;

    /// Guardian set rotations emitted by the bridge contract.
    async fn subscribe_guardian_set_changes(
        &self,
    ) -> ConnectorResult<Subscription<GuardianSetChangedEvent>>;

    /// New block heads of the chain.
    async fn subscribe_new_heads(&self) -> ConnectorResult<Subscription<NewHead>>;

    /// Index of the guardian set currently active on the bridge contract.
    async fn guardian_set_index(&self) -> ConnectorResult<u32>;

    /// Keys of the guardian set stored at `index`, in contract order.
    async fn guardian_set(&self, index: u32) -> ConnectorResult<Vec<EthAddress>>;
}

#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    type Connector: ChainConnector;

    async fn connect(&self) -> ConnectorResult<Self::Connector>;
}
