// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watcher orchestrator
//!
//! One call to [`Watcher::run`] walks through
//! `Connecting → Subscribing → Running → Terminating` and always ends with the
//! error that stopped it. Nothing survives a run: the next call dials a new
//! connection and starts from an empty pending table, so restarting is the
//! caller's job (see [`crate::supervisor`]).

use crate::connector::{ChainConnector, ConnectorFactory, StreamKind, Subscription};
use crate::error::{WatcherError, WatcherResult};
use crate::guardian_set::{GuardianSetPublisher, GuardianSetSync, DEFAULT_QUERY_TIMEOUT};
use crate::health::HealthSignal;
use crate::metrics::WatcherMetrics;
use crate::multiplexer::{EventLoop, HeaderLoop, LoopHandles, SubscriptionMultiplexer};
use crate::pending_locks::{ConfirmationPolicy, PendingLockTable};
use crate::types::{ChainId, ChainLock, GuardianSet, GuardianSetChangedEvent, LockEvent, NewHead};
use crate::utils::or_cancelled;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default capacity of the per-loop event queues.
pub const DEFAULT_EVENT_BUFFER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    /// No run started yet.
    Idle,
    Connecting,
    Subscribing,
    Running,
    Terminating,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatcherState::Idle => "idle",
            WatcherState::Connecting => "connecting",
            WatcherState::Subscribing => "subscribing",
            WatcherState::Running => "running",
            WatcherState::Terminating => "terminating",
        };
        write!(f, "{}", name)
    }
}

/// Constructor-time settings of a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherOptions {
    pub min_confirmations: u64,
    pub query_timeout: Duration,
    pub event_buffer: usize,
    /// Chain recorded as the source of every observed lockup.
    pub source_chain: ChainId,
}

impl WatcherOptions {
    pub fn new(min_confirmations: u64) -> Self {
        Self {
            min_confirmations,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            source_chain: ChainId::ETHEREUM,
        }
    }
}

/// Output queues read by the signing pipeline.
#[derive(Debug, Clone)]
pub struct WatcherOutputs {
    pub locks: mpsc::Sender<ChainLock>,
    pub guardian_sets: mpsc::Sender<GuardianSet>,
}

type Subscriptions = (
    Subscription<LockEvent>,
    Subscription<GuardianSetChangedEvent>,
    Subscription<NewHead>,
);

pub struct Watcher<F> {
    factory: F,
    options: WatcherOptions,
    outputs: WatcherOutputs,
    health: HealthSignal,
    metrics: Arc<WatcherMetrics>,
    state: watch::Sender<WatcherState>,
}

impl<F: ConnectorFactory> Watcher<F> {
    pub fn new(
        factory: F,
        options: WatcherOptions,
        outputs: WatcherOutputs,
        health: HealthSignal,
        metrics: Arc<WatcherMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            factory,
            options,
            outputs,
            health,
            metrics,
            state,
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    pub fn health(&self) -> &HealthSignal {
        &self.health
    }

    /// Runs until cancellation or the first fatal error and returns the cause.
    ///
    /// All subscriptions are released and both processing loops have exited
    /// by the time this returns. Cancellation yields `WatcherError::Cancelled`.
    pub async fn run(&self, cancel: CancellationToken) -> WatcherError {
        let error = self.run_once(&cancel).await;
        if self.state() != WatcherState::Terminating {
            self.set_state(WatcherState::Terminating);
        }
        self.health.reset();
        if error.is_cancelled() {
            info!("[{}] Watcher cancelled", self.options.source_chain);
        } else {
            self.metrics
                .watcher_errors
                .with_label_values(&[error.error_type()])
                .inc();
            error!("[{}] Watcher stopped: {}", self.options.source_chain, error);
        }
        error
    }

    async fn run_once(&self, cancel: &CancellationToken) -> WatcherError {
        let chain = self.options.source_chain;

        self.set_state(WatcherState::Connecting);
        info!("[{}] Dialing chain node", chain);
        let connector = match or_cancelled(cancel, async {
            self.factory.connect().await.map_err(WatcherError::Connect)
        })
        .await
        {
            Ok(connector) => Arc::new(connector),
            Err(e) => return e,
        };

        self.set_state(WatcherState::Subscribing);
        let (locks, guardian_sets, heads) =
            match or_cancelled(cancel, Self::subscribe_all(connector.as_ref(), chain)).await {
                Ok(subscriptions) => subscriptions,
                Err(e) => return e,
            };
        let (locks, lock_guard) = locks.into_parts();
        let (guardian_sets, guardian_set_guard) = guardian_sets.into_parts();
        let (heads, head_guard) = heads.into_parts();
        let guards = [lock_guard, guardian_set_guard, head_guard];

        let run_token = cancel.child_token();
        let table = Arc::new(PendingLockTable::new());
        let sync = GuardianSetSync::new(connector.clone(), self.options.query_timeout);
        let publisher =
            GuardianSetPublisher::new(self.outputs.guardian_sets.clone(), self.metrics.clone());
        let mut loops = SubscriptionMultiplexer::start(
            locks,
            guardian_sets,
            heads,
            self.options.event_buffer,
            &run_token,
        )
        .spawn_loops(
            EventLoop::new(
                table.clone(),
                sync.clone(),
                publisher.clone(),
                chain,
                self.metrics.clone(),
            ),
            HeaderLoop::new(
                table,
                ConfirmationPolicy::new(self.options.min_confirmations),
                self.outputs.locks.clone(),
                chain,
                self.metrics.clone(),
            ),
            &run_token,
        );

        self.set_state(WatcherState::Running);
        self.health.signal_healthy();
        info!("[{}] Watcher running", chain);

        let error = Self::await_termination(&sync, &publisher, &mut loops, cancel, &run_token).await;

        self.set_state(WatcherState::Terminating);
        info!("[{}] Watcher terminating: {}", chain, error);
        run_token.cancel();
        for guard in &guards {
            guard.unsubscribe();
        }
        loops.join().await;
        error
    }

    /// Establishes the three subscriptions in order. On failure the ones
    /// already established are dropped, which unsubscribes them.
    async fn subscribe_all(
        connector: &F::Connector,
        chain: ChainId,
    ) -> WatcherResult<Subscriptions> {
        let locks = connector
            .subscribe_locks()
            .await
            .map_err(|source| WatcherError::Subscribe {
                stream: StreamKind::Locks,
                source,
            })?;
        info!("[{}] Subscribed to {} events", chain, StreamKind::Locks);

        let guardian_sets = connector
            .subscribe_guardian_set_changes()
            .await
            .map_err(|source| WatcherError::Subscribe {
                stream: StreamKind::GuardianSet,
                source,
            })?;
        info!("[{}] Subscribed to {} events", chain, StreamKind::GuardianSet);

        let heads = connector
            .subscribe_new_heads()
            .await
            .map_err(|source| WatcherError::Subscribe {
                stream: StreamKind::Heads,
                source,
            })?;
        info!("[{}] Subscribed to {} events", chain, StreamKind::Heads);

        Ok((locks, guardian_sets, heads))
    }

    /// Forwards the startup guardian set, then waits for cancellation or the
    /// first loop failure. A loop failing during the startup fetch also ends
    /// the run.
    async fn await_termination(
        sync: &GuardianSetSync<F::Connector>,
        publisher: &GuardianSetPublisher,
        loops: &mut LoopHandles,
        cancel: &CancellationToken,
        run_token: &CancellationToken,
    ) -> WatcherError {
        let initial = async {
            let set = sync.fetch_current().await?;
            publisher.publish_initial(set, run_token).await
        };
        tokio::pin!(initial);
        let mut initial_done = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatcherError::Cancelled,
                error = loops.first_exit() => return error,
                result = &mut initial, if !initial_done => {
                    initial_done = true;
                    if let Err(e) = result {
                        return e;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: WatcherState) {
        debug!("[{}] Watcher state -> {}", self.options.source_chain, state);
        self.state.send_replace(state);
    }
}
