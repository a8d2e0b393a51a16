// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Subscription fan-in and the two processing loops.
//!
//! Each subscription gets a forwarding task that tags its items and pushes
//! them into one ordered queue per loop:
//!
//! ```text
//! locks ─────────┐
//!                ├──▶ LogEvent queue ──▶ EventLoop  ──▶ PendingLockTable
//! guardian set ──┘                          │
//!                                           └──▶ GuardianSetSync ──▶ guardian set queue
//! heads ─────────────▶ HeadEvent queue ─▶ HeaderLoop ──▶ sweep ──▶ lock queue
//! ```
//!
//! The header loop never waits on the event loop, so a slow sweep or a full
//! lock queue does not hold back lockup or rotation events. Any subscription
//! failure ends the loop that consumes it.

use crate::connector::{ChainConnector, StreamKind, SubscriptionItem};
use crate::error::{ConnectorError, WatcherError, WatcherResult};
use crate::guardian_set::{GuardianSetPublisher, GuardianSetSync};
use crate::metrics::WatcherMetrics;
use crate::pending_locks::{ConfirmationPolicy, PendingLockTable};
use crate::types::{ChainId, ChainLock, GuardianSetChangedEvent, LockEvent, NewHead};
use crate::utils::{or_cancelled, send_or_cancel, LOCK_QUEUE};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Messages consumed by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Lock(LockEvent),
    GuardianSetChanged(GuardianSetChangedEvent),
    SubscriptionFailed {
        stream: StreamKind,
        error: ConnectorError,
    },
}

/// Messages consumed by the header loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadEvent {
    NewHead(NewHead),
    SubscriptionFailed {
        stream: StreamKind,
        error: ConnectorError,
    },
}

/// Converts subscription items into a loop's tagged message type.
pub trait Tagged<T>: Sized {
    fn event(item: T) -> Self;
    fn failure(stream: StreamKind, error: ConnectorError) -> Self;
}

impl Tagged<LockEvent> for LogEvent {
    fn event(item: LockEvent) -> Self {
        LogEvent::Lock(item)
    }

    fn failure(stream: StreamKind, error: ConnectorError) -> Self {
        LogEvent::SubscriptionFailed { stream, error }
    }
}

impl Tagged<GuardianSetChangedEvent> for LogEvent {
    fn event(item: GuardianSetChangedEvent) -> Self {
        LogEvent::GuardianSetChanged(item)
    }

    fn failure(stream: StreamKind, error: ConnectorError) -> Self {
        LogEvent::SubscriptionFailed { stream, error }
    }
}

impl Tagged<NewHead> for HeadEvent {
    fn event(item: NewHead) -> Self {
        HeadEvent::NewHead(item)
    }

    fn failure(stream: StreamKind, error: ConnectorError) -> Self {
        HeadEvent::SubscriptionFailed { stream, error }
    }
}

/// Moves items of one subscription into a loop queue until the subscription
/// fails, the queue closes, or `cancel` fires.
///
/// A subscription that ends without an error is reported as closed. After a
/// failure has been forwarded nothing else is read from the subscription.
pub async fn forward_subscription<T, M>(
    stream: StreamKind,
    mut items: mpsc::Receiver<SubscriptionItem<T>>,
    queue: mpsc::Sender<M>,
    cancel: CancellationToken,
) where
    M: Tagged<T>,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = items.recv() => item,
        };
        let (message, last) = match item {
            Some(Ok(event)) => (M::event(event), false),
            Some(Err(error)) => (M::failure(stream, error), true),
            None => (M::failure(stream, ConnectorError::SubscriptionClosed), true),
        };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = queue.send(message) => sent,
        };
        if sent.is_err() || last {
            return;
        }
    }
}

/// Fans the three subscriptions into the event-loop and header-loop queues.
pub struct SubscriptionMultiplexer {
    log_events: mpsc::Receiver<LogEvent>,
    head_events: mpsc::Receiver<HeadEvent>,
    forwarders: Vec<JoinHandle<()>>,
}

impl SubscriptionMultiplexer {
    /// Spawns one forwarding task per subscription. All of them stop when
    /// `cancel` fires.
    pub fn start(
        locks: mpsc::Receiver<SubscriptionItem<LockEvent>>,
        guardian_sets: mpsc::Receiver<SubscriptionItem<GuardianSetChangedEvent>>,
        heads: mpsc::Receiver<SubscriptionItem<NewHead>>,
        buffer: usize,
        cancel: &CancellationToken,
    ) -> Self {
        let (log_tx, log_events) = mpsc::channel(buffer);
        let (head_tx, head_events) = mpsc::channel(buffer);
        let forwarders = vec![
            tokio::spawn(forward_subscription(
                StreamKind::Locks,
                locks,
                log_tx.clone(),
                cancel.clone(),
            )),
            tokio::spawn(forward_subscription(
                StreamKind::GuardianSet,
                guardian_sets,
                log_tx,
                cancel.clone(),
            )),
            tokio::spawn(forward_subscription(
                StreamKind::Heads,
                heads,
                head_tx,
                cancel.clone(),
            )),
        ];
        Self {
            log_events,
            head_events,
            forwarders,
        }
    }

    /// Spawns both loops on the multiplexed queues.
    pub fn spawn_loops<C: ChainConnector>(
        self,
        event_loop: EventLoop<C>,
        header_loop: HeaderLoop,
        cancel: &CancellationToken,
    ) -> LoopHandles {
        let mut loops = JoinSet::new();
        loops.spawn(event_loop.run(self.log_events, cancel.clone()));
        loops.spawn(header_loop.run(self.head_events, cancel.clone()));
        LoopHandles {
            loops,
            forwarders: self.forwarders,
        }
    }
}

/// Tasks of a running multiplexer.
pub struct LoopHandles {
    loops: JoinSet<WatcherResult<()>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl LoopHandles {
    /// Waits for the next loop to stop and returns its error. A loop that
    /// stopped because of cancellation yields `WatcherError::Cancelled`, as
    /// does calling this once both loops are gone.
    ///
    /// Cancel safe.
    pub async fn first_exit(&mut self) -> WatcherError {
        match self.loops.join_next().await {
            None | Some(Ok(Ok(()))) => WatcherError::Cancelled,
            Some(Ok(Err(e))) => e,
            Some(Err(e)) => WatcherError::TaskFailed(format!("processing loop failed: {}", e)),
        }
    }

    /// Waits for every remaining task to finish. The caller cancels them first.
    pub async fn join(mut self) {
        while self.loops.join_next().await.is_some() {}
        for forwarder in self.forwarders {
            let _ = forwarder.await;
        }
    }
}

/// Consumes lockup and guardian set events.
pub struct EventLoop<C> {
    table: Arc<PendingLockTable>,
    guardian_sets: GuardianSetSync<C>,
    publisher: GuardianSetPublisher,
    source_chain: ChainId,
    metrics: Arc<WatcherMetrics>,
}

impl<C: ChainConnector> EventLoop<C> {
    pub fn new(
        table: Arc<PendingLockTable>,
        guardian_sets: GuardianSetSync<C>,
        publisher: GuardianSetPublisher,
        source_chain: ChainId,
        metrics: Arc<WatcherMetrics>,
    ) -> Self {
        Self {
            table,
            guardian_sets,
            publisher,
            source_chain,
            metrics,
        }
    }

    /// Returns `Ok(())` once `cancel` fires, or the error that ended the loop.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<LogEvent>,
        cancel: CancellationToken,
    ) -> WatcherResult<()> {
        info!("[{}] Starting event loop", self.source_chain);
        let result = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                event = events.recv() => event,
            };
            let step = match event {
                Some(LogEvent::Lock(lock)) => {
                    self.handle_lock(lock).await;
                    Ok(())
                }
                Some(LogEvent::GuardianSetChanged(change)) => {
                    self.handle_guardian_set_change(change, &cancel).await
                }
                Some(LogEvent::SubscriptionFailed { stream, error }) => {
                    self.metrics
                        .subscription_errors
                        .with_label_values(&[stream.label()])
                        .inc();
                    Err(WatcherError::SubscriptionFailed {
                        stream,
                        source: error,
                    })
                }
                None => Err(WatcherError::TaskFailed(
                    "event queue closed".to_string(),
                )),
            };
            if let Err(e) = step {
                break Err(e);
            }
        };
        finish_loop("event loop", self.source_chain, result)
    }

    async fn handle_lock(&self, event: LockEvent) {
        let tx_hash = event.tx_hash;
        let height = event.block_number;
        info!(
            "[{}] Found new lockup transaction: tx={:?}, block={}",
            self.source_chain, tx_hash, height
        );
        let lock = event.into_chain_lock(self.source_chain);
        self.table.insert(tx_hash, lock, height).await;
        self.metrics.locks_observed.inc();
    }

    async fn handle_guardian_set_change(
        &self,
        change: GuardianSetChangedEvent,
        cancel: &CancellationToken,
    ) -> WatcherResult<()> {
        info!(
            "[{}] Guardian set changed: {} -> {}",
            self.source_chain, change.old_index, change.new_index
        );
        let set = or_cancelled(
            cancel,
            self.guardian_sets.fetch_by_index(change.new_index),
        )
        .await?;
        self.publisher.publish_rotation(set, cancel).await?;
        Ok(())
    }
}

/// Sweeps pending lockups on every new head and forwards confirmed ones.
pub struct HeaderLoop {
    table: Arc<PendingLockTable>,
    policy: ConfirmationPolicy,
    lock_tx: mpsc::Sender<ChainLock>,
    source_chain: ChainId,
    metrics: Arc<WatcherMetrics>,
}

impl HeaderLoop {
    pub fn new(
        table: Arc<PendingLockTable>,
        policy: ConfirmationPolicy,
        lock_tx: mpsc::Sender<ChainLock>,
        source_chain: ChainId,
        metrics: Arc<WatcherMetrics>,
    ) -> Self {
        Self {
            table,
            policy,
            lock_tx,
            source_chain,
            metrics,
        }
    }

    /// Returns `Ok(())` once `cancel` fires, or the error that ended the loop.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<HeadEvent>,
        cancel: CancellationToken,
    ) -> WatcherResult<()> {
        info!(
            "[{}] Starting header loop, min_confirmations={}",
            self.source_chain,
            self.policy.min_confirmations()
        );
        let result = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                event = events.recv() => event,
            };
            let step = match event {
                Some(HeadEvent::NewHead(head)) => self.process_head(head.number, &cancel).await,
                Some(HeadEvent::SubscriptionFailed { stream, error }) => {
                    self.metrics
                        .subscription_errors
                        .with_label_values(&[stream.label()])
                        .inc();
                    Err(WatcherError::SubscriptionFailed {
                        stream,
                        source: error,
                    })
                }
                None => Err(WatcherError::TaskFailed(
                    "header queue closed".to_string(),
                )),
            };
            if let Err(e) = step {
                break Err(e);
            }
        };
        finish_loop("header loop", self.source_chain, result)
    }

    async fn process_head(&self, height: u64, cancel: &CancellationToken) -> WatcherResult<()> {
        let start = Instant::now();
        debug!("[{}] Processing new header {}", self.source_chain, height);

        let sweep = self.table.sweep_and_remove(height, &self.policy).await;
        self.metrics
            .header_sweep_latency
            .observe(start.elapsed().as_secs_f64());
        self.metrics.locks_dropped.inc_by(sweep.dropped as u64);
        self.metrics.pending_locks.set(sweep.remaining as i64);
        self.metrics.last_processed_head.set(height as i64);

        let confirmed = sweep.confirmed.len();
        for lock in sweep.confirmed {
            info!(
                "[{}] Lockup confirmed: tx={:?}, head={}",
                self.source_chain, lock.tx_hash, height
            );
            send_or_cancel(&self.lock_tx, lock, LOCK_QUEUE, cancel).await?;
            self.metrics.locks_confirmed.inc();
        }

        info!(
            "[{}] Processed header {} in {:?}: confirmed={}, dropped={}, pending={}",
            self.source_chain,
            height,
            start.elapsed(),
            confirmed,
            sweep.dropped,
            sweep.remaining
        );
        Ok(())
    }
}

fn finish_loop(name: &str, chain: ChainId, result: WatcherResult<()>) -> WatcherResult<()> {
    match result {
        Ok(()) | Err(WatcherError::Cancelled) => {
            info!("[{}] {} stopped", chain, name);
            Ok(())
        }
        Err(e) => {
            error!("[{}] {} terminated: {}", chain, name, e);
            Err(e)
        }
    }
}
