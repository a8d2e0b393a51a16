// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ethereum connector over a WebSocket provider.
//!
//! Each subscription runs in its own task that owns the provider stream and
//! pumps decoded items into a bounded queue. Cancelling the subscription's
//! token stops the task, and dropping the stream unsubscribes on the node.

use super::{
    ChainConnector, ConnectorFactory, StreamKind, Subscription, SubscriptionItem,
};
use crate::abi::{BridgeContract, LogGuardianSetChangedFilter, LogTokensLockedFilter};
use crate::error::{ConnectorError, ConnectorResult};
use crate::types::{ChainId, GuardianSetChangedEvent, LockEvent, NewHead, TxHash};
use async_trait::async_trait;
use ethers::contract::{parse_log, EthEvent};
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::{Address as EthAddress, Block, Filter, Log, H256};
use futures::{Future, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dials a fresh [`EthConnector`] for every watcher run.
#[derive(Debug, Clone)]
pub struct EthConnectorFactory {
    rpc_url: String,
    bridge: EthAddress,
    timeout: Duration,
    buffer: usize,
}

impl EthConnectorFactory {
    pub fn new(rpc_url: &str, bridge: EthAddress, timeout: Duration, buffer: usize) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            bridge,
            timeout,
            buffer,
        }
    }
}

#[async_trait]
impl ConnectorFactory for EthConnectorFactory {
    type Connector = EthConnector;

    async fn connect(&self) -> ConnectorResult<EthConnector> {
        info!("Dialing eth node at {}", self.rpc_url);
        let provider = time::timeout(self.timeout, Provider::<Ws>::connect(self.rpc_url.as_str()))
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout))?
            .map_err(|e| ConnectorError::Dial(e.to_string()))?;
        Ok(EthConnector::new(
            Arc::new(provider),
            self.bridge,
            self.timeout,
            self.buffer,
        ))
    }
}

pub struct EthConnector {
    provider: Arc<Provider<Ws>>,
    bridge: EthAddress,
    contract: BridgeContract<Provider<Ws>>,
    timeout: Duration,
    buffer: usize,
}

impl EthConnector {
    pub fn new(
        provider: Arc<Provider<Ws>>,
        bridge: EthAddress,
        timeout: Duration,
        buffer: usize,
    ) -> Self {
        let contract = BridgeContract::new(bridge, provider.clone());
        Self {
            provider,
            bridge,
            contract,
            timeout,
            buffer,
        }
    }

    fn event_filter(&self, topic0: H256) -> Filter {
        Filter::new().address(self.bridge).topic0(topic0)
    }

    async fn subscribe_logs_as<T, F>(
        &self,
        kind: StreamKind,
        filter: Filter,
        decode: F,
    ) -> ConnectorResult<Subscription<T>>
    where
        T: Send + 'static,
        F: Fn(Log) -> Option<SubscriptionItem<T>> + Send + 'static,
    {
        let provider = self.provider.clone();
        self.spawn_subscription(kind, move |ready, tx, token| async move {
            let opened = provider.subscribe_logs(&filter).await;
            serve(kind, opened, decode, ready, tx, token).await;
        })
        .await
    }

    /// Spawns the task owning the provider stream and waits until the node
    /// has accepted the subscription.
    async fn spawn_subscription<T, F, Fut>(
        &self,
        kind: StreamKind,
        task: F,
    ) -> ConnectorResult<Subscription<T>>
    where
        T: Send + 'static,
        F: FnOnce(ReadySender, mpsc::Sender<SubscriptionItem<T>>, CancellationToken) -> Fut
            + Send,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.buffer);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(task(ready_tx, tx, token.clone()));

        await_ready(kind, ready_rx, &token, self.timeout).await?;
        Ok(Subscription::new(kind, rx, token))
    }
}

#[async_trait]
impl ChainConnector for EthConnector {
    async fn subscribe_locks(&self) -> ConnectorResult<Subscription<LockEvent>> {
        let filter = self.event_filter(LogTokensLockedFilter::signature());
        self.subscribe_logs_as(StreamKind::Locks, filter, |log| {
            skip_removed(StreamKind::Locks, log).map(decode_lock)
        })
        .await
    }

    async fn subscribe_guardian_set_changes(
        &self,
    ) -> ConnectorResult<Subscription<GuardianSetChangedEvent>> {
        let filter = self.event_filter(LogGuardianSetChangedFilter::signature());
        self.subscribe_logs_as(StreamKind::GuardianSet, filter, |log| {
            skip_removed(StreamKind::GuardianSet, log).map(decode_guardian_set_changed)
        })
        .await
    }

    async fn subscribe_new_heads(&self) -> ConnectorResult<Subscription<NewHead>> {
        let provider = self.provider.clone();
        self.spawn_subscription(StreamKind::Heads, move |ready, tx, token| async move {
            let opened = provider.subscribe_blocks().await;
            serve(StreamKind::Heads, opened, decode_head, ready, tx, token).await;
        })
        .await
    }

    async fn guardian_set_index(&self) -> ConnectorResult<u32> {
        query_guardian_set_index(&self.contract).await
    }

    async fn guardian_set(&self, index: u32) -> ConnectorResult<Vec<EthAddress>> {
        query_guardian_set(&self.contract, index).await
    }
}

type ReadySender = oneshot::Sender<ConnectorResult<()>>;

/// Waits for the subscription task to report whether the node accepted the
/// subscription. The task is cancelled unless it did, including when this
/// future is dropped while waiting.
async fn await_ready(
    kind: StreamKind,
    ready: oneshot::Receiver<ConnectorResult<()>>,
    token: &CancellationToken,
    timeout: Duration,
) -> ConnectorResult<()> {
    let guard = token.clone().drop_guard();
    let result = match time::timeout(timeout, ready).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ConnectorError::Subscribe(format!(
            "{} subscription task exited before it was established",
            kind
        ))),
        Err(_) => Err(ConnectorError::Timeout(timeout)),
    };
    if result.is_ok() {
        guard.disarm();
        info!("Subscribed to {} events", kind);
    }
    result
}

/// Reports the outcome of opening a provider stream, then pumps it.
async fn serve<S, E, R, T, F>(
    kind: StreamKind,
    opened: Result<S, E>,
    map: F,
    ready: ReadySender,
    tx: mpsc::Sender<SubscriptionItem<T>>,
    token: CancellationToken,
) where
    S: Stream<Item = R>,
    E: fmt::Display,
    F: Fn(R) -> Option<SubscriptionItem<T>>,
{
    match opened {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            pump(kind, stream, map, tx, token).await;
        }
        Err(e) => {
            let _ = ready.send(Err(ConnectorError::Subscribe(e.to_string())));
        }
    }
}

async fn query_guardian_set_index<M: Middleware>(
    contract: &BridgeContract<M>,
) -> ConnectorResult<u32> {
    contract
        .guardian_set_index()
        .call()
        .await
        .map_err(|e| ConnectorError::Query(e.to_string()))
}

async fn query_guardian_set<M: Middleware>(
    contract: &BridgeContract<M>,
    index: u32,
) -> ConnectorResult<Vec<EthAddress>> {
    let (keys, _expiration_time) = contract
        .get_guardian_set(index)
        .call()
        .await
        .map_err(|e| ConnectorError::Query(e.to_string()))?;
    Ok(keys)
}

/// Moves items from a provider stream into the subscription queue until the
/// stream ends, an error is delivered, the consumer goes away, or the token is
/// cancelled.
async fn pump<S, R, T, F>(
    kind: StreamKind,
    stream: S,
    map: F,
    tx: mpsc::Sender<SubscriptionItem<T>>,
    token: CancellationToken,
) where
    S: Stream<Item = R>,
    F: Fn(R) -> Option<SubscriptionItem<T>>,
{
    tokio::pin!(stream);
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        let item = match next {
            Some(raw) => match map(raw) {
                Some(item) => item,
                None => continue,
            },
            None => {
                warn!("{} subscription stream ended", kind);
                Err(ConnectorError::SubscriptionClosed)
            }
        };
        let terminal = item.is_err();
        tokio::select! {
            _ = token.cancelled() => break,
            sent = tx.send(item) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if terminal {
            break;
        }
    }
    debug!("{} subscription task stopped", kind);
}

fn skip_removed(kind: StreamKind, log: Log) -> Option<Log> {
    if log.removed == Some(true) {
        warn!(
            "Ignoring {} log removed by reorg: tx={:?}, block={:?}",
            kind, log.transaction_hash, log.block_number
        );
        return None;
    }
    Some(log)
}

fn log_position(log: &Log) -> ConnectorResult<(TxHash, u64)> {
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| ConnectorError::Decode("log without transaction hash".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| ConnectorError::Decode(format!("log {:?} without block number", tx_hash)))?;
    Ok((tx_hash, block_number.as_u64()))
}

pub(crate) fn decode_lock(log: Log) -> SubscriptionItem<LockEvent> {
    let (tx_hash, block_number) = log_position(&log)?;
    let event: LogTokensLockedFilter =
        parse_log(log).map_err(|e| ConnectorError::Decode(e.to_string()))?;
    Ok(LockEvent {
        tx_hash,
        block_number,
        sender: H256(event.sender),
        recipient: H256(event.recipient),
        target_chain: ChainId(event.target_chain),
        token_chain: ChainId(event.token_chain),
        token: H256(event.token),
        amount: event.amount,
    })
}

pub(crate) fn decode_guardian_set_changed(log: Log) -> SubscriptionItem<GuardianSetChangedEvent> {
    let event: LogGuardianSetChangedFilter =
        parse_log(log).map_err(|e| ConnectorError::Decode(e.to_string()))?;
    Ok(GuardianSetChangedEvent {
        old_index: event.old_guardian_index,
        new_index: event.new_guardian_index,
    })
}

fn decode_head(block: Block<TxHash>) -> Option<SubscriptionItem<NewHead>> {
    // Pending blocks carry no number yet.
    block.number.map(|number| {
        Ok(NewHead {
            number: number.as_u64(),
        })
    })
}
