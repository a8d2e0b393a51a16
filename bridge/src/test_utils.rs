// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::connector::{
    ChainConnector, ConnectorFactory, StreamKind, Subscription, SubscriptionItem,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::types::{ChainId, GuardianSetChangedEvent, LockEvent, NewHead};
use async_trait::async_trait;
use ethers::types::{Address as EthAddress, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MOCK_STREAM_BUFFER: usize = 64;

/// A lockup log with every byte field derived from `tag`.
pub fn get_test_lock_event(tag: u8, block_number: u64) -> LockEvent {
    LockEvent {
        tx_hash: H256::repeat_byte(tag),
        block_number,
        sender: H256::from_low_u64_be(0x5e4d),
        recipient: H256::from_low_u64_be(0x4ec1),
        target_chain: ChainId::SOLANA,
        token_chain: ChainId::ETHEREUM,
        token: H256::from_low_u64_be(0x70c),
        amount: U256::from(tag as u64 * 1_000),
    }
}

/// Deterministic guardian keys for a set of `size` members.
pub fn get_test_guardian_keys(size: u8) -> Vec<EthAddress> {
    (1..=size).map(EthAddress::repeat_byte).collect()
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct MockState {
    guardian_sets: HashMap<u32, Vec<EthAddress>>,
    current_index: Option<u32>,
    query_failure: Option<ConnectorError>,
    query_delay: Option<Duration>,
    subscribe_failures: HashMap<StreamKind, ConnectorError>,
    lock_tx: Option<mpsc::Sender<SubscriptionItem<LockEvent>>>,
    guardian_set_tx: Option<mpsc::Sender<SubscriptionItem<GuardianSetChangedEvent>>>,
    head_tx: Option<mpsc::Sender<SubscriptionItem<NewHead>>>,
    subscriptions: Vec<(StreamKind, CancellationToken)>,
    index_queries: usize,
    set_queries: Vec<u32>,
}

/// In-memory chain connector driven by the test.
///
/// Clones share state, so a test keeps one handle while the watcher owns
/// another. Each new subscription replaces the sender the `push_*` helpers
/// write to.
#[derive(Clone, Default)]
pub struct MockChainConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockChainConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the set stored at `index` and makes it the current one.
    pub fn set_current_guardian_set(&self, index: u32, keys: Vec<EthAddress>) {
        let mut state = self.state.lock().unwrap();
        state.guardian_sets.insert(index, keys);
        state.current_index = Some(index);
    }

    /// Scripts the set stored at `index` without changing the current index.
    pub fn add_guardian_set(&self, index: u32, keys: Vec<EthAddress>) {
        self.state
            .lock()
            .unwrap()
            .guardian_sets
            .insert(index, keys);
    }

    pub fn fail_queries(&self, error: Option<ConnectorError>) {
        self.state.lock().unwrap().query_failure = error;
    }

    pub fn delay_queries(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().query_delay = delay;
    }

    pub fn fail_subscribe(&self, kind: StreamKind, error: ConnectorError) {
        self.state
            .lock()
            .unwrap()
            .subscribe_failures
            .insert(kind, error);
    }

    pub async fn push_lock(&self, event: LockEvent) {
        let tx = self.state.lock().unwrap().lock_tx.clone();
        tx.expect("no lock subscription")
            .send(Ok(event))
            .await
            .expect("lock subscription dropped");
    }

    pub async fn push_guardian_change(&self, old_index: u32, new_index: u32) {
        let tx = self.state.lock().unwrap().guardian_set_tx.clone();
        tx.expect("no guardian set subscription")
            .send(Ok(GuardianSetChangedEvent {
                old_index,
                new_index,
            }))
            .await
            .expect("guardian set subscription dropped");
    }

    pub async fn push_head(&self, number: u64) {
        let tx = self.state.lock().unwrap().head_tx.clone();
        tx.expect("no head subscription")
            .send(Ok(NewHead { number }))
            .await
            .expect("head subscription dropped");
    }

    /// Delivers a transport error on the current subscription of `kind`.
    pub async fn fail_stream(&self, kind: StreamKind, error: ConnectorError) {
        let (lock_tx, guardian_set_tx, head_tx) = {
            let state = self.state.lock().unwrap();
            (
                state.lock_tx.clone(),
                state.guardian_set_tx.clone(),
                state.head_tx.clone(),
            )
        };
        let delivered = match kind {
            StreamKind::Locks => lock_tx
                .expect("no lock subscription")
                .send(Err(error))
                .await
                .is_ok(),
            StreamKind::GuardianSet => guardian_set_tx
                .expect("no guardian set subscription")
                .send(Err(error))
                .await
                .is_ok(),
            StreamKind::Heads => head_tx
                .expect("no head subscription")
                .send(Err(error))
                .await
                .is_ok(),
        };
        assert!(delivered, "{} subscription dropped", kind);
    }

    /// Ends the current subscription of `kind` without an error.
    pub fn close_stream(&self, kind: StreamKind) {
        let mut state = self.state.lock().unwrap();
        match kind {
            StreamKind::Locks => state.lock_tx = None,
            StreamKind::GuardianSet => state.guardian_set_tx = None,
            StreamKind::Heads => state.head_tx = None,
        }
    }

    /// Total number of subscriptions of `kind` ever established.
    pub fn subscribe_count(&self, kind: StreamKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Number of established subscriptions that were not unsubscribed yet.
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .count()
    }

    pub fn index_queries(&self) -> usize {
        self.state.lock().unwrap().index_queries
    }

    pub fn set_queries(&self) -> Vec<u32> {
        self.state.lock().unwrap().set_queries.clone()
    }

    fn subscribe<T>(
        &self,
        kind: StreamKind,
        store: impl FnOnce(&mut MockState, mpsc::Sender<SubscriptionItem<T>>),
    ) -> ConnectorResult<Subscription<T>> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.subscribe_failures.get(&kind) {
            return Err(error.clone());
        }
        let (tx, rx) = mpsc::channel(MOCK_STREAM_BUFFER);
        let token = CancellationToken::new();
        store(&mut *state, tx);
        state.subscriptions.push((kind, token.clone()));
        Ok(Subscription::new(kind, rx, token))
    }

    async fn query<T>(
        &self,
        record: impl FnOnce(&mut MockState) -> Option<T>,
        missing: String,
    ) -> ConnectorResult<T> {
        let delay = self.state.lock().unwrap().query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.query_failure {
            return Err(error.clone());
        }
        record(&mut *state).ok_or(ConnectorError::Query(missing))
    }
}

#[async_trait]
impl ChainConnector for MockChainConnector {
    async fn subscribe_locks(&self) -> ConnectorResult<Subscription<LockEvent>> {
        self.subscribe(StreamKind::Locks, |state, tx| state.lock_tx = Some(tx))
    }

    async fn subscribe_guardian_set_changes(
        &self,
    ) -> ConnectorResult<Subscription<GuardianSetChangedEvent>> {
        self.subscribe(StreamKind::GuardianSet, |state, tx| {
            state.guardian_set_tx = Some(tx)
        })
    }

    async fn subscribe_new_heads(&self) -> ConnectorResult<Subscription<NewHead>> {
        self.subscribe(StreamKind::Heads, |state, tx| state.head_tx = Some(tx))
    }

    async fn guardian_set_index(&self) -> ConnectorResult<u32> {
        self.query(
            |state| {
                state.index_queries += 1;
                state.current_index
            },
            "no current guardian set".to_string(),
        )
        .await
    }

    async fn guardian_set(&self, index: u32) -> ConnectorResult<Vec<EthAddress>> {
        self.query(
            |state| {
                state.set_queries.push(index);
                state.guardian_sets.get(&index).cloned()
            },
            format!("unknown guardian set {}", index),
        )
        .await
    }
}

/// Hands out clones of one shared [`MockChainConnector`].
#[derive(Clone, Default)]
pub struct MockConnectorFactory {
    connector: MockChainConnector,
    connect_failures: Arc<Mutex<VecDeque<ConnectorError>>>,
    connects: Arc<AtomicUsize>,
}

impl MockConnectorFactory {
    pub fn new(connector: MockChainConnector) -> Self {
        Self {
            connector,
            ..Default::default()
        }
    }

    /// Makes the next `connect` call fail with `error`. Failures queue up.
    pub fn fail_next_connect(&self, error: ConnectorError) {
        self.connect_failures.lock().unwrap().push_back(error);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorFactory for MockConnectorFactory {
    type Connector = MockChainConnector;

    async fn connect(&self) -> ConnectorResult<Self::Connector> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.connect_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.connector.clone())
    }
}

/// Awaits `fut` with a five second limit, panicking on expiry.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting in test")
}
