// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Guardian set fetching and forwarding.
//!
//! [`GuardianSetSync`] performs the two point queries against the bridge
//! contract, each bounded by the query timeout. [`GuardianSetPublisher`] is the
//! only writer of the guardian set output queue for a watcher run: the startup
//! snapshot is always forwarded first and rotation snapshots never go
//! backwards in index.

use crate::connector::ChainConnector;
use crate::error::{ConnectorResult, WatcherError, WatcherResult};
use crate::metrics::WatcherMetrics;
use crate::types::GuardianSet;
use crate::utils::{or_cancelled, send_or_cancel, GUARDIAN_SET_QUEUE};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct GuardianSetSync<C> {
    connector: Arc<C>,
    timeout: Duration,
}

impl<C> Clone for GuardianSetSync<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: ChainConnector> GuardianSetSync<C> {
    pub fn new(connector: Arc<C>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    /// Fetches the set the contract currently reports as active.
    pub async fn fetch_current(&self) -> WatcherResult<GuardianSet> {
        let index = self
            .query(
                "current guardian set index".to_string(),
                self.connector.guardian_set_index(),
            )
            .await?;
        self.fetch_by_index(index).await
    }

    pub async fn fetch_by_index(&self, index: u32) -> WatcherResult<GuardianSet> {
        let keys = self
            .query(
                format!("guardian set {}", index),
                self.connector.guardian_set(index),
            )
            .await?;
        info!(
            "Fetched guardian set {} with {} keys",
            index,
            keys.len()
        );
        Ok(GuardianSet::new(keys, index))
    }

    async fn query<T>(
        &self,
        what: String,
        request: impl Future<Output = ConnectorResult<T>>,
    ) -> WatcherResult<T> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(WatcherError::GuardianSetQuery { what, source }),
            Err(_) => Err(WatcherError::QueryTimeout {
                what,
                timeout: self.timeout,
            }),
        }
    }
}

struct PublisherState {
    tx: mpsc::Sender<GuardianSet>,
    last_index: Mutex<Option<u32>>,
    initial_sent: watch::Sender<bool>,
    metrics: Arc<WatcherMetrics>,
}

/// Forwards guardian set snapshots for one watcher run.
#[derive(Clone)]
pub struct GuardianSetPublisher {
    state: Arc<PublisherState>,
}

impl GuardianSetPublisher {
    pub fn new(tx: mpsc::Sender<GuardianSet>, metrics: Arc<WatcherMetrics>) -> Self {
        let (initial_sent, _) = watch::channel(false);
        Self {
            state: Arc::new(PublisherState {
                tx,
                last_index: Mutex::new(None),
                initial_sent,
                metrics,
            }),
        }
    }

    /// Forwards the set fetched at startup, whatever its index, and releases
    /// any rotation waiting behind it.
    pub async fn publish_initial(
        &self,
        set: GuardianSet,
        cancel: &CancellationToken,
    ) -> WatcherResult<()> {
        let mut last_index = self.state.last_index.lock().await;
        let index = set.index;
        send_or_cancel(&self.state.tx, set, GUARDIAN_SET_QUEUE, cancel).await?;
        *last_index = Some(index);
        self.record_forwarded(index);
        info!("Forwarded initial guardian set {}", index);
        self.state.initial_sent.send_replace(true);
        Ok(())
    }

    /// Forwards a set fetched after a rotation.
    ///
    /// Waits until the startup set has been forwarded. Returns false when the
    /// snapshot was skipped because its index does not advance past the last
    /// forwarded one.
    pub async fn publish_rotation(
        &self,
        set: GuardianSet,
        cancel: &CancellationToken,
    ) -> WatcherResult<bool> {
        or_cancelled(cancel, self.wait_initial_sent()).await?;

        let mut last_index = self.state.last_index.lock().await;
        if let Some(last) = *last_index {
            if set.index <= last {
                warn!(
                    "Skipping guardian set {}: not newer than forwarded set {}",
                    set.index, last
                );
                return Ok(false);
            }
        }
        let index = set.index;
        send_or_cancel(&self.state.tx, set, GUARDIAN_SET_QUEUE, cancel).await?;
        *last_index = Some(index);
        self.record_forwarded(index);
        info!("Forwarded guardian set {}", index);
        Ok(true)
    }

    /// Index of the last forwarded snapshot.
    pub async fn last_index(&self) -> Option<u32> {
        *self.state.last_index.lock().await
    }

    async fn wait_initial_sent(&self) -> WatcherResult<()> {
        let mut rx = self.state.initial_sent.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(WatcherError::Cancelled);
            }
        }
    }

    fn record_forwarded(&self, index: u32) {
        self.state.metrics.guardian_sets_forwarded.inc();
        self.state
            .metrics
            .current_guardian_set_index
            .set(index as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectorError;
    use crate::test_utils::{get_test_guardian_keys, within, MockChainConnector};

    fn sync(connector: &MockChainConnector) -> GuardianSetSync<MockChainConnector> {
        GuardianSetSync::new(Arc::new(connector.clone()), DEFAULT_QUERY_TIMEOUT)
    }

    #[tokio::test]
    async fn test_fetch_current_queries_index_then_set() {
        let connector = MockChainConnector::new();
        connector.add_guardian_set(3, get_test_guardian_keys(2));
        connector.set_current_guardian_set(4, get_test_guardian_keys(5));

        let set = sync(&connector).fetch_current().await.unwrap();
        assert_eq!(set, GuardianSet::new(get_test_guardian_keys(5), 4));
        assert_eq!(connector.index_queries(), 1);
        assert_eq!(connector.set_queries(), vec![4]);
    }

    #[tokio::test]
    async fn test_fetch_by_index_preserves_key_order() {
        let connector = MockChainConnector::new();
        let mut keys = get_test_guardian_keys(3);
        keys.reverse();
        connector.add_guardian_set(5, keys.clone());

        let set = sync(&connector).fetch_by_index(5).await.unwrap();
        assert_eq!(set.keys, keys);
        assert_eq!(set.index, 5);
    }

    #[tokio::test]
    async fn test_query_failure_names_the_request() {
        let connector = MockChainConnector::new();
        connector.fail_queries(Some(ConnectorError::Query("execution reverted".into())));

        let err = sync(&connector).fetch_current().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error requesting current guardian set index: query failed: execution reverted"
        );

        let err = sync(&connector).fetch_by_index(7).await.unwrap_err();
        assert_eq!(
            err,
            WatcherError::GuardianSetQuery {
                what: "guardian set 7".to_string(),
                source: ConnectorError::Query("execution reverted".into()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_times_out() {
        let connector = MockChainConnector::new();
        connector.set_current_guardian_set(1, get_test_guardian_keys(1));
        connector.delay_queries(Some(Duration::from_secs(16)));

        let err = sync(&connector).fetch_current().await.unwrap_err();
        assert_eq!(
            err,
            WatcherError::QueryTimeout {
                what: "current guardian set index".to_string(),
                timeout: DEFAULT_QUERY_TIMEOUT,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_within_timeout_succeeds() {
        let connector = MockChainConnector::new();
        connector.set_current_guardian_set(1, get_test_guardian_keys(1));
        connector.delay_queries(Some(Duration::from_secs(14)));

        let set = sync(&connector).fetch_by_index(1).await.unwrap();
        assert_eq!(set.index, 1);
    }

    #[tokio::test]
    async fn test_rotation_waits_for_initial_set() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher = GuardianSetPublisher::new(tx, Arc::new(WatcherMetrics::new_for_testing()));
        let cancel = CancellationToken::new();

        let rotation = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                publisher
                    .publish_rotation(GuardianSet::new(get_test_guardian_keys(3), 5), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        publisher
            .publish_initial(GuardianSet::new(get_test_guardian_keys(2), 4), &cancel)
            .await
            .unwrap();
        assert!(within(rotation).await.unwrap().unwrap());

        assert_eq!(rx.recv().await.unwrap().index, 4);
        assert_eq!(rx.recv().await.unwrap().index, 5);
        assert_eq!(publisher.last_index().await, Some(5));
    }

    #[tokio::test]
    async fn test_rotation_forwards_exact_snapshot() {
        let connector = MockChainConnector::new();
        connector.set_current_guardian_set(4, get_test_guardian_keys(2));
        let keys = get_test_guardian_keys(3);
        connector.add_guardian_set(5, keys.clone());

        let metrics = Arc::new(WatcherMetrics::new_for_testing());
        let (tx, mut rx) = mpsc::channel(4);
        let publisher = GuardianSetPublisher::new(tx, metrics.clone());
        let sync = sync(&connector);
        let cancel = CancellationToken::new();

        publisher
            .publish_initial(sync.fetch_current().await.unwrap(), &cancel)
            .await
            .unwrap();
        let forwarded = publisher
            .publish_rotation(sync.fetch_by_index(5).await.unwrap(), &cancel)
            .await
            .unwrap();
        assert!(forwarded);

        assert_eq!(rx.recv().await.unwrap().index, 4);
        assert_eq!(rx.recv().await.unwrap(), GuardianSet::new(keys, 5));
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.guardian_sets_forwarded.get(), 2);
        assert_eq!(metrics.current_guardian_set_index.get(), 5);
    }

    #[tokio::test]
    async fn test_stale_rotation_is_skipped() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher = GuardianSetPublisher::new(tx, Arc::new(WatcherMetrics::new_for_testing()));
        let cancel = CancellationToken::new();

        publisher
            .publish_initial(GuardianSet::new(get_test_guardian_keys(2), 5), &cancel)
            .await
            .unwrap();
        let forwarded = publisher
            .publish_rotation(GuardianSet::new(get_test_guardian_keys(2), 5), &cancel)
            .await
            .unwrap();
        assert!(!forwarded);
        let forwarded = publisher
            .publish_rotation(GuardianSet::new(get_test_guardian_keys(2), 3), &cancel)
            .await
            .unwrap();
        assert!(!forwarded);

        assert_eq!(rx.recv().await.unwrap().index, 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_releases_waiting_rotation() {
        let (tx, _rx) = mpsc::channel(4);
        let publisher = GuardianSetPublisher::new(tx, Arc::new(WatcherMetrics::new_for_testing()));
        let cancel = CancellationToken::new();

        let rotation = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                publisher
                    .publish_rotation(GuardianSet::new(get_test_guardian_keys(1), 2), &cancel)
                    .await
            })
        };
        cancel.cancel();
        assert_eq!(within(rotation).await.unwrap(), Err(WatcherError::Cancelled));
        assert_eq!(publisher.last_index().await, None);
    }
}
