// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::connector::StreamKind;
use std::time::Duration;

/// Failures reported by a chain connector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("could not decode event: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("subscription closed by the node")]
    SubscriptionClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Terminal outcome of a watcher run.
///
/// Every variant is fatal to the current run; restarting is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    #[error("dialing chain node failed: {0}")]
    Connect(#[source] ConnectorError),

    #[error("failed to subscribe to {stream} events: {source}")]
    Subscribe {
        stream: StreamKind,
        #[source]
        source: ConnectorError,
    },

    #[error("error while processing {stream} subscription: {source}")]
    SubscriptionFailed {
        stream: StreamKind,
        #[source]
        source: ConnectorError,
    },

    #[error("error requesting {what}: {source}")]
    GuardianSetQuery {
        what: String,
        #[source]
        source: ConnectorError,
    },

    #[error("request for {what} timed out after {timeout:?}")]
    QueryTimeout { what: String, timeout: Duration },

    #[error("{queue} output queue closed")]
    OutputClosed { queue: &'static str },

    #[error("watcher cancelled")]
    Cancelled,

    #[error("watcher task failed: {0}")]
    TaskFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WatcherError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            WatcherError::Connect(_) => "connect",
            WatcherError::Subscribe { .. } => "subscribe",
            WatcherError::SubscriptionFailed { .. } => "subscription_failed",
            WatcherError::GuardianSetQuery { .. } => "guardian_set_query",
            WatcherError::QueryTimeout { .. } => "query_timeout",
            WatcherError::OutputClosed { .. } => "output_closed",
            WatcherError::Cancelled => "cancelled",
            WatcherError::TaskFailed(_) => "task_failed",
            WatcherError::Config(_) => "config",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WatcherError::Cancelled)
    }
}

pub type WatcherResult<T> = Result<T, WatcherError>;
