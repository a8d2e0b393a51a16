// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{WatcherError, WatcherResult};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Name of the confirmed-lockup output queue, used in errors.
pub const LOCK_QUEUE: &str = "lock";
/// Name of the guardian set output queue, used in errors.
pub const GUARDIAN_SET_QUEUE: &str = "guardian set";

/// Runs `fut` unless `cancel` fires first, in which case `fut` is dropped and
/// `WatcherError::Cancelled` is returned.
pub async fn or_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> WatcherResult<T>
where
    F: Future<Output = WatcherResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WatcherError::Cancelled),
        result = fut => result,
    }
}

/// Sends `item` on a bounded output queue, waiting for capacity until the
/// item is accepted or `cancel` fires. Nothing is dropped silently: a closed
/// queue is an error.
pub async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    queue: &'static str,
    cancel: &CancellationToken,
) -> WatcherResult<()> {
    or_cancelled(cancel, async {
        tx.send(item)
            .await
            .map_err(|_| WatcherError::OutputClosed { queue })
    })
    .await
}
