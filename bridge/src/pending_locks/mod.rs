// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pending Locks Module
//!
//! Holds lockups that were observed on chain but are not deep enough yet to be
//! forwarded for signing.
//!
//! ## Design Principles
//!
//! 1. **Memory only**: nothing is persisted; after a restart the chain's event
//!    history repopulates the table
//! 2. **One entry per transaction**: re-observing a hash replaces the entry
//!    and its height
//! 3. **Removed exactly once**: an entry leaves the table only inside
//!    `sweep_and_remove`, either confirmed or timed out
//!
//! ```text
//! lockup log ──insert──▶ ┌──────────────────────────────┐
//!                        │ PendingLockTable             │
//!                        │ HashMap<TxHash, Observation> │
//!   new head ──sweep───▶ └──────────────┬───────────────┘
//!                                       │ ConfirmationPolicy
//!                     ┌─────────────────┼─────────────────┐
//!                     ▼                 ▼                 ▼
//!                  Confirm            Drop              Wait
//!              (lock queue)       (timed out)      (stays pending)
//! ```

mod policy;

pub use policy::{ConfirmationPolicy, Decision};

use crate::types::{ChainLock, TxHash};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// A lockup together with the block height it was observed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingObservation {
    pub lock: ChainLock,
    pub height: u64,
}

/// Outcome of one sweep over the table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepResult {
    /// Lockups that reached confirmation depth, removed from the table.
    pub confirmed: Vec<ChainLock>,
    /// Number of lockups removed because they timed out.
    pub dropped: usize,
    /// Entries still waiting after the sweep.
    pub remaining: usize,
}

/// In-memory table of unconfirmed lockups keyed by transaction hash.
///
/// Every operation takes the single table lock for its whole duration and
/// never awaits anything else while holding it.
#[derive(Debug, Default)]
pub struct PendingLockTable {
    entries: Mutex<HashMap<TxHash, PendingObservation>>,
}

impl PendingLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a lockup observed at `height`, replacing any entry for the same
    /// hash. Returns true when an existing entry was replaced.
    pub async fn insert(&self, hash: TxHash, lock: ChainLock, height: u64) -> bool {
        let mut entries = self.entries.lock().await;
        let replaced = entries
            .insert(hash, PendingObservation { lock, height })
            .is_some();
        if replaced {
            debug!("Replaced pending lockup: tx={:?}, height={}", hash, height);
        }
        replaced
    }

    /// Applies `policy` at `current_height` to every entry and removes those
    /// that are confirmed or timed out.
    ///
    /// Confirmed lockups are returned by value; the order across hashes is
    /// unspecified.
    pub async fn sweep_and_remove(
        &self,
        current_height: u64,
        policy: &ConfirmationPolicy,
    ) -> SweepResult {
        let mut entries = self.entries.lock().await;
        let mut result = SweepResult::default();

        for (hash, pending) in std::mem::take(&mut *entries) {
            match policy.decide(pending.height, current_height) {
                Decision::Drop => {
                    debug!(
                        "Lockup timed out: tx={:?}, observed={}, head={}",
                        hash, pending.height, current_height
                    );
                    result.dropped += 1;
                }
                Decision::Confirm => {
                    debug!(
                        "Lockup confirmed: tx={:?}, observed={}, head={}",
                        hash, pending.height, current_height
                    );
                    result.confirmed.push(pending.lock);
                }
                Decision::Wait => {
                    entries.insert(hash, pending);
                }
            }
        }

        result.remaining = entries.len();
        result
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Height recorded for `hash`, if it is still pending.
    pub async fn observed_height(&self, hash: &TxHash) -> Option<u64> {
        self.entries.lock().await.get(hash).map(|p| p.height)
    }
}
