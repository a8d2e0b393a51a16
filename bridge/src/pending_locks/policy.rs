// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block-counting confirmation rule for pending lockups.

/// What to do with a pending lockup at the current head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not confirmed within the timeout window; assumed orphaned by a reorg.
    Drop,
    /// Deep enough to be treated as final.
    Confirm,
    /// Keep waiting for more blocks.
    Wait,
}

/// Decides confirmation and timeout of lockups by block depth.
///
/// A lockup observed at height `h` is confirmed once the head reaches
/// `h + min_confirmations`, and dropped once the head reaches
/// `h + TIMEOUT_MULTIPLIER * min_confirmations`. The timeout check runs first,
/// so with zero confirmations every lockup is dropped on its first sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    min_confirmations: u64,
}

impl ConfirmationPolicy {
    pub const TIMEOUT_MULTIPLIER: u64 = 4;

    pub fn new(min_confirmations: u64) -> Self {
        Self { min_confirmations }
    }

    pub fn min_confirmations(&self) -> u64 {
        self.min_confirmations
    }

    /// Head height at which a lockup observed at `observed_height` is confirmed.
    pub fn confirmation_height(&self, observed_height: u64) -> u64 {
        observed_height.saturating_add(self.min_confirmations)
    }

    /// Head height at which a lockup observed at `observed_height` times out.
    pub fn timeout_height(&self, observed_height: u64) -> u64 {
        observed_height
            .saturating_add(self.min_confirmations.saturating_mul(Self::TIMEOUT_MULTIPLIER))
    }

    pub fn decide(&self, observed_height: u64, current_height: u64) -> Decision {
        if current_height >= self.timeout_height(observed_height) {
            Decision::Drop
        } else if current_height >= self.confirmation_height(observed_height) {
            Decision::Confirm
        } else {
            Decision::Wait
        }
    }
}
