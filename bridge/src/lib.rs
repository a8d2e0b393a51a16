// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::new_without_default)]

pub mod abi;
pub mod config;
pub mod connector;
pub mod error;
pub mod guardian_set;
pub mod health;
pub mod metrics;
pub mod multiplexer;
pub mod node;
pub mod pending_locks;
pub mod server;
pub mod supervisor;
pub mod types;
pub mod utils;
pub mod watcher;

#[cfg(test)]
pub mod test_utils;
