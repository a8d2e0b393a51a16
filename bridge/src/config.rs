// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{WatcherError, WatcherResult};
use crate::supervisor::RestartPolicy;
use crate::watcher::{WatcherOptions, DEFAULT_EVENT_BUFFER};
use bridge_config::Config;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

fn default_query_timeout_secs() -> u64 {
    15
}

fn default_subscription_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_output_buffer() -> usize {
    16
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatcherConfig {
    /// WebSocket endpoint of the Ethereum node.
    pub eth_rpc_url: String,
    /// Hex address of the bridge contract whose events are watched.
    pub bridge_address: String,
    pub min_confirmations: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Capacity of the per-loop event queues.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
    /// Capacity of the lock and guardian set output queues.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Serves /health and /metrics when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_address: Option<SocketAddr>,
    #[serde(default)]
    pub restart: RestartConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RestartConfig {
    pub initial_interval_ms: u64,
    pub max_interval_secs: u64,
    pub multiplier: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1000,
            max_interval_secs: 60,
            multiplier: 2.0,
        }
    }
}

impl Config for WatcherConfig {}

/// Validated, typed form of [`WatcherConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherSettings {
    pub eth_rpc_url: String,
    pub bridge_address: EthAddress,
    pub watcher: WatcherOptions,
    pub output_buffer: usize,
    pub metrics_address: Option<SocketAddr>,
    pub restart: RestartPolicy,
}

impl WatcherConfig {
    pub fn validate(&self) -> WatcherResult<WatcherSettings> {
        info!("Starting config validation");
        if !(self.eth_rpc_url.starts_with("ws://") || self.eth_rpc_url.starts_with("wss://")) {
            return Err(WatcherError::Config(format!(
                "eth-rpc-url must be a ws:// or wss:// endpoint, got {}",
                self.eth_rpc_url
            )));
        }
        let bridge_address = EthAddress::from_str(&self.bridge_address).map_err(|e| {
            WatcherError::Config(format!(
                "invalid bridge-address {}: {}",
                self.bridge_address, e
            ))
        })?;
        if self.query_timeout_secs == 0 {
            return Err(WatcherError::Config(
                "query-timeout-secs must be positive".to_string(),
            ));
        }
        if self.subscription_buffer == 0 || self.output_buffer == 0 {
            return Err(WatcherError::Config(
                "subscription-buffer and output-buffer must be positive".to_string(),
            ));
        }
        if self.restart.initial_interval_ms == 0 || self.restart.multiplier < 1.0 {
            return Err(WatcherError::Config(
                "restart needs a positive initial-interval-ms and a multiplier of at least 1"
                    .to_string(),
            ));
        }
        if self.min_confirmations == 0 {
            warn!("min-confirmations is 0: every lockup times out on its first sweep");
        }

        let mut watcher = WatcherOptions::new(self.min_confirmations);
        watcher.query_timeout = Duration::from_secs(self.query_timeout_secs);
        watcher.event_buffer = self.subscription_buffer;

        let initial_interval = Duration::from_millis(self.restart.initial_interval_ms);
        let restart = RestartPolicy {
            initial_interval,
            max_interval: Duration::from_secs(self.restart.max_interval_secs)
                .max(initial_interval),
            multiplier: self.restart.multiplier,
            ..Default::default()
        };

        info!("Config validation complete");
        Ok(WatcherSettings {
            eth_rpc_url: self.eth_rpc_url.clone(),
            bridge_address,
            watcher,
            output_buffer: self.output_buffer,
            metrics_address: self.metrics_address,
            restart,
        })
    }
}
