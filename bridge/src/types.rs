// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Values observed on the source chain and handed to the signing pipeline.

use ethers::types::{Address as EthAddress, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction hash identifying an observed lockup.
pub type TxHash = H256;

/// Address on any chain the bridge connects, left-padded to 32 bytes.
pub type ChainAddress = H256;

/// One-byte chain identifier as used in bridge messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u8);

impl ChainId {
    pub const SOLANA: ChainId = ChainId(1);
    pub const ETHEREUM: ChainId = ChainId(2);
}

impl From<u8> for ChainId {
    fn from(v: u8) -> Self {
        ChainId(v)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChainId::SOLANA => write!(f, "solana"),
            ChainId::ETHEREUM => write!(f, "ethereum"),
            ChainId(other) => write!(f, "chain-{}", other),
        }
    }
}

/// A lockup of tokens on the source chain, to be released on the target chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLock {
    pub tx_hash: TxHash,
    pub source_chain: ChainId,
    pub source_address: ChainAddress,
    pub target_chain: ChainId,
    pub target_address: ChainAddress,
    pub token_chain: ChainId,
    pub token_address: ChainAddress,
    pub amount: U256,
}

/// Snapshot of the guardian set at a given index.
///
/// Key order is significant and preserved exactly as returned by the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianSet {
    pub keys: Vec<EthAddress>,
    pub index: u32,
}

impl GuardianSet {
    pub fn new(keys: Vec<EthAddress>, index: u32) -> Self {
        Self { keys, index }
    }
}

/// Decoded token lockup log together with its position on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEvent {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub sender: ChainAddress,
    pub recipient: ChainAddress,
    pub target_chain: ChainId,
    pub token_chain: ChainId,
    pub token: ChainAddress,
    pub amount: U256,
}

impl LockEvent {
    /// Builds the lock as seen from `source_chain`, the chain being watched.
    pub fn into_chain_lock(self, source_chain: ChainId) -> ChainLock {
        ChainLock {
            tx_hash: self.tx_hash,
            source_chain,
            source_address: self.sender,
            target_chain: self.target_chain,
            target_address: self.recipient,
            token_chain: self.token_chain,
            token_address: self.token,
            amount: self.amount,
        }
    }
}

/// The bridge contract switched to a new guardian set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardianSetChangedEvent {
    pub old_index: u32,
    pub new_index: u32,
}

/// A new block head on the source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewHead {
    pub number: u64,
}
