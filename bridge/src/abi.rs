// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bindings for the subset of the bridge contract the watcher reads.

#![allow(clippy::too_many_arguments)]

use ethers::contract::abigen;

abigen!(
    BridgeContract,
    r#"[
        struct GuardianSetInfo { address[] keys; uint32 expiration_time; }
        event LogTokensLocked(uint8 target_chain, uint8 token_chain, bytes32 indexed token, bytes32 indexed sender, bytes32 recipient, uint256 amount)
        event LogGuardianSetChanged(uint32 oldGuardianIndex, uint32 newGuardianIndex)
        function guardian_set_index() external view returns (uint32)
        function getGuardianSet(uint32 idx) external view returns (GuardianSetInfo memory)
    ]"#,
);
