// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Bridge-wide settings, the `bridge-config` part of a plan.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Refuse to back two different VMs with overlapping host memory.
    pub exclusive_host_memory: bool,
    /// Cap on VCPUs per VM, below what the host allows.
    pub max_vcpus: Option<u32>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            exclusive_host_memory: true,
            max_vcpus: None,
        }
    }
}
