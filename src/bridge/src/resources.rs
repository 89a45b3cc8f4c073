// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::vmm_config::bridge_config::BridgeConfig;
use crate::vmm_config::machine_config::{MachineConfig, VmConfigError};
use crate::vstate::vm::VmId;
use utils::errno;

/// Errors associated with actions on configuring bridge resources.
#[derive(Debug, thiserror::Error, derive_more::From)]
pub enum ResourcesError {
    /// JSON is invalid.
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),
    /// Vm vcpus or memory configuration error.
    #[error("VM config error: {0}")]
    VmConfig(VmConfigError),
    /// The same vmid appears twice in the plan.
    #[error("Duplicate vmid in plan: {0}")]
    #[from(ignore)]
    DuplicateVmId(VmId),
    /// Failed to query the host page size.
    #[error("Failed to get the page size: {0}")]
    PageSize(errno::Error),
}

fn host_page_size() -> Result<u64, errno::Error> {
    // SAFETY: sysconf only reads a configuration value.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => Err(errno::Error::last()),
        ps => Ok(ps as u64),
    }
}

/// Used for configuring the bridge from json.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BridgeResourcesConfig {
    #[serde(rename = "bridge-config", default)]
    bridge_config: BridgeConfig,
    #[serde(rename = "vms")]
    vms: Vec<MachineConfig>,
}

/// A validated plan: bridge settings plus the VMs to build.
#[derive(Debug, Default, Clone)]
pub struct BridgeResources {
    pub bridge_config: BridgeConfig,
    pub vms: Vec<MachineConfig>,
}

impl BridgeResources {
    pub fn from_json(config_json: &str) -> std::result::Result<Self, ResourcesError> {
        let config: BridgeResourcesConfig = serde_json::from_str(config_json)?;
        let page_size = host_page_size()?;
        let mut resources: Self = Default::default();

        resources.bridge_config = config.bridge_config;
        let mut seen = HashSet::new();
        for vm in config.vms {
            if !seen.insert(vm.vmid) {
                return Err(ResourcesError::DuplicateVmId(vm.vmid));
            }
            vm.validate(page_size)?;
            resources.vms.push(vm);
        }
        Ok(resources)
    }
}
