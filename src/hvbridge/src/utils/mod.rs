// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use bridge::builder::{build_vms, BuildError};
use bridge::host::{kvm::KvmHost, mock::MockHost};
use bridge::resources::{BridgeResources, ResourcesError};
use bridge::{Bridge, HostError, HostVirt, VmId};
use clap::ValueEnum;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// The kernel's KVM API through /dev/kvm.
    Kvm,
    /// In-memory host, for dry runs of a plan.
    Mock,
}

#[derive(Debug, thiserror::Error)]
pub enum UtilsError {
    /// Failed to create BridgeResources.
    #[error("Failed to create BridgeResources: {0}")]
    CreateResources(#[from] ResourcesError),
    /// Failed to open the host backend.
    #[error("Failed to open host backend: {0}")]
    OpenHost(#[from] HostError),
    /// Failed to build the VMs of the plan.
    #[error("Failed to build virtual machines: {0}")]
    BuildVms(#[from] BuildError),
    /// Some VMs were not released cleanly.
    #[error("Teardown left host objects behind for {0:?}")]
    Teardown(Vec<VmId>),
}

/// Build every VM of the plan on the chosen backend, report them and tear
/// them down again.
pub fn run_plan(config: &str, backend: Backend) -> Result<(), UtilsError> {
    let resources = BridgeResources::from_json(config)?;
    match backend {
        Backend::Kvm => run_on(KvmHost::new()?, &resources),
        Backend::Mock => run_on(MockHost::new(), &resources),
    }
}

fn run_on<H: HostVirt>(host: H, resources: &BridgeResources) -> Result<(), UtilsError> {
    let bridge = Bridge::new(host, resources.bridge_config);
    let built = build_vms(&bridge, resources)?;

    for vm in built.vms() {
        let mappings = bridge.mappings(vm.id()).unwrap_or_default();
        let memory: u64 = mappings.iter().map(|m| m.size()).sum();
        info!(
            vmid = %vm.id(),
            vcpus = vm.vcpus().len(),
            mappings = mappings.len(),
            memory,
            "vm ready"
        );
        println!(
            "{}: {} vcpu(s), {} mapping(s), {} MiB",
            vm.id(),
            vm.vcpus().len(),
            mappings.len(),
            memory >> 20
        );
    }

    let failed = built.teardown();
    if failed.is_empty() {
        return Ok(());
    }
    for (id, e) in &failed {
        error!(vmid = %id, error = %e, "teardown failed");
    }
    Err(UtilsError::Teardown(
        failed.into_iter().map(|(id, _)| id).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_plan_on_mock() {
        let config = r#"{
            "vms": [
                { "vmid": 1, "vcpu_count": 2,
                  "memory": [ { "guest_addr": 0, "size_mib": 4 } ] },
                { "vmid": 2, "vcpu_count": 1 }
            ]
        }"#;
        run_plan(config, Backend::Mock).unwrap();
    }

    #[test]
    fn test_run_plan_errors() {
        match run_plan("{", Backend::Mock) {
            Err(UtilsError::CreateResources(_)) => (),
            _ => unreachable!(),
        }

        // More vcpus than the mock host supports.
        let config = r#"{ "vms": [ { "vmid": 1, "vcpu_count": 64 } ] }"#;
        match run_plan(config, Backend::Mock) {
            Err(UtilsError::BuildVms(BuildError::Bridge(VmId(1), _))) => (),
            _ => unreachable!(),
        }
    }
}
