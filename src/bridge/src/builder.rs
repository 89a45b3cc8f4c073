// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Builds the VMs of a [`BridgeResources`] plan through a [`Bridge`].

use crate::{
    bridge::{Bridge, VcpuRef, VmRef},
    host::HostVirt,
    registry::RegistryError,
    resources::BridgeResources,
    utils::memory,
    vmm_config::machine_config::MachineConfig,
    vstate::vm::VmId,
    Error,
};
use std::mem;
use tracing::{info, warn};
use vm_memory::{mmap::MmapRegionError, GuestAddress, MmapRegion};

/// Errors associated with building the VMs of a plan.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Region size does not fit the host address space.
    #[error("Region at {1:#x} of {0} is too large for this host")]
    RegionTooLarge(VmId, u64),
    /// Failed to allocate backing memory.
    #[error("Failed to allocate memory for {0}: {1}")]
    Allocate(VmId, MmapRegionError),
    /// A lifecycle operation failed.
    #[error("Failed to build {0}: {1}")]
    Bridge(VmId, Error),
}

/// One VM of the plan and the host memory backing its guest regions.
#[derive(Debug)]
pub struct BuiltVm {
    vm: VmRef,
    vcpus: Vec<VcpuRef>,
    regions: Vec<(GuestAddress, MmapRegion)>,
}

impl BuiltVm {
    pub fn id(&self) -> VmId {
        self.vm.id()
    }

    pub fn vcpus(&self) -> &[VcpuRef] {
        &self.vcpus
    }

    pub fn regions(&self) -> impl Iterator<Item = (GuestAddress, &MmapRegion)> {
        self.regions.iter().map(|(gpa, region)| (*gpa, region))
    }

    // The host may still map this memory into a guest it failed to release.
    fn leak_regions(&mut self) {
        for (gpa, region) in self.regions.drain(..) {
            warn!(vmid = %self.vm.id(), gpa = gpa.0, size = region.size(), "leaking guest memory");
            mem::forget(region);
        }
    }
}

/// VMs built from a plan. Dropping it force-destroys them.
pub struct BuiltVms<'b, H: HostVirt> {
    bridge: &'b Bridge<H>,
    vms: Vec<BuiltVm>,
}

impl<'b, H: HostVirt> BuiltVms<'b, H> {
    pub fn vms(&self) -> &[BuiltVm] {
        &self.vms
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// Force-destroy every built VM, newest first, and release its memory.
    /// Returns the VMs whose teardown was not clean.
    pub fn teardown(mut self) -> Vec<(VmId, Error)> {
        self.release()
    }

    fn release(&mut self) -> Vec<(VmId, Error)> {
        let mut failed = Vec::new();
        while let Some(mut vm) = self.vms.pop() {
            match self.bridge.destroy_vm(vm.id(), true) {
                Ok(()) => {}
                Err(Error::Registry(RegistryError::VmNotFound(_))) => {
                    warn!(vmid = %vm.id(), "vm already destroyed");
                }
                Err(e) => {
                    vm.leak_regions();
                    failed.push((vm.id(), e));
                }
            }
        }
        failed
    }
}

impl<H: HostVirt> Drop for BuiltVms<'_, H> {
    fn drop(&mut self) {
        for (id, e) in self.release() {
            warn!(vmid = %id, error = %e, "teardown on drop failed");
        }
    }
}

/// Create, populate and map every VM of the plan, in order.
///
/// On the first failure every VM built so far is force-destroyed and the
/// error is returned.
pub fn build_vms<'b, H: HostVirt>(
    bridge: &'b Bridge<H>,
    resources: &BridgeResources,
) -> Result<BuiltVms<'b, H>, BuildError> {
    let mut built = BuiltVms {
        bridge,
        vms: Vec::with_capacity(resources.vms.len()),
    };
    for config in &resources.vms {
        built.vms.push(build_vm(bridge, config)?);
    }
    info!(vms = built.len(), "plan built");
    Ok(built)
}

fn build_vm<H: HostVirt>(
    bridge: &Bridge<H>,
    config: &MachineConfig,
) -> Result<BuiltVm, BuildError> {
    let id = config.vmid;
    let vm = bridge.create_vm(id).map_err(|e| BuildError::Bridge(id, e))?;
    let mut built = BuiltVm {
        vm,
        vcpus: Vec::new(),
        regions: Vec::new(),
    };

    if let Err(e) = populate(bridge, config, &mut built) {
        if let Err(teardown) = bridge.destroy_vm(id, true) {
            warn!(vmid = %id, error = %teardown, "rollback of partial vm failed");
            built.leak_regions();
        }
        return Err(e);
    }
    Ok(built)
}

fn populate<H: HostVirt>(
    bridge: &Bridge<H>,
    config: &MachineConfig,
    built: &mut BuiltVm,
) -> Result<(), BuildError> {
    let id = config.vmid;
    for _ in 0..config.vcpu_count {
        let vcpu = bridge
            .create_vcpu(id)
            .map_err(|e| BuildError::Bridge(id, e))?;
        built.vcpus.push(vcpu);
    }

    for region in &config.memory {
        let too_large = || BuildError::RegionTooLarge(id, region.guest_addr);
        let size = region.size().ok_or_else(too_large)?;
        let len = usize::try_from(size).map_err(|_| too_large())?;
        let mmap = memory::anonymous(len).map_err(|e| BuildError::Allocate(id, e))?;
        let gpa = GuestAddress(region.guest_addr);
        let hva = mmap.as_ptr() as u64;
        built.regions.push((gpa, mmap));

        // SAFETY: the region is owned by `built` and is only dropped after
        // the VM is destroyed, or leaked when the host fails to release it.
        unsafe { bridge.map_memory(id, gpa, hva, size, region.perms()) }
            .map_err(|e| BuildError::Bridge(id, e))?;
    }
    Ok(())
}
