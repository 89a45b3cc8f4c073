// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The lifecycle facade.
//!
//! Each operation runs registry check, host call, registry commit (or
//! rollback) while holding the target VM's lock, so callers see either the
//! whole operation or none of it. Operations on different VMs proceed in
//! parallel.

use crate::{
    host::{HostInfo, HostVirt},
    registry::{Registry, RegistryError, VmGuard},
    vmm_config::bridge_config::BridgeConfig,
    vstate::{
        memory::{guest_range_end, MemoryMapping, MemoryPermissions},
        vcpu::{VcpuEntry, VcpuId},
        vm::{VmId, VmState},
    },
    Error, TeardownFailure, TeardownReport,
};
use tracing::{debug, info, warn};
use vm_memory::{Address, GuestAddress};

/// A live VM created through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmRef {
    id: VmId,
}

impl VmRef {
    pub fn id(&self) -> VmId {
        self.id
    }
}

/// A live VCPU created through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuRef {
    vm: VmId,
    id: VcpuId,
}

impl VcpuRef {
    pub fn vm(&self) -> VmId {
        self.vm
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }
}

pub struct Bridge<H: HostVirt> {
    host: H,
    registry: Registry<H>,
    info: HostInfo,
    vcpu_limit: u32,
}

impl<H: HostVirt> Bridge<H> {
    pub fn new(host: H, config: BridgeConfig) -> Self {
        let info = host.system_info();
        let vcpu_limit = config
            .max_vcpus
            .map_or(info.max_vcpus, |max| max.min(info.max_vcpus));
        info!(
            max_vcpus = vcpu_limit,
            max_mappings = info.max_mappings,
            exclusive_host_memory = config.exclusive_host_memory,
            "bridge ready"
        );
        Bridge {
            host,
            registry: Registry::new(config.exclusive_host_memory),
            info,
            vcpu_limit,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_info(&self) -> HostInfo {
        self.info
    }

    /// VCPUs allowed per VM: the host limit, or the configured cap if lower.
    pub fn vcpu_limit(&self) -> u32 {
        self.vcpu_limit
    }

    pub fn create_vm(&self, id: VmId) -> Result<VmRef, Error> {
        let mut vm = self.registry.register_vm(id)?;
        match self.host.create_vm() {
            Ok(handle) => {
                vm.attach(handle)?;
                info!(vmid = %id, "vm created");
                Ok(VmRef { id })
            }
            Err(e) => {
                warn!(vmid = %id, error = %e, "host refused vm, rolling back");
                self.registry.discard_vm(&mut vm)?;
                Err(e.into())
            }
        }
    }

    /// Destroy a VM.
    ///
    /// Without `force` the VM must own no VCPUs or mappings, and a host
    /// failure comes back as [`Error::Host`]. With `force` its children are
    /// released first; host failures along the way do not stop the teardown
    /// and are returned together as [`Error::Teardown`] once the VM itself
    /// is gone.
    ///
    /// Host ranges the host did not let go of stay claimed.
    pub fn destroy_vm(&self, id: VmId, force: bool) -> Result<(), Error> {
        let mut vm = self.registry.lock_vm(id)?;
        if !force && vm.has_children() {
            return Err(Error::ResourceBusy {
                vm: id,
                vcpus: vm.vcpu_count(),
                mappings: vm.mapping_count(),
            });
        }
        debug!(vmid = %id, force, "destroying vm");

        let children = self.registry.unregister_vm(&mut vm)?;
        let mut handle = vm.take_host_handle()?;
        let mut report = TeardownReport::new(id);

        for vcpu in children.vcpus {
            let vcpu_id = vcpu.id();
            if let Err(e) = self.host.destroy_vcpu(&handle, vcpu.into_handle()) {
                warn!(vmid = %id, vcpu = %vcpu_id, error = %e, "vcpu leaked during teardown");
                report.failures.push(TeardownFailure::Vcpu(vcpu_id, e));
            }
        }
        for mapping in children.mappings {
            if let Err(e) = self
                .host
                .unmap_memory(&mut handle, mapping.gpa(), mapping.size())
            {
                warn!(
                    vmid = %id,
                    gpa = mapping.gpa().raw_value(),
                    size = mapping.size(),
                    error = %e,
                    "mapping leaked during teardown"
                );
                report.failures.push(TeardownFailure::Mapping {
                    gpa: mapping.gpa(),
                    size: mapping.size(),
                    error: e,
                });
            } else {
                self.registry.release_host_memory(id, &mapping);
            }
        }
        let destroyed = self.host.destroy_vm(handle);
        vm.set_state(VmState::Destroyed)?;
        match destroyed {
            // Anything still mapped went away with the host VM.
            Ok(()) => self.registry.release_vm_host_memory(id),
            Err(e) if !force => {
                warn!(vmid = %id, error = %e, "vm leaked");
                return Err(e.into());
            }
            Err(e) => {
                warn!(vmid = %id, error = %e, "vm leaked during teardown");
                report.failures.push(TeardownFailure::Vm(e));
            }
        }

        if report.is_clean() {
            info!(vmid = %id, "vm destroyed");
            Ok(())
        } else {
            Err(Error::Teardown(report))
        }
    }

    pub fn create_vcpu(&self, vm_id: VmId) -> Result<VcpuRef, Error> {
        let mut vm = self.registry.lock_vm(vm_id)?;
        let id = vm.next_vcpu_id(self.vcpu_limit)?;

        let handle = self
            .host
            .create_vcpu(vm.host_handle_mut()?, id)
            .map_err(|e| {
                warn!(vmid = %vm_id, vcpu = %id, error = %e, "host refused vcpu");
                e
            })?;
        let vcpu = VcpuEntry::new(id, handle);
        if let Err(e) = vm.check_vcpu(id, self.vcpu_limit) {
            self.rollback_vcpu(&vm, vcpu);
            return Err(e.into());
        }
        vm.insert_vcpu(vcpu);
        info!(vmid = %vm_id, vcpu = %id, "vcpu created");
        Ok(VcpuRef { vm: vm_id, id })
    }

    fn rollback_vcpu(&self, vm: &VmGuard<H>, vcpu: VcpuEntry<H>) {
        let id = vcpu.id();
        let released = vm
            .host_handle()
            .map_err(Error::from)
            .and_then(|handle| Ok(self.host.destroy_vcpu(handle, vcpu.into_handle())?));
        if let Err(e) = released {
            warn!(vmid = %vm.id(), vcpu = %id, error = %e, "vcpu leaked during rollback");
        }
    }

    pub fn destroy_vcpu(&self, vm_id: VmId, id: VcpuId) -> Result<(), Error> {
        let mut vm = self.registry.lock_vm(vm_id)?;
        let vcpu = vm.unregister_vcpu(id)?;
        if let Err(e) = self.host.destroy_vcpu(vm.host_handle()?, vcpu.into_handle()) {
            // The entry stays gone: the host is the authority now and a
            // retry is the caller's call.
            warn!(vmid = %vm_id, vcpu = %id, error = %e, "vcpu leaked");
            return Err(e.into());
        }
        info!(vmid = %vm_id, vcpu = %id, "vcpu destroyed");
        Ok(())
    }

    /// Map `[gpa, gpa + size)` of the VM onto `[hva, hva + size)`.
    ///
    /// The range must be non-empty and disjoint from the VM's existing
    /// mappings; both are checked before the host is called.
    ///
    /// # Safety
    ///
    /// `[hva, hva + size)` must be memory of this process that stays mapped
    /// until the range is unmapped or the VM is destroyed. The guest may
    /// read and write it at any time in between.
    pub unsafe fn map_memory(
        &self,
        vm_id: VmId,
        gpa: GuestAddress,
        hva: u64,
        size: u64,
        perms: MemoryPermissions,
    ) -> Result<(), Error> {
        let mapping = MemoryMapping::new(gpa, hva, size, perms)?;
        let mut vm = self.registry.lock_vm(vm_id)?;
        vm.check_mapping(&mapping, self.info.max_mappings)?;
        self.registry.claim_host_memory(vm_id, &mapping)?;

        let mapped = match vm.host_handle_mut() {
            // SAFETY: the caller upholds the host range contract.
            Ok(handle) => unsafe { self.host.map_memory(handle, &mapping) }.map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = mapped {
            warn!(
                vmid = %vm_id,
                gpa = gpa.raw_value(),
                size,
                error = %e,
                "map failed, rolling back"
            );
            self.registry.release_host_memory(vm_id, &mapping);
            return Err(e);
        }
        if let Err(e) = vm.check_mapping(&mapping, self.info.max_mappings) {
            self.rollback_mapping(&mut vm, &mapping);
            return Err(e.into());
        }
        vm.insert_mapping(mapping);
        info!(vmid = %vm_id, gpa = gpa.raw_value(), hva, size, "memory mapped");
        Ok(())
    }

    fn rollback_mapping(&self, vm: &mut VmGuard<H>, mapping: &MemoryMapping) {
        let vm_id = vm.id();
        let released = vm.host_handle_mut().map_err(Error::from).and_then(|handle| {
            Ok(self
                .host
                .unmap_memory(handle, mapping.gpa(), mapping.size())?)
        });
        match released {
            Ok(()) => self.registry.release_host_memory(vm_id, mapping),
            Err(e) => warn!(
                vmid = %vm_id,
                gpa = mapping.gpa().raw_value(),
                error = %e,
                "mapping leaked during rollback"
            ),
        }
    }

    /// Unmap a range previously passed to [`Bridge::map_memory`], exactly.
    ///
    /// If the host fails to unmap, the registry forgets the mapping but its
    /// host range stays claimed until the VM is destroyed.
    pub fn unmap_memory(&self, vm_id: VmId, gpa: GuestAddress, size: u64) -> Result<(), Error> {
        guest_range_end(gpa, size)?;
        let mut vm = self.registry.lock_vm(vm_id)?;
        let mapping = vm.unregister_mapping(gpa, size)?;
        if let Err(e) = self.host.unmap_memory(vm.host_handle_mut()?, gpa, size) {
            warn!(vmid = %vm_id, gpa = gpa.raw_value(), size, error = %e, "mapping leaked");
            return Err(e.into());
        }
        self.registry.release_host_memory(vm_id, &mapping);
        info!(vmid = %vm_id, gpa = gpa.raw_value(), size, "memory unmapped");
        Ok(())
    }

    /// Current state of a VM. Unknown or destroyed VMs are `NotFound`.
    pub fn vm_state(&self, id: VmId) -> Result<VmState, Error> {
        Ok(self.registry.vm_state(id)?)
    }

    /// VCPUs of a live VM, in id order.
    pub fn vcpus(&self, id: VmId) -> Result<Vec<VcpuId>, Error> {
        Ok(self.lock(id)?.vcpu_ids())
    }

    /// Mappings of a live VM, in guest address order.
    pub fn mappings(&self, id: VmId) -> Result<Vec<MemoryMapping>, Error> {
        Ok(self.lock(id)?.mappings())
    }

    pub fn live_vms(&self) -> Vec<VmId> {
        self.registry.vm_ids()
    }

    /// Force-destroy every VM. Returns the VMs whose teardown reported
    /// errors.
    pub fn shutdown(&self) -> Vec<(VmId, Error)> {
        let mut failed = Vec::new();
        for id in self.registry.vm_ids() {
            match self.destroy_vm(id, true) {
                Ok(()) => {}
                // Destroyed concurrently.
                Err(Error::Registry(RegistryError::VmNotFound(_))) => {}
                Err(e) => failed.push((id, e)),
            }
        }
        failed
    }

    fn lock(&self, id: VmId) -> Result<VmGuard<H>, Error> {
        Ok(self.registry.lock_vm(id)?)
    }
}
