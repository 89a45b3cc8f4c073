// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{HostError, HostInfo, HostOp, HostVirt};
use crate::vstate::{memory::MemoryMapping, vcpu::VcpuId};
use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use std::collections::BTreeMap;
use std::os::unix::io::AsRawFd;
use vm_memory::{Address, GuestAddress};

fn kvm_error(op: HostOp, err: kvm_ioctls::Error) -> HostError {
    // kvm-ioctls may link another vmm-sys-util than ours, so only the raw
    // errno crosses over.
    HostError::from_code(op, err.errno())
}

/// A memory slot installed with KVM_SET_USER_MEMORY_REGION.
#[derive(Debug, Clone, Copy)]
struct KvmSlot {
    slot: u32,
    size: u64,
}

/// KVM VM handle: the VM file descriptor plus the memory slots it uses.
///
/// The fd is closed when the handle is dropped, which is how KVM releases
/// the VM and every VCPU ever created in it.
#[derive(Debug)]
pub struct KvmVm {
    fd: VmFd,
    slots: BTreeMap<u64, KvmSlot>,
    /// KVM vcpu index for the next `KVM_CREATE_VCPU`. KVM only frees a
    /// VCPU with its VM, so indices are never handed out twice.
    next_vcpu_index: u32,
}

impl KvmVm {
    fn free_slot(&self, max_slots: u32) -> Option<u32> {
        (0..max_slots).find(|slot| !self.slots.values().any(|s| s.slot == *slot))
    }
}

/// KVM VCPU handle. `index` is KVM's vcpu id, `id` the bridge's.
#[derive(Debug)]
pub struct KvmVcpu {
    id: VcpuId,
    index: u32,
    fd: VcpuFd,
}

/// Host backend issuing KVM ioctls through `/dev/kvm`.
pub struct KvmHost {
    kvm: Kvm,
    info: HostInfo,
}

impl KvmHost {
    /// Open `/dev/kvm` and query the per-VM limits.
    pub fn new() -> Result<Self, HostError> {
        /* Kvm::new() opens /dev/kvm; every VM below is created from it
         * with ioctl(kvm_fd, KVM_CREATE_VM, 0).
         */
        let kvm = Kvm::new().map_err(|e| kvm_error(HostOp::Open, e))?;
        let info = HostInfo {
            max_vcpus: u32::try_from(kvm.get_max_vcpus()).unwrap_or(u32::MAX),
            max_mappings: u32::try_from(kvm.get_nr_memslots()).unwrap_or(u32::MAX),
        };
        Ok(KvmHost { kvm, info })
    }
}

impl HostVirt for KvmHost {
    type Vm = KvmVm;
    type Vcpu = KvmVcpu;

    fn system_info(&self) -> HostInfo {
        self.info
    }

    fn create_vm(&self) -> Result<KvmVm, HostError> {
        let fd = self
            .kvm
            .create_vm()
            .map_err(|e| kvm_error(HostOp::CreateVm, e))?;
        Ok(KvmVm {
            fd,
            slots: BTreeMap::new(),
            next_vcpu_index: 0,
        })
    }

    fn destroy_vm(&self, vm: KvmVm) -> Result<(), HostError> {
        drop(vm);
        Ok(())
    }

    fn create_vcpu(&self, vm: &mut KvmVm, id: VcpuId) -> Result<KvmVcpu, HostError> {
        // Destroyed VCPUs keep their slot in KVM until the VM goes away.
        let index = vm.next_vcpu_index;
        if index >= self.info.max_vcpus {
            return Err(HostError::from_code(HostOp::CreateVcpu, libc::ENOSPC));
        }
        /* > ioctl(vmfd, KVM_CREATE_VCPU, index) */
        let fd = vm
            .fd
            .create_vcpu(u64::from(index))
            .map_err(|e| kvm_error(HostOp::CreateVcpu, e))?;
        vm.next_vcpu_index += 1;
        Ok(KvmVcpu { id, index, fd })
    }

    fn destroy_vcpu(&self, _vm: &KvmVm, vcpu: KvmVcpu) -> Result<(), HostError> {
        // Closing the fd is all userspace can do; KVM reclaims the VCPU
        // with the VM.
        tracing::debug!(
            vcpu = %vcpu.id,
            index = vcpu.index,
            fd = vcpu.fd.as_raw_fd(),
            "kvm vcpu fd closed"
        );
        drop(vcpu);
        Ok(())
    }

    unsafe fn map_memory(&self, vm: &mut KvmVm, mapping: &MemoryMapping) -> Result<(), HostError> {
        let slot = vm
            .free_slot(self.info.max_mappings)
            .ok_or_else(|| HostError::from_code(HostOp::MapMemory, libc::ENOSPC))?;
        // KVM has no execute-only or write-only slots; dropping write is the
        // one restriction it can express.
        let flags = if mapping.perms().write {
            0
        } else {
            KVM_MEM_READONLY
        };
        let region = kvm_userspace_memory_region {
            slot,
            flags,
            guest_phys_addr: mapping.gpa().raw_value(),
            memory_size: mapping.size(),
            userspace_addr: mapping.hva(),
        };
        // SAFETY: the caller guarantees the host range outlives the mapping.
        unsafe { vm.fd.set_user_memory_region(region) }
            .map_err(|e| kvm_error(HostOp::MapMemory, e))?;
        vm.slots.insert(
            mapping.gpa().raw_value(),
            KvmSlot {
                slot,
                size: mapping.size(),
            },
        );
        Ok(())
    }

    fn unmap_memory(&self, vm: &mut KvmVm, gpa: GuestAddress, size: u64) -> Result<(), HostError> {
        let slot = match vm.slots.get(&gpa.raw_value()) {
            Some(slot) if slot.size == size => *slot,
            _ => return Err(HostError::from_code(HostOp::UnmapMemory, libc::EINVAL)),
        };
        /* A zero-sized region deletes the slot. */
        let region = kvm_userspace_memory_region {
            slot: slot.slot,
            flags: 0,
            guest_phys_addr: gpa.raw_value(),
            memory_size: 0,
            userspace_addr: 0,
        };
        // SAFETY: deleting a slot hands no new host memory to the guest.
        unsafe { vm.fd.set_user_memory_region(region) }
            .map_err(|e| kvm_error(HostOp::UnmapMemory, e))?;
        vm.slots.remove(&gpa.raw_value());
        Ok(())
    }
}
