// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory host backend.
//!
//! `MockHost` keeps count of the VMs, VCPUs and mappings it believes are
//! alive and can be told to fail a given call, once or until cleared. A
//! failed destroy or unmap leaves the object counted as live, which is how a
//! real host behaves when it refuses to release something.

use super::{HostError, HostInfo, HostOp, HostVirt};
use crate::vstate::{memory::MemoryMapping, vcpu::VcpuId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use vm_memory::{Address, GuestAddress};

pub const DEFAULT_MAX_VCPUS: u32 = 8;
pub const DEFAULT_MAX_MAPPINGS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Once,
    Always,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    live_vms: usize,
    live_vcpus: usize,
    live_mappings: usize,
    failures: HashMap<HostOp, Failure>,
    calls: HashMap<HostOp, usize>,
}

impl MockState {
    fn enter(&mut self, op: HostOp) -> Result<(), HostError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get(&op).copied() {
            Some(Failure::Once) => {
                self.failures.remove(&op);
                Err(HostError::from_code(op, libc::EIO))
            }
            Some(Failure::Always) => Err(HostError::from_code(op, libc::EIO)),
            None => Ok(()),
        }
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[derive(Debug)]
pub struct MockVm {
    handle: u64,
    mappings: BTreeMap<u64, u64>,
}

#[derive(Debug)]
pub struct MockVcpu {
    handle: u64,
    vm: u64,
    id: VcpuId,
}

pub struct MockHost {
    info: HostInfo,
    state: Mutex<MockState>,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost::with_info(HostInfo {
            max_vcpus: DEFAULT_MAX_VCPUS,
            max_mappings: DEFAULT_MAX_MAPPINGS,
        })
    }

    pub fn with_info(info: HostInfo) -> Self {
        MockHost {
            info,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make the next call of `op` fail.
    pub fn fail_once(&self, op: HostOp) {
        self.state.lock().failures.insert(op, Failure::Once);
    }

    /// Make every call of `op` fail until [`MockHost::clear_failures`].
    pub fn fail_always(&self, op: HostOp) {
        self.state.lock().failures.insert(op, Failure::Always);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn live_vms(&self) -> usize {
        self.state.lock().live_vms
    }

    pub fn live_vcpus(&self) -> usize {
        self.state.lock().live_vcpus
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().live_mappings
    }

    /// Number of times `op` reached the host, failed attempts included.
    pub fn calls(&self, op: HostOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostVirt for MockHost {
    type Vm = MockVm;
    type Vcpu = MockVcpu;

    fn system_info(&self) -> HostInfo {
        self.info
    }

    fn create_vm(&self) -> Result<MockVm, HostError> {
        let mut state = self.state.lock();
        state.enter(HostOp::CreateVm)?;
        state.live_vms += 1;
        Ok(MockVm {
            handle: state.handle(),
            mappings: BTreeMap::new(),
        })
    }

    fn destroy_vm(&self, vm: MockVm) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.enter(HostOp::DestroyVm)?;
        // The host drops whatever is still mapped along with the VM.
        state.live_mappings -= vm.mappings.len();
        state.live_vms -= 1;
        Ok(())
    }

    fn create_vcpu(&self, vm: &mut MockVm, id: VcpuId) -> Result<MockVcpu, HostError> {
        let mut state = self.state.lock();
        state.enter(HostOp::CreateVcpu)?;
        state.live_vcpus += 1;
        Ok(MockVcpu {
            handle: state.handle(),
            vm: vm.handle,
            id,
        })
    }

    fn destroy_vcpu(&self, vm: &MockVm, vcpu: MockVcpu) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if vcpu.vm != vm.handle {
            return Err(HostError::from_code(HostOp::DestroyVcpu, libc::EBADF));
        }
        state.enter(HostOp::DestroyVcpu)?;
        state.live_vcpus -= 1;
        tracing::trace!(handle = vcpu.handle, vcpu = %vcpu.id, "mock vcpu released");
        Ok(())
    }

    unsafe fn map_memory(&self, vm: &mut MockVm, mapping: &MemoryMapping) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.enter(HostOp::MapMemory)?;
        vm.mappings
            .insert(mapping.gpa().raw_value(), mapping.size());
        state.live_mappings += 1;
        Ok(())
    }

    fn unmap_memory(&self, vm: &mut MockVm, gpa: GuestAddress, size: u64) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if vm.mappings.get(&gpa.raw_value()) != Some(&size) {
            return Err(HostError::from_code(HostOp::UnmapMemory, libc::EINVAL));
        }
        state.enter(HostOp::UnmapMemory)?;
        vm.mappings.remove(&gpa.raw_value());
        state.live_mappings -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vstate::memory::MemoryPermissions;

    #[test]
    fn test_fail_once() {
        let host = MockHost::new();
        host.fail_once(HostOp::CreateVm);

        let err = host.create_vm().unwrap_err();
        assert_eq!(err.op, HostOp::CreateVm);
        assert_eq!(err.errno.errno(), libc::EIO);
        assert_eq!(host.live_vms(), 0);

        let vm = host.create_vm().unwrap();
        assert_eq!(host.live_vms(), 1);
        assert_eq!(host.calls(HostOp::CreateVm), 2);
        host.destroy_vm(vm).unwrap();
        assert_eq!(host.live_vms(), 0);
    }

    #[test]
    fn test_fail_always() {
        let host = MockHost::new();
        let mut vm = host.create_vm().unwrap();
        host.fail_always(HostOp::CreateVcpu);
        assert!(host.create_vcpu(&mut vm, VcpuId(0)).is_err());
        assert!(host.create_vcpu(&mut vm, VcpuId(0)).is_err());

        host.clear_failures();
        let vcpu = host.create_vcpu(&mut vm, VcpuId(0)).unwrap();
        assert_eq!(host.live_vcpus(), 1);
        host.destroy_vcpu(&vm, vcpu).unwrap();
        assert_eq!(host.live_vcpus(), 0);
    }

    #[test]
    fn test_destroy_vm_drops_mappings() {
        let host = MockHost::new();
        let mut vm = host.create_vm().unwrap();
        let mapping =
            MemoryMapping::new(GuestAddress(0x1000), 0x7000_0000, 0x1000, MemoryPermissions::RW)
                .unwrap();
        unsafe { host.map_memory(&mut vm, &mapping).unwrap() };
        assert_eq!(host.live_mappings(), 1);

        host.destroy_vm(vm).unwrap();
        assert_eq!(host.live_mappings(), 0);
    }
}
