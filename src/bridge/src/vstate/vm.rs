// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    host::HostVirt,
    registry::{OwnedChildren, RegistryError},
    vstate::{
        memory::{guest_range_end, MemoryMapping},
        vcpu::{VcpuEntry, VcpuId},
    },
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vm_memory::{Address, GuestAddress};

/// Caller-chosen VM identifier, unique among live VMs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display(fmt = "vm-{}", _0)]
#[serde(transparent)]
pub struct VmId(pub u32);

/// Lifecycle of a VM entry.
///
/// `Uninitialized -> Live -> Destroying -> Destroyed`, plus
/// `Uninitialized -> Destroyed` when the host refuses to create the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum VmState {
    Uninitialized,
    Live,
    Destroying,
    Destroyed,
}

impl VmState {
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Uninitialized, Live)
                | (Uninitialized, Destroyed)
                | (Live, Destroying)
                | (Destroying, Destroyed)
        )
    }
}

/// Registry record of one VM: its host handle and the index of everything
/// it owns.
///
/// Children are kept as id-keyed maps rather than references, so tearing a
/// VM down is just draining them.
pub struct VmEntry<H: HostVirt> {
    id: VmId,
    state: VmState,
    handle: Option<H::Vm>,
    vcpus: BTreeMap<VcpuId, VcpuEntry<H>>,
    /// Keyed by guest base address; ranges never overlap.
    mappings: BTreeMap<u64, MemoryMapping>,
}

impl<H: HostVirt> VmEntry<H> {
    pub fn new(id: VmId) -> Self {
        VmEntry {
            id,
            state: VmState::Uninitialized,
            handle: None,
            vcpus: BTreeMap::new(),
            mappings: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == VmState::Live
    }

    pub fn set_state(&mut self, next: VmState) -> Result<(), RegistryError> {
        if !self.state.can_transition_to(next) {
            return Err(RegistryError::InvalidState {
                vm: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Hand the freshly created host VM to this entry and make it live.
    pub fn attach(&mut self, handle: H::Vm) -> Result<(), RegistryError> {
        self.set_state(VmState::Live)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn missing_handle(&self) -> RegistryError {
        RegistryError::InvalidState {
            vm: self.id,
            from: self.state,
            to: self.state,
        }
    }

    pub fn host_handle(&self) -> Result<&H::Vm, RegistryError> {
        let missing = self.missing_handle();
        self.handle.as_ref().ok_or(missing)
    }

    pub fn host_handle_mut(&mut self) -> Result<&mut H::Vm, RegistryError> {
        let missing = self.missing_handle();
        self.handle.as_mut().ok_or(missing)
    }

    pub fn take_host_handle(&mut self) -> Result<H::Vm, RegistryError> {
        match self.handle.take() {
            Some(handle) => Ok(handle),
            None => Err(self.missing_handle()),
        }
    }

    pub fn has_children(&self) -> bool {
        !self.vcpus.is_empty() || !self.mappings.is_empty()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn vcpu_ids(&self) -> Vec<VcpuId> {
        self.vcpus.keys().copied().collect()
    }

    pub fn mappings(&self) -> Vec<MemoryMapping> {
        self.mappings.values().copied().collect()
    }

    /// Lowest VCPU id not in use, if the VM is below `limit` VCPUs.
    ///
    /// An id returned here always passes [`VmEntry::check_vcpu`].
    pub fn next_vcpu_id(&self, limit: u32) -> Result<VcpuId, RegistryError> {
        if self.vcpus.len() >= limit as usize {
            return Err(RegistryError::VcpuLimit { vm: self.id, limit });
        }
        (0..limit)
            .map(VcpuId)
            .find(|id| !self.vcpus.contains_key(id))
            .ok_or(RegistryError::VcpuLimit { vm: self.id, limit })
    }

    pub fn check_vcpu(&self, id: VcpuId, limit: u32) -> Result<(), RegistryError> {
        if self.vcpus.contains_key(&id) {
            return Err(RegistryError::DuplicateVcpu(self.id, id));
        }
        if self.vcpus.len() >= limit as usize || id.0 >= limit {
            return Err(RegistryError::VcpuLimit { vm: self.id, limit });
        }
        Ok(())
    }

    pub fn register_vcpu(&mut self, vcpu: VcpuEntry<H>, limit: u32) -> Result<(), RegistryError> {
        self.check_vcpu(vcpu.id(), limit)?;
        self.insert_vcpu(vcpu);
        Ok(())
    }

    /// Insert a VCPU that already passed [`VmEntry::check_vcpu`] under the
    /// same lock.
    pub fn insert_vcpu(&mut self, vcpu: VcpuEntry<H>) {
        self.vcpus.insert(vcpu.id(), vcpu);
    }

    pub fn unregister_vcpu(&mut self, id: VcpuId) -> Result<VcpuEntry<H>, RegistryError> {
        self.vcpus
            .remove(&id)
            .ok_or(RegistryError::VcpuNotFound(self.id, id))
    }

    /// The mapping with the highest base below `end`. Since ranges are
    /// disjoint and sorted, it is the only one that can reach past a start
    /// point lower than `end`.
    fn last_below(&self, end: u64) -> Option<&MemoryMapping> {
        self.mappings.range(..end).next_back().map(|(_, m)| m)
    }

    pub fn check_mapping(&self, mapping: &MemoryMapping, limit: u32) -> Result<(), RegistryError> {
        let start = mapping.gpa().raw_value();
        if let Some(existing) = self.last_below(mapping.guest_end()) {
            if existing.overlaps_guest(start, mapping.guest_end()) {
                return Err(RegistryError::Overlap {
                    vm: self.id,
                    gpa: start,
                    size: mapping.size(),
                    existing_gpa: existing.gpa().raw_value(),
                    existing_size: existing.size(),
                });
            }
        }
        if self.mappings.len() >= limit as usize {
            return Err(RegistryError::MappingLimit { vm: self.id, limit });
        }
        Ok(())
    }

    pub fn register_mapping(
        &mut self,
        mapping: MemoryMapping,
        limit: u32,
    ) -> Result<(), RegistryError> {
        self.check_mapping(&mapping, limit)?;
        self.insert_mapping(mapping);
        Ok(())
    }

    /// Insert a mapping that already passed [`VmEntry::check_mapping`]
    /// under the same lock.
    pub fn insert_mapping(&mut self, mapping: MemoryMapping) {
        self.mappings.insert(mapping.gpa().raw_value(), mapping);
    }

    /// Remove the mapping that exactly covers `[gpa, gpa + size)`.
    pub fn unregister_mapping(
        &mut self,
        gpa: GuestAddress,
        size: u64,
    ) -> Result<MemoryMapping, RegistryError> {
        let start = gpa.raw_value();
        let end = guest_range_end(gpa, size)?;
        if self
            .mappings
            .get(&start)
            .is_some_and(|existing| existing.matches(gpa, size))
        {
            if let Some(mapping) = self.mappings.remove(&start) {
                return Ok(mapping);
            }
        }
        match self.last_below(end) {
            Some(existing) if existing.overlaps_guest(start, end) => {
                Err(RegistryError::RangeMismatch {
                    vm: self.id,
                    gpa: start,
                    size,
                    existing_gpa: existing.gpa().raw_value(),
                    existing_size: existing.size(),
                })
            }
            _ => Err(RegistryError::MappingNotFound {
                vm: self.id,
                gpa: start,
                size,
            }),
        }
    }

    /// Move the VM to `Destroying` and hand over everything it owns.
    pub fn release_children(&mut self) -> Result<OwnedChildren<H>, RegistryError> {
        self.set_state(VmState::Destroying)?;
        let vcpus = std::mem::take(&mut self.vcpus).into_values().collect();
        let mappings = std::mem::take(&mut self.mappings).into_values().collect();
        Ok(OwnedChildren { vcpus, mappings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::{MockHost, MockVcpu};
    use crate::host::HostVirt;
    use crate::vstate::memory::MemoryPermissions;

    fn live_entry(host: &MockHost) -> VmEntry<MockHost> {
        let mut entry = VmEntry::new(VmId(1));
        entry.attach(host.create_vm().unwrap()).unwrap();
        entry
    }

    fn vcpu(host: &MockHost, entry: &mut VmEntry<MockHost>, id: u32) -> VcpuEntry<MockHost> {
        let handle: MockVcpu = host
            .create_vcpu(entry.host_handle_mut().unwrap(), VcpuId(id))
            .unwrap();
        VcpuEntry::new(VcpuId(id), handle)
    }

    fn mapping(gpa: u64, size: u64) -> MemoryMapping {
        MemoryMapping::new(GuestAddress(gpa), 0x4000_0000 + gpa, size, MemoryPermissions::RWX)
            .unwrap()
    }

    #[test]
    fn test_state_transitions() {
        use VmState::*;
        assert!(Uninitialized.can_transition_to(Live));
        assert!(Uninitialized.can_transition_to(Destroyed));
        assert!(Live.can_transition_to(Destroying));
        assert!(Destroying.can_transition_to(Destroyed));
        assert!(!Live.can_transition_to(Destroyed));
        assert!(!Destroyed.can_transition_to(Live));
        assert!(!Destroying.can_transition_to(Live));

        let mut entry: VmEntry<MockHost> = VmEntry::new(VmId(3));
        assert!(matches!(
            entry.set_state(Destroying),
            Err(RegistryError::InvalidState { .. })
        ));
        assert_eq!(entry.state(), Uninitialized);
    }

    #[test]
    fn test_vcpu_ids_fill_gaps() {
        let host = MockHost::new();
        let mut entry = live_entry(&host);
        for id in 0..3 {
            let next = entry.next_vcpu_id(8).unwrap();
            assert_eq!(next, VcpuId(id));
            let v = vcpu(&host, &mut entry, id);
            entry.register_vcpu(v, 8).unwrap();
        }
        entry.unregister_vcpu(VcpuId(1)).unwrap();
        assert_eq!(entry.next_vcpu_id(8).unwrap(), VcpuId(1));
        // Two vcpus live: a gap below the limit does not make room.
        assert!(matches!(
            entry.next_vcpu_id(2),
            Err(RegistryError::VcpuLimit { limit: 2, .. })
        ));
        assert!(entry.check_vcpu(VcpuId(1), 2).is_err());
        let next = entry.next_vcpu_id(3).unwrap();
        assert_eq!(next, VcpuId(1));
        assert!(entry.check_vcpu(next, 3).is_ok());
        assert!(matches!(
            entry.unregister_vcpu(VcpuId(1)),
            Err(RegistryError::VcpuNotFound(_, VcpuId(1)))
        ));
    }

    #[test]
    fn test_duplicate_vcpu() {
        let host = MockHost::new();
        let mut entry = live_entry(&host);
        let v = vcpu(&host, &mut entry, 0);
        entry.register_vcpu(v, 8).unwrap();
        assert!(matches!(
            entry.check_vcpu(VcpuId(0), 8),
            Err(RegistryError::DuplicateVcpu(VmId(1), VcpuId(0)))
        ));
    }

    #[test]
    fn test_mapping_overlap() {
        let host = MockHost::new();
        let mut entry = live_entry(&host);
        entry.register_mapping(mapping(100, 50), 32).unwrap();

        assert!(matches!(
            entry.check_mapping(&mapping(120, 10), 32),
            Err(RegistryError::Overlap {
                existing_gpa: 100,
                existing_size: 50,
                ..
            })
        ));
        assert!(matches!(
            entry.check_mapping(&mapping(0, 101), 32),
            Err(RegistryError::Overlap { .. })
        ));
        // Contiguous on either side is fine.
        entry.register_mapping(mapping(150, 10), 32).unwrap();
        entry.register_mapping(mapping(0, 100), 32).unwrap();
        assert_eq!(entry.mapping_count(), 3);
        assert!(matches!(
            entry.check_mapping(&mapping(200, 10), 3),
            Err(RegistryError::MappingLimit { limit: 3, .. })
        ));
    }

    #[test]
    fn test_unregister_mapping_exact_only() {
        let host = MockHost::new();
        let mut entry = live_entry(&host);
        entry.register_mapping(mapping(100, 50), 32).unwrap();

        assert!(matches!(
            entry.unregister_mapping(GuestAddress(100), 25),
            Err(RegistryError::RangeMismatch { .. })
        ));
        assert!(matches!(
            entry.unregister_mapping(GuestAddress(120), 50),
            Err(RegistryError::RangeMismatch { .. })
        ));
        assert!(matches!(
            entry.unregister_mapping(GuestAddress(300), 50),
            Err(RegistryError::MappingNotFound { .. })
        ));
        let removed = entry.unregister_mapping(GuestAddress(100), 50).unwrap();
        assert_eq!(removed, mapping(100, 50));
        assert_eq!(entry.mapping_count(), 0);
    }

    #[test]
    fn test_release_children() {
        let host = MockHost::new();
        let mut entry = live_entry(&host);
        let v = vcpu(&host, &mut entry, 0);
        entry.register_vcpu(v, 8).unwrap();
        entry.register_mapping(mapping(0, 0x1000), 32).unwrap();

        let children = entry.release_children().unwrap();
        assert_eq!(children.vcpus.len(), 1);
        assert_eq!(children.mappings.len(), 1);
        assert!(!entry.has_children());
        assert_eq!(entry.state(), VmState::Destroying);
        // Already torn down.
        assert!(entry.release_children().is_err());
    }
}
