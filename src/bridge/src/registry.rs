// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Resource registry.
//!
//! Bookkeeping of every VM, VCPU and mapping the bridge believes exists.
//! Each VM sits behind its own mutex so operations on different VMs never
//! wait on each other; the map lock is only held to look up, insert or
//! remove an entry and never across a host call.
//!
//! Locking order: a VM's entry lock may be held while taking the map lock
//! or the host-memory index lock, never the other way round.

use crate::{
    host::HostVirt,
    vstate::{
        memory::{MemoryError, MemoryMapping},
        vcpu::{VcpuEntry, VcpuId},
        vm::{VmEntry, VmId, VmState},
    },
};
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, warn};

/// Errors detected by the registry. None of these reach the host.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A live VM already uses this id.
    #[error("Vm {0} already exists")]
    DuplicateVm(VmId),
    /// No live VM with this id.
    #[error("Vm {0} not found")]
    VmNotFound(VmId),
    /// The VM already owns a VCPU with this id.
    #[error("Vcpu {1} already exists in {0}")]
    DuplicateVcpu(VmId, VcpuId),
    /// The VM owns no VCPU with this id.
    #[error("Vcpu {1} not found in {0}")]
    VcpuNotFound(VmId, VcpuId),
    /// No mapping of the VM intersects the requested range.
    #[error("No mapping at {gpa:#x}+{size:#x} in {vm}")]
    MappingNotFound { vm: VmId, gpa: u64, size: u64 },
    /// The new range intersects an existing mapping of the VM.
    #[error("Range {gpa:#x}+{size:#x} overlaps mapping {existing_gpa:#x}+{existing_size:#x} in {vm}")]
    Overlap {
        vm: VmId,
        gpa: u64,
        size: u64,
        existing_gpa: u64,
        existing_size: u64,
    },
    /// The range intersects a mapping without matching it exactly.
    #[error("Range {gpa:#x}+{size:#x} does not match mapping {existing_gpa:#x}+{existing_size:#x} in {vm}")]
    RangeMismatch {
        vm: VmId,
        gpa: u64,
        size: u64,
        existing_gpa: u64,
        existing_size: u64,
    },
    /// The host range is already mapped into another VM.
    #[error("Host range {hva:#x}+{size:#x} for {vm} is already mapped into {owner}")]
    HostMemoryShared {
        vm: VmId,
        hva: u64,
        size: u64,
        owner: VmId,
    },
    #[error("Vm {vm} reached its limit of {limit} vcpus")]
    VcpuLimit { vm: VmId, limit: u32 },
    #[error("Vm {vm} reached its limit of {limit} memory mappings")]
    MappingLimit { vm: VmId, limit: u32 },
    /// Invalid range in a lookup.
    #[error("{0}")]
    InvalidRange(#[from] MemoryError),
    /// The entry is not in a state that allows the operation.
    #[error("Vm {vm} cannot move from {from} to {to}")]
    InvalidState { vm: VmId, from: VmState, to: VmState },
}

/// Everything a VM owned when it was unregistered.
pub struct OwnedChildren<H: HostVirt> {
    pub vcpus: Vec<VcpuEntry<H>>,
    pub mappings: Vec<MemoryMapping>,
}

impl<H: HostVirt> OwnedChildren<H> {
    pub fn vcpu_ids(&self) -> Vec<VcpuId> {
        self.vcpus.iter().map(|v| v.id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.vcpus.is_empty() && self.mappings.is_empty()
    }
}

/// Exclusive access to one VM entry, independent of the registry borrow.
pub type VmGuard<H> = ArcMutexGuard<RawMutex, VmEntry<H>>;

/// Host-virtual ranges in use, keyed by `(hva, owner, gpa)`.
type HostMemoryIndex = BTreeMap<(u64, VmId, u64), u64>;

pub struct Registry<H: HostVirt> {
    vms: RwLock<HashMap<VmId, Arc<Mutex<VmEntry<H>>>>>,
    /// Present when a host range may back at most one VM.
    host_memory: Option<Mutex<HostMemoryIndex>>,
}

impl<H: HostVirt> Registry<H> {
    pub fn new(exclusive_host_memory: bool) -> Self {
        Registry {
            vms: RwLock::new(HashMap::new()),
            host_memory: exclusive_host_memory.then(|| Mutex::new(BTreeMap::new())),
        }
    }

    /// Reserve `id` and return its new entry, locked and `Uninitialized`.
    ///
    /// Anyone else looking the VM up blocks on the entry lock until the
    /// caller either attaches a host handle or discards it.
    pub fn register_vm(&self, id: VmId) -> Result<VmGuard<H>, RegistryError> {
        let entry = Arc::new(Mutex::new(VmEntry::new(id)));
        let guard = entry.lock_arc();
        let mut vms = self.vms.write();
        if vms.contains_key(&id) {
            return Err(RegistryError::DuplicateVm(id));
        }
        vms.insert(id, entry);
        debug!(vmid = %id, "vm registered");
        Ok(guard)
    }

    /// Roll back [`Registry::register_vm`] after the host refused the VM.
    pub fn discard_vm(&self, vm: &mut VmGuard<H>) -> Result<(), RegistryError> {
        vm.set_state(VmState::Destroyed)?;
        self.vms.write().remove(&vm.id());
        debug!(vmid = %vm.id(), "vm registration rolled back");
        Ok(())
    }

    /// Lock the entry of a live VM.
    pub fn lock_vm(&self, id: VmId) -> Result<VmGuard<H>, RegistryError> {
        let entry = self
            .vms
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::VmNotFound(id))?;
        let guard = entry.lock_arc();
        // The entry may have been torn down or rolled back while we waited.
        if !guard.is_live() {
            return Err(RegistryError::VmNotFound(id));
        }
        Ok(guard)
    }

    /// Remove a live VM and hand back what it owned.
    ///
    /// The entry is left in `Destroying`; the caller releases the children
    /// and the VM's host handle, then marks it `Destroyed`. From here on the
    /// id is free and the entry is unreachable through the registry.
    ///
    /// Host ranges stay claimed: the caller drops each claim once the host
    /// has actually let go of the range.
    pub fn unregister_vm(&self, vm: &mut VmGuard<H>) -> Result<OwnedChildren<H>, RegistryError> {
        if !vm.is_live() {
            return Err(RegistryError::VmNotFound(vm.id()));
        }
        let children = vm.release_children()?;
        self.vms.write().remove(&vm.id());
        debug!(
            vmid = %vm.id(),
            vcpus = children.vcpus.len(),
            mappings = children.mappings.len(),
            "vm unregistered"
        );
        Ok(children)
    }

    /// Record that `vm` is about to back `mapping` with its host range.
    pub fn claim_host_memory(
        &self,
        vm: VmId,
        mapping: &MemoryMapping,
    ) -> Result<(), RegistryError> {
        let Some(index) = self.host_memory.as_ref() else {
            return Ok(());
        };
        let mut index = index.lock();
        let owner = index
            .range(..(mapping.host_end(), VmId(0), 0))
            .find(|((hva, owner, _), size)| {
                *owner != vm && *hva + **size > mapping.hva()
            })
            .map(|((_, owner, _), _)| *owner);
        if let Some(owner) = owner {
            return Err(RegistryError::HostMemoryShared {
                vm,
                hva: mapping.hva(),
                size: mapping.size(),
                owner,
            });
        }
        index.insert((mapping.hva(), vm, mapping.gpa().0), mapping.size());
        Ok(())
    }

    pub fn release_host_memory(&self, vm: VmId, mapping: &MemoryMapping) {
        if let Some(index) = self.host_memory.as_ref() {
            if index
                .lock()
                .remove(&(mapping.hva(), vm, mapping.gpa().0))
                .is_none()
            {
                warn!(vmid = %vm, hva = mapping.hva(), "host range was not claimed");
            }
        }
    }

    /// Drop every host range still claimed by `vm`, once the host VM and
    /// whatever it had mapped are gone.
    pub fn release_vm_host_memory(&self, vm: VmId) {
        if let Some(index) = self.host_memory.as_ref() {
            index.lock().retain(|(_, owner, _), _| *owner != vm);
        }
    }

    /// State of the VM registered under `id`, waiting for any operation in
    /// flight on it. A VM destroyed meanwhile is not found.
    pub fn vm_state(&self, id: VmId) -> Result<VmState, RegistryError> {
        let entry = self
            .vms
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::VmNotFound(id))?;
        let state = entry.lock().state();
        match state {
            VmState::Destroyed => Err(RegistryError::VmNotFound(id)),
            state => Ok(state),
        }
    }

    /// Ids of all registered VMs, in ascending order.
    pub fn vm_ids(&self) -> Vec<VmId> {
        let mut ids: Vec<VmId> = self.vms.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.vms.read().is_empty()
    }
}
