// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host virtualization service adapter.
//!
//! Every lifecycle intent becomes exactly one call on a [`HostVirt`]
//! implementation and its outcome is normalized into `Result<_, HostError>`.
//! Nothing here retries or keeps bookkeeping of its own beyond what a backend
//! needs to address its objects.

pub mod kvm;
pub mod mock;

use crate::vstate::{memory::MemoryMapping, vcpu::VcpuId};
use utils::errno;
use vm_memory::GuestAddress;

/// The host call that produced a [`HostError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum HostOp {
    /// Opening the host virtualization service.
    Open,
    CreateVm,
    DestroyVm,
    CreateVcpu,
    DestroyVcpu,
    MapMemory,
    UnmapMemory,
}

/// A host call reported failure.
///
/// The errno value is carried for diagnostics only; the bridge never
/// branches on it.
#[derive(Debug, thiserror::Error)]
#[error("Host call {op} failed: {errno}")]
pub struct HostError {
    /// Which call failed.
    pub op: HostOp,
    /// Opaque failure code reported by the host.
    #[source]
    pub errno: errno::Error,
}

impl HostError {
    pub fn new(op: HostOp, errno: errno::Error) -> Self {
        HostError { op, errno }
    }

    pub fn from_code(op: HostOp, code: i32) -> Self {
        HostError::new(op, errno::Error::new(code))
    }
}

/// Limits the host reports for a single VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    /// Maximum number of VCPUs per VM.
    pub max_vcpus: u32,
    /// Maximum number of memory mappings per VM.
    pub max_mappings: u32,
}

/// The narrow interface the bridge needs from the host platform.
///
/// Handles are opaque and not `Clone`: a handle returned by `create_*` is
/// owned by exactly one registry entry and handed back by value to the
/// matching `destroy_*`, so it cannot be released twice.
pub trait HostVirt: Send + Sync {
    /// Host handle of a VM.
    type Vm: Send;
    /// Host handle of a VCPU.
    type Vcpu: Send;

    fn system_info(&self) -> HostInfo;

    fn create_vm(&self) -> Result<Self::Vm, HostError>;

    fn destroy_vm(&self, vm: Self::Vm) -> Result<(), HostError>;

    /// Create the VCPU the bridge knows as `id`. How `id` maps onto the
    /// host's own VCPU numbering is up to the backend.
    fn create_vcpu(&self, vm: &mut Self::Vm, id: VcpuId) -> Result<Self::Vcpu, HostError>;

    fn destroy_vcpu(&self, vm: &Self::Vm, vcpu: Self::Vcpu) -> Result<(), HostError>;

    /// Back `mapping`'s guest-physical range with its host-virtual range.
    ///
    /// # Safety
    ///
    /// `[mapping.hva(), mapping.hva() + mapping.size())` must be memory of
    /// this process that stays mapped until the range is unmapped from the
    /// guest or the VM is destroyed. The guest may read and write it at any
    /// time in between.
    unsafe fn map_memory(
        &self,
        vm: &mut Self::Vm,
        mapping: &MemoryMapping,
    ) -> Result<(), HostError>;

    fn unmap_memory(
        &self,
        vm: &mut Self::Vm,
        gpa: GuestAddress,
        size: u64,
    ) -> Result<(), HostError>;
}
