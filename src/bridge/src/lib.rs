// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle bridge between a VM orchestrator and the host's
//! hardware-virtualization API.
//!
//! [`Bridge`] creates and destroys VMs, attaches VCPUs and installs
//! guest-physical to host-virtual mappings. Every operation is validated
//! against the [`registry`] first, then issued once to a [`host::HostVirt`]
//! backend, then committed or rolled back, so the registry never claims a
//! resource the host does not have.

pub mod bridge;
pub mod builder;
pub mod host;
pub mod registry;
pub mod resources;
pub mod utils;
pub mod vmm_config;
pub mod vstate;

pub use crate::bridge::{Bridge, VcpuRef, VmRef};
pub use crate::host::{HostError, HostInfo, HostOp, HostVirt};
pub use crate::vmm_config::bridge_config::BridgeConfig;
pub use crate::vstate::{
    memory::{MemoryMapping, MemoryPermissions},
    vcpu::VcpuId,
    vm::{VmId, VmState},
};

use crate::registry::RegistryError;
use crate::vstate::memory::MemoryError;
use std::fmt;
use vm_memory::GuestAddress;

/// Coarse classification of [`Error`] for callers that only branch on the
/// kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DuplicateId,
    NotFound,
    Overlap,
    RangeMismatch,
    ResourceBusy,
    HostError,
    InvalidRange,
    LimitExceeded,
    HostMemoryShared,
    Teardown,
}

/// Errors associated with the lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested memory range is malformed.
    #[error("Invalid memory range: {0}")]
    InvalidRange(#[from] MemoryError),
    /// Rejected by the registry before reaching the host.
    #[error("{0}")]
    Registry(#[from] RegistryError),
    /// Non-forced destroy of a VM that still owns resources.
    #[error("Vm {vm} still owns {vcpus} vcpu(s) and {mappings} mapping(s)")]
    ResourceBusy {
        vm: VmId,
        vcpus: usize,
        mappings: usize,
    },
    /// The host call failed; registry changes were rolled back.
    #[error("{0}")]
    Host(#[from] HostError),
    /// A forced destroy completed, but some host releases failed.
    #[error("{0}")]
    Teardown(TeardownReport),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRange(_) => ErrorKind::InvalidRange,
            Error::Registry(e) => match e {
                RegistryError::DuplicateVm(_) | RegistryError::DuplicateVcpu(..) => {
                    ErrorKind::DuplicateId
                }
                RegistryError::VmNotFound(_)
                | RegistryError::VcpuNotFound(..)
                | RegistryError::MappingNotFound { .. }
                | RegistryError::InvalidState { .. } => ErrorKind::NotFound,
                RegistryError::Overlap { .. } => ErrorKind::Overlap,
                RegistryError::RangeMismatch { .. } => ErrorKind::RangeMismatch,
                RegistryError::HostMemoryShared { .. } => ErrorKind::HostMemoryShared,
                RegistryError::VcpuLimit { .. } | RegistryError::MappingLimit { .. } => {
                    ErrorKind::LimitExceeded
                }
                RegistryError::InvalidRange(_) => ErrorKind::InvalidRange,
            },
            Error::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Error::Host(_) => ErrorKind::HostError,
            Error::Teardown(_) => ErrorKind::Teardown,
        }
    }
}

/// One child (or the VM itself) the host refused to release during a
/// forced destroy.
#[derive(Debug, thiserror::Error)]
pub enum TeardownFailure {
    #[error("{0}: {1}")]
    Vcpu(VcpuId, HostError),
    #[error("mapping {:#x}+{size:#x}: {error}", .gpa.0)]
    Mapping {
        gpa: GuestAddress,
        size: u64,
        error: HostError,
    },
    #[error("vm: {0}")]
    Vm(HostError),
}

/// Outcome of a destroy that released the VM but left host objects behind.
///
/// The VM is gone from the registry either way; whatever is listed here is
/// leaked on the host side and unreachable through the bridge.
#[derive(Debug)]
pub struct TeardownReport {
    pub vm: VmId,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn new(vm: VmId) -> Self {
        TeardownReport {
            vm,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Teardown of {} left {} host object(s) behind",
            self.vm,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}
