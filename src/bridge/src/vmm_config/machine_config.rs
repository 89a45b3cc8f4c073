// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::vstate::{
    memory::{guest_range_end, MemoryPermissions},
    vm::VmId,
};
use serde::{Deserialize, Serialize};
use vm_memory::GuestAddress;

pub const MIB: u64 = 1 << 20;

/// Errors associated with actions on `MachineConfig`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VmConfigError {
    /// The vcpu number is invalid.
    #[error("The vcpu count of {0} is invalid.")]
    InvalidVcpuCount(VmId),
    /// The memory size is invalid. The memory can only be a positive number of MiB.
    #[error("The memory size (MiB) of region {1:#x} in {0} is invalid.")]
    InvalidMemorySize(VmId, u64),
    /// The guest address must be page aligned.
    #[error("The guest address {1:#x} in {0} is not page aligned.")]
    UnalignedGuestAddress(VmId, u64),
    /// The region does not fit in the guest address space.
    #[error("The region at {1:#x} in {0} overflows the guest address space.")]
    RegionOverflow(VmId, u64),
    /// Two regions of the same VM overlap.
    #[error("The regions at {1:#x} and {2:#x} in {0} overlap.")]
    OverlappingRegions(VmId, u64, u64),
    /// A region grants no access at all.
    #[error("The region at {1:#x} in {0} has no access permissions.")]
    NoPermissions(VmId, u64),
}

fn default_true() -> bool {
    true
}

/// One guest memory region, backed by anonymous host memory at build time.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryRegionConfig {
    /// Guest physical base address.
    pub guest_addr: u64,
    /// The region size in MiB.
    pub size_mib: u64,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub write: bool,
    #[serde(default = "default_true")]
    pub execute: bool,
}

impl MemoryRegionConfig {
    pub fn size(&self) -> Option<u64> {
        self.size_mib.checked_mul(MIB)
    }

    pub fn perms(&self) -> MemoryPermissions {
        MemoryPermissions {
            read: self.read,
            write: self.write,
            execute: self.execute,
        }
    }
}

/// This represents one VM of the plan file in json format.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Id the VM is created under.
    pub vmid: VmId,
    /// Number of vcpus to attach.
    pub vcpu_count: u32,
    /// Guest memory layout.
    #[serde(default)]
    pub memory: Vec<MemoryRegionConfig>,
}

impl MachineConfig {
    pub fn validate(&self, page_size: u64) -> Result<(), VmConfigError> {
        if self.vcpu_count == 0 {
            return Err(VmConfigError::InvalidVcpuCount(self.vmid));
        }
        let mut ranges = Vec::with_capacity(self.memory.len());
        for region in &self.memory {
            let size = match region.size() {
                Some(size) if size > 0 => size,
                _ => {
                    return Err(VmConfigError::InvalidMemorySize(
                        self.vmid,
                        region.guest_addr,
                    ))
                }
            };
            if region.guest_addr % page_size != 0 {
                return Err(VmConfigError::UnalignedGuestAddress(
                    self.vmid,
                    region.guest_addr,
                ));
            }
            if region.perms().is_empty() {
                return Err(VmConfigError::NoPermissions(self.vmid, region.guest_addr));
            }
            let end = guest_range_end(GuestAddress(region.guest_addr), size)
                .map_err(|_| VmConfigError::RegionOverflow(self.vmid, region.guest_addr))?;
            ranges.push((region.guest_addr, end));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(VmConfigError::OverlappingRegions(
                    self.vmid, pair[0].0, pair[1].0,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(guest_addr: u64, size_mib: u64) -> MemoryRegionConfig {
        MemoryRegionConfig {
            guest_addr,
            size_mib,
            read: true,
            write: true,
            execute: true,
        }
    }

    fn machine(memory: Vec<MemoryRegionConfig>) -> MachineConfig {
        MachineConfig {
            vmid: VmId(1),
            vcpu_count: 1,
            memory,
        }
    }

    #[test]
    fn test_validate() {
        assert_eq!(machine(vec![region(0, 16), region(16 * MIB, 1)]).validate(4096), Ok(()));

        let mut config = machine(vec![]);
        config.vcpu_count = 0;
        assert_eq!(
            config.validate(4096),
            Err(VmConfigError::InvalidVcpuCount(VmId(1)))
        );
        assert_eq!(
            machine(vec![region(0, 0)]).validate(4096),
            Err(VmConfigError::InvalidMemorySize(VmId(1), 0))
        );
        assert_eq!(
            machine(vec![region(0x800, 1)]).validate(4096),
            Err(VmConfigError::UnalignedGuestAddress(VmId(1), 0x800))
        );
        assert_eq!(
            machine(vec![region(MIB, 2), region(0, 2)]).validate(4096),
            Err(VmConfigError::OverlappingRegions(VmId(1), 0, MIB))
        );
        assert_eq!(
            machine(vec![region(u64::MAX - 0xfff, 1)]).validate(4096),
            Err(VmConfigError::RegionOverflow(VmId(1), u64::MAX - 0xfff))
        );
        let mut none = region(0, 1);
        none.read = false;
        none.write = false;
        none.execute = false;
        assert_eq!(
            machine(vec![none]).validate(4096),
            Err(VmConfigError::NoPermissions(VmId(1), 0))
        );
    }

    #[test]
    fn test_permissions_default_to_rwx() {
        let region: MemoryRegionConfig =
            serde_json::from_str(r#"{"guest_addr": 0, "size_mib": 1, "write": false}"#).unwrap();
        assert_eq!(
            region.perms(),
            MemoryPermissions {
                read: true,
                write: false,
                execute: true
            }
        );
    }
}
