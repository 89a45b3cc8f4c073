// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use vm_memory::{Address, GuestAddress};

/// Errors associated with describing a memory range.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemoryError {
    /// Zero-sized ranges cannot be mapped or unmapped.
    #[error("Memory range size must be greater than zero")]
    ZeroSize,
    /// The guest range runs past the end of the address space.
    #[error("Guest range {gpa:#x}+{size:#x} overflows the address space")]
    GuestRangeOverflow { gpa: u64, size: u64 },
    /// The host range runs past the end of the address space.
    #[error("Host range {hva:#x}+{size:#x} overflows the address space")]
    HostRangeOverflow { hva: u64, size: u64 },
    /// A mapping needs at least one access right.
    #[error("Memory mapping has no access permissions")]
    NoPermissions,
}

/// Access rights of a guest mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MemoryPermissions {
    pub const RO: MemoryPermissions = MemoryPermissions {
        read: true,
        write: false,
        execute: false,
    };
    pub const RW: MemoryPermissions = MemoryPermissions {
        read: true,
        write: true,
        execute: false,
    };
    pub const RWX: MemoryPermissions = MemoryPermissions {
        read: true,
        write: true,
        execute: true,
    };

    pub fn is_empty(&self) -> bool {
        !(self.read || self.write || self.execute)
    }
}

/// Exclusive end of `[start, start + size)`, rejecting empty and wrapping
/// ranges.
pub fn guest_range_end(gpa: GuestAddress, size: u64) -> Result<u64, MemoryError> {
    if size == 0 {
        return Err(MemoryError::ZeroSize);
    }
    gpa.checked_add(size)
        .map(|end| end.raw_value())
        .ok_or(MemoryError::GuestRangeOverflow {
            gpa: gpa.raw_value(),
            size,
        })
}

/// Whether the half-open ranges `[a, a_end)` and `[b, b_end)` intersect.
pub fn ranges_overlap(a: u64, a_end: u64, b: u64, b_end: u64) -> bool {
    a < b_end && b < a_end
}

/// One guest-physical range backed by a host-virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapping {
    gpa: GuestAddress,
    hva: u64,
    size: u64,
    perms: MemoryPermissions,
}

impl MemoryMapping {
    pub fn new(
        gpa: GuestAddress,
        hva: u64,
        size: u64,
        perms: MemoryPermissions,
    ) -> Result<Self, MemoryError> {
        guest_range_end(gpa, size)?;
        if hva.checked_add(size).is_none() {
            return Err(MemoryError::HostRangeOverflow { hva, size });
        }
        if perms.is_empty() {
            return Err(MemoryError::NoPermissions);
        }
        Ok(MemoryMapping {
            gpa,
            hva,
            size,
            perms,
        })
    }

    pub fn gpa(&self) -> GuestAddress {
        self.gpa
    }

    pub fn hva(&self) -> u64 {
        self.hva
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn perms(&self) -> MemoryPermissions {
        self.perms
    }

    /// Exclusive end of the guest range. Cannot wrap, `new` checked it.
    pub fn guest_end(&self) -> u64 {
        self.gpa.raw_value() + self.size
    }

    pub fn host_end(&self) -> u64 {
        self.hva + self.size
    }

    pub fn overlaps_guest(&self, gpa: u64, end: u64) -> bool {
        ranges_overlap(self.gpa.raw_value(), self.guest_end(), gpa, end)
    }

    pub fn matches(&self, gpa: GuestAddress, size: u64) -> bool {
        self.gpa == gpa && self.size == size
    }
}
