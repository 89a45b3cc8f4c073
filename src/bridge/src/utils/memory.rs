// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::result::Result;

use vm_memory::{mmap::MmapRegionError, MmapRegion};

/// Allocate `size` bytes of private anonymous memory to back a guest region.
///
/// The region owns the mapping and unmaps it on drop.
pub(crate) fn anonymous(size: usize) -> Result<MmapRegion, MmapRegionError> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    MmapRegion::build(None, size, prot, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous() {
        let region = anonymous(0x4000).unwrap();
        assert_eq!(region.size(), 0x4000);
        assert!(!region.as_ptr().is_null());
        assert!(anonymous(0).is_err());
    }
}
