// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Barrier};
use std::thread;

use bridge::host::{kvm::KvmHost, mock::MockHost};
use bridge::{
    Bridge, BridgeConfig, ErrorKind, HostOp, MemoryPermissions, VcpuId, VmId, VmState,
};
use vm_memory::{GuestAddress, MmapRegion};

fn mock_bridge() -> Arc<Bridge<MockHost>> {
    Arc::new(Bridge::new(MockHost::new(), BridgeConfig::default()))
}

#[test]
fn test_parallel_vms() {
    let bridge = mock_bridge();
    let threads = 8u32;
    let barrier = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let id = VmId(i + 1);
                barrier.wait();
                for _ in 0..10 {
                    bridge.create_vm(id).unwrap();
                    bridge.create_vcpu(id).unwrap();
                    bridge.create_vcpu(id).unwrap();
                    let hva = 0x1000_0000 + u64::from(i) * 0x10_0000;
                    // SAFETY: the mock host never dereferences host addresses.
                    unsafe {
                        bridge
                            .map_memory(id, GuestAddress(0), hva, 0x1000, MemoryPermissions::RW)
                            .unwrap();
                    }
                    assert_eq!(bridge.vcpus(id).unwrap(), vec![VcpuId(0), VcpuId(1)]);
                    bridge.destroy_vm(id, true).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(bridge.live_vms().is_empty());
    assert_eq!(bridge.host().live_vms(), 0);
    assert_eq!(bridge.host().live_vcpus(), 0);
    assert_eq!(bridge.host().live_mappings(), 0);
    assert_eq!(bridge.host().calls(HostOp::CreateVm), 80);
}

#[test]
fn test_racing_create_same_vm() {
    let bridge = mock_bridge();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                bridge.create_vm(VmId(7)).map_err(|e| e.kind())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.err())
        .all(|kind| kind == ErrorKind::DuplicateId));
    assert_eq!(bridge.live_vms(), vec![VmId(7)]);
    assert_eq!(bridge.host().live_vms(), 1);
}

#[test]
fn test_racing_vcpus_respect_limit() {
    let bridge = mock_bridge();
    bridge.create_vm(VmId(1)).unwrap();
    let limit = bridge.vcpu_limit() as usize;
    let threads = limit * 2;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                bridge.create_vcpu(VmId(1)).map_err(|e| e.kind())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), limit);
    assert!(results
        .iter()
        .filter_map(|r| r.err())
        .all(|kind| kind == ErrorKind::LimitExceeded));
    let vcpus = bridge.vcpus(VmId(1)).unwrap();
    assert_eq!(vcpus.len(), limit);
    assert_eq!(vcpus, (0..limit as u32).map(VcpuId).collect::<Vec<_>>());
}

#[test]
fn test_destroy_while_mapping() {
    let bridge = mock_bridge();
    bridge.create_vm(VmId(1)).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let mapper = {
        let bridge = bridge.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            let mut mapped = 0;
            for i in 0..16u64 {
                // SAFETY: the mock host never dereferences host addresses.
                let res = unsafe {
                    bridge.map_memory(
                        VmId(1),
                        GuestAddress(i * 0x1000),
                        0x4000_0000 + i * 0x1000,
                        0x1000,
                        MemoryPermissions::RWX,
                    )
                };
                match res {
                    Ok(()) => mapped += 1,
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::NotFound);
                        break;
                    }
                }
            }
            mapped
        })
    };
    barrier.wait();
    bridge.destroy_vm(VmId(1), true).unwrap();
    mapper.join().unwrap();

    // Whatever was mapped before the destroy was released with the VM.
    assert!(bridge.live_vms().is_empty());
    assert_eq!(bridge.host().live_mappings(), 0);
    assert_eq!(bridge.vm_state(VmId(1)).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_failure_then_recovery() {
    let bridge = mock_bridge();
    bridge.host().fail_always(HostOp::CreateVm);
    for id in 1..=3 {
        let err = bridge.create_vm(VmId(id)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostError);
    }
    assert!(bridge.live_vms().is_empty());

    bridge.host().clear_failures();
    for id in 1..=3 {
        bridge.create_vm(VmId(id)).unwrap();
        assert_eq!(bridge.vm_state(VmId(id)).unwrap(), VmState::Live);
    }
    assert!(bridge.shutdown().is_empty());
    assert_eq!(bridge.host().live_vms(), 0);
}

#[test]
fn test_kvm_lifecycle() {
    // Hosts without /dev/kvm skip this test.
    let host = match KvmHost::new() {
        Ok(host) => host,
        Err(_) => return,
    };
    let bridge = Bridge::new(host, BridgeConfig::default());
    assert!(bridge.host_info().max_vcpus > 0);
    assert!(bridge.host_info().max_mappings > 0);

    bridge.create_vm(VmId(1)).unwrap();
    let vcpu = bridge.create_vcpu(VmId(1)).unwrap();
    let region = MmapRegion::<()>::new(0x10000).unwrap();
    let hva = region.as_ptr() as u64;

    // SAFETY: `region` outlives the mapping, which is removed below.
    unsafe {
        bridge
            .map_memory(VmId(1), GuestAddress(0), hva, 0x10000, MemoryPermissions::RWX)
            .unwrap();
    }
    let err = bridge
        .unmap_memory(VmId(1), GuestAddress(0), 0x1000)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RangeMismatch);
    bridge
        .unmap_memory(VmId(1), GuestAddress(0), 0x10000)
        .unwrap();
    bridge.destroy_vcpu(VmId(1), vcpu.id()).unwrap();
    // The freed id is handed out again and KVM accepts it.
    let vcpu = bridge.create_vcpu(VmId(1)).unwrap();
    assert_eq!(vcpu.id(), VcpuId(0));
    bridge.destroy_vcpu(VmId(1), vcpu.id()).unwrap();
    bridge.destroy_vm(VmId(1), false).unwrap();
    assert!(bridge.live_vms().is_empty());
    drop(region);
}
