// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::host::mock::MockHost;
use crate::resources::BridgeResources;
use crate::{Bridge, BridgeConfig};

pub fn mock_bridge() -> Bridge<MockHost> {
    Bridge::new(MockHost::new(), BridgeConfig::default())
}

/// Two VMs: one with two vcpus and two regions, one bare.
pub const PLAN_JSON: &str = r#"{
    "vms": [
        { "vmid": 1, "vcpu_count": 2,
          "memory": [
              { "guest_addr": 0, "size_mib": 2 },
              { "guest_addr": 1048576000, "size_mib": 1, "execute": false }
          ] },
        { "vmid": 2, "vcpu_count": 1 }
    ]
}"#;

pub fn default_plan() -> BridgeResources {
    BridgeResources::from_json(PLAN_JSON).unwrap()
}
