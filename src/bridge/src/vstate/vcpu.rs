// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::host::HostVirt;
use serde::{Deserialize, Serialize};

/// VCPU index, unique within its VM.
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
#[display(fmt = "vcpu-{}", _0)]
#[serde(transparent)]
pub struct VcpuId(pub u32);

/// Registry record of one live VCPU. Owns the host handle.
pub struct VcpuEntry<H: HostVirt> {
    id: VcpuId,
    handle: H::Vcpu,
}

impl<H: HostVirt> VcpuEntry<H> {
    pub fn new(id: VcpuId, handle: H::Vcpu) -> Self {
        VcpuEntry { id, handle }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Give up the host handle so it can be destroyed.
    pub fn into_handle(self) -> H::Vcpu {
        self.handle
    }
}
