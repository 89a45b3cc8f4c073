// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017-2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

// `utils` wraps `vmm_sys_util` so the bridge and the binary agree on one
// version of it. Host error codes travel as `errno::Error`, so a mismatch
// here would split that type in two.

pub use vmm_sys_util::{errno, tempfile};
