/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Compile-time capacity limits.
//!
//! The source this crate is modeled on expresses every collection as a
//! fixed-capacity array or map. We don't have that constraint in safe Rust,
//! but the *design* intent (overflow is a [`crate::error::CmError::NoMemory`],
//! never silent unbounded growth) is preserved by checking these constants at
//! every insertion point named in the component design.

/// Maximum number of service instances scheduled across the whole unit.
pub const MAX_NUM_INSTANCES: usize = 256;

/// Maximum number of nodes in a unit.
pub const MAX_NUM_NODES: usize = 8;

/// Maximum number of labels a node or a run request may carry.
pub const MAX_NUM_NODE_LABELS: usize = 16;

/// Maximum number of distinct device kinds declared by a node.
pub const MAX_NUM_NODE_DEVICES: usize = 16;

/// Maximum number of distinct runner/runtime names declared by a node.
pub const MAX_NUM_RUNNERS: usize = 8;

/// Maximum number of layers a single service may require.
pub const MAX_NUM_LAYERS: usize = 32;

/// Upper bound on concurrently in-flight per-node dispatch tasks.
pub const MAX_NUM_CONCURRENT_ITEMS: usize = 8;

/// Half-open range of allocatable instance UIDs.
pub const UID_RANGE: std::ops::Range<u32> = 5000..10000;

/// Maximum number of UIDs the instance manager may hold allocated at once.
pub const MAX_NUM_LOCKED_UIDS: usize = MAX_NUM_INSTANCES;
