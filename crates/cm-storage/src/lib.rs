/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! External collaborator contracts consumed by the communication manager
//! core. Nothing in this crate talks to a real database, filesystem, or
//! network; every side effect is behind a trait so `cm-core` can be
//! exercised with in-memory doubles.

pub mod fs;
pub mod hash;
pub mod image;
pub mod launcher;
pub mod network;
pub mod node_info;
pub mod node_runtime;
pub mod sender;
pub mod storage;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use fs::{FsEvent, FsEventSubscriber, FsPlatform, FsWatcher};
pub use hash::{Hasher, IncrementalHash, Sha3Hasher};
pub use image::{ImageManager, ImageProvider, ServiceListener};
pub use launcher::RunStatusListener;
pub use network::NetworkManager;
pub use node_info::{NodeInfoListener, NodeInfoProvider, NodeInfoSource, NodeInfoSourceListener, UnitNodeInfo};
pub use node_runtime::{NodeRuntime, ResourceManager, RunOutcome};
pub use sender::{StorageStateSender, UnitStatusSender};
pub use storage::Storage;
