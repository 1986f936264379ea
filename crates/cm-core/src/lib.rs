/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Communication manager business logic: node handling, the node info
//! cache, per-instance storage state, placement, dispatch, and the update
//! pipeline. Data types live in `cm_model`; external collaborators are
//! defined as traits in `cm_storage`.

pub mod balancer;
pub mod instance;
pub mod launcher;
pub mod logging;
pub mod node_handler;
pub mod node_info;
pub mod storage_state;
pub mod update_manager;
