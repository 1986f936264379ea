/*
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::{Deserialize, Serialize};

use crate::ident::InstanceIdent;

/// Persisted per-instance storage/state record, `(instanceIdent, quotas,
/// checksum)`. The checksum is the cloud-accepted value; the watcher
/// compares a fresh hash against it on every filesystem event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStateInfo {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub gid: u32,
    pub storage_quota: u64,
    pub state_quota: u64,
    pub checksum: Checksum,
}

/// Hex-encoded SHA3-224 digest, the wire and log transport form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checksum(pub String);

impl Checksum {
    pub fn from_digest(bytes: &[u8]) -> Self {
        Self(hex_encode(bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing to a String cannot fail");
    }
    s
}

/// Request sent to the cloud asking it to redeliver the last-accepted state
/// content (`default=false`: the cloud must not substitute a default value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRequest {
    pub ident: InstanceIdent,
    pub default: bool,
}

/// A locally observed state change, pushed to the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewState {
    pub ident: InstanceIdent,
    pub content: Vec<u8>,
    pub checksum: Checksum,
}

/// Cloud's verdict on a `NewState` it was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateResult {
    Accepted,
    Rejected,
}
