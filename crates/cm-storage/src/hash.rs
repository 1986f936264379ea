/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Hashing abstraction. The component design fixes the algorithm at
//! SHA3-224 for both update validation and change detection; this trait
//! exists so StorageState doesn't hardcode a crate dependency, matching the
//! "Hasher: CreateHash(algorithm)" external interface.

use cm_model::CmError;
use sha3::{Digest, Sha3_224};

pub trait Hasher: Send + Sync {
    /// Returns an updatable-then-finalizable hash instance for `algorithm`.
    fn create_hash(&self, algorithm: &str) -> Result<Box<dyn IncrementalHash>, CmError>;
}

pub trait IncrementalHash: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

/// The one algorithm the design actually names.
pub const SHA3_224: &str = "sha3-224";

#[derive(Default)]
struct Sha3_224Incremental(Sha3_224);

impl IncrementalHash for Sha3_224Incremental {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

/// Default [`Hasher`] backing production use: only SHA3-224 is supported,
/// matching the fixed algorithm the design names.
#[derive(Default, Clone, Copy)]
pub struct Sha3Hasher;

impl Hasher for Sha3Hasher {
    fn create_hash(&self, algorithm: &str) -> Result<Box<dyn IncrementalHash>, CmError> {
        if algorithm != SHA3_224 {
            return Err(CmError::invalid_argument(format!(
                "unsupported hash algorithm: {algorithm}"
            )));
        }
        Ok(Box::new(Sha3_224Incremental::default()))
    }
}

/// Convenience one-shot digest used by StorageState's checksum comparisons.
pub fn sha3_224(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha3_224::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_algorithm() {
        let hasher = Sha3Hasher;
        assert!(hasher.create_hash("md5").is_err());
    }

    #[test]
    fn incremental_matches_one_shot() {
        let hasher = Sha3Hasher;
        let mut h = hasher.create_hash(SHA3_224).unwrap();
        h.update(b"abc");
        assert_eq!(h.finalize(), sha3_224(b"abc"));
    }
}
