//! Secret seed material.

use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

use crate::signer::SignerError;

/// Length of a node seed in bytes.
pub const SEED_LEN: usize = 32;

/// A node's secret seed.
///
/// Zeroized on drop. `Debug` never prints the bytes.
#[derive(Clone)]
pub struct Seed(Zeroizing<[u8; SEED_LEN]>);

impl Seed {
    /// Copy a seed out of `bytes`, which must be exactly [`SEED_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignerError> {
        if bytes.len() != SEED_LEN {
            return Err(SignerError::InvalidSeed {
                expected: SEED_LEN,
                actual: bytes.len(),
            });
        }
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        seed.copy_from_slice(bytes);
        Ok(Self(seed))
    }

    /// Parse a seed from hex (surrounding whitespace ignored).
    pub fn from_hex(s: &str) -> Result<Self, SignerError> {
        let bytes = Zeroizing::new(hex::decode(s.trim()).map_err(|_| SignerError::InvalidSeed {
            expected: SEED_LEN,
            actual: s.trim().len() / 2,
        })?);
        Self::from_slice(&bytes)
    }

    /// Generate a new seed from the OS random number generator.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut seed[..]);
        Self(seed)
    }

    pub(crate) fn expose(&self) -> &[u8; SEED_LEN] {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}
