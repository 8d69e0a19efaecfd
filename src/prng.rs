//! Deterministic seed expansion shared between client and mirror.
//!
//! The protocol constant pinned here (see `DESIGN.md`): a seed is 24 bytes,
//! split into a 16-byte AES-128 key and an 8-byte nonce. Expansion encrypts
//! an all-zero buffer of the requested length under AES-128-CTR with that
//! key and an IV of `nonce || counter` (counter an 8-byte big-endian value
//! starting at zero) - the ciphertext is exactly the cipher's keystream,
//! which is what both sides need to agree on without ever exchanging it.

use crate::bitvec::BitVector;
use crate::error::RaidPirError;
use openssl::symm::{Cipher, Crypter, Mode};

pub const SEED_LEN: usize = 24;
const KEY_LEN: usize = 16;
const NONCE_LEN: usize = SEED_LEN - KEY_LEN;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Seed(pub [u8; SEED_LEN]);

impl Seed {
    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Seed(bytes)
    }

    pub fn random() -> Self {
        Self::from_rng(&mut rand::thread_rng())
    }

    /// Draws a seed from the caller's own RNG rather than a thread-local
    /// one. The query builder uses this exclusively, so every draw in a
    /// retrieval - the random vectors of plain/chunked mode and the seeds
    /// of seeded mode alike - comes from the one shared RNG passed into
    /// `query::build_queries` (spec.md §5's "shared cryptographically
    /// secure source" requirement).
    pub fn from_rng(rng: &mut dyn rand::RngCore) -> Self {
        let mut bytes = [0u8; SEED_LEN];
        rng.fill_bytes(&mut bytes);
        Seed(bytes)
    }

    fn key(&self) -> &[u8] {
        &self.0[..KEY_LEN]
    }

    fn nonce(&self) -> &[u8] {
        &self.0[KEY_LEN..]
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Seed(..)")
    }
}

/// Expands `seed` into a `chunk_length_bytes`-long BitVector, deterministic
/// and reproducible byte-for-byte on any conforming implementation.
pub fn expand(seed: &Seed, chunk_length_bytes: usize) -> Result<BitVector, RaidPirError> {
    let cipher = Cipher::aes_128_ctr();
    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(seed.nonce());
    // remaining bytes are the big-endian counter, starting at zero.

    let mut crypter = Crypter::new(cipher, Mode::Encrypt, seed.key(), Some(&iv))
        .map_err(|e| RaidPirError::ParameterError(format!("cipher init failed: {}", e)))?;
    crypter.pad(false);

    let zeroes = vec![0u8; chunk_length_bytes];
    let mut out = vec![0u8; chunk_length_bytes + cipher.block_size()];
    let mut count = crypter
        .update(&zeroes, &mut out)
        .map_err(|e| RaidPirError::ParameterError(format!("cipher update failed: {}", e)))?;
    count += crypter
        .finalize(&mut out[count..])
        .map_err(|e| RaidPirError::ParameterError(format!("cipher finalize failed: {}", e)))?;
    out.truncate(count);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_is_deterministic() {
        let seed = Seed::from_bytes([7u8; SEED_LEN]);
        let a = expand(&seed, 32).unwrap();
        let b = expand(&seed, 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn expand_respects_requested_length() {
        let seed = Seed::from_bytes([1u8; SEED_LEN]);
        for len in [0usize, 1, 16, 17, 1000] {
            assert_eq!(expand(&seed, len).unwrap().len(), len);
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let a = expand(&Seed::from_bytes([1u8; SEED_LEN]), 32).unwrap();
        let b = expand(&Seed::from_bytes([2u8; SEED_LEN]), 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pinned_test_vector() {
        // Pins the construction: all-zero key/nonce must reproduce this
        // exact keystream prefix on any conforming implementation.
        let seed = Seed::from_bytes([0u8; SEED_LEN]);
        let out = expand(&seed, 16).unwrap();
        let expected = [
            0x66, 0xe9, 0x4b, 0xd4, 0xef, 0x8a, 0x2c, 0x3b, 0x88, 0x4c, 0xfa, 0x59, 0xca, 0x34,
            0x2b, 0x2e,
        ];
        assert_eq!(out, expected);
    }
}
