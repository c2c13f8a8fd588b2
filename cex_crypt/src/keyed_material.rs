//! The keyed material container and the deterministic key generator.
//!
//! A [KeyMaterial] owns its key, IV, and info bytes for its whole life and
//! overwrites them with zeros on drop. Equality is constant-time.

use crate::misc::CryptError;
use crate::registry::{self, Digest, Prng};
use cex_types::crypto::{CipherDescription, DigestKind, PrngKind};
use cex_types::utils::const_time_compare;
use std::fmt::{Debug, Formatter};
use zeroize::{Zeroize, Zeroizing};

/// A (Key, IV, Info) triple. Never mutated after construction; scrubbed on
/// drop, or earlier via [Self::scrub].
#[derive(Clone)]
pub struct KeyMaterial {
    key: Zeroizing<Vec<u8>>,
    iv: Zeroizing<Vec<u8>>,
    info: Zeroizing<Vec<u8>>,
}

impl KeyMaterial {
    pub fn new(key: Vec<u8>, iv: Vec<u8>, info: Vec<u8>) -> Self {
        Self {
            key: Zeroizing::new(key),
            iv: Zeroizing::new(iv),
            info: Zeroizing::new(info),
        }
    }

    /// As [Self::new], validating lengths against `description`
    pub fn for_description(
        description: &CipherDescription,
        key: Vec<u8>,
        iv: Vec<u8>,
        info: Vec<u8>,
    ) -> Result<Self, CryptError> {
        if key.len() != description.key_bytes() {
            return Err(CryptError::InvalidParameter(format!(
                "key must be {} bytes, got {}",
                description.key_bytes(),
                key.len()
            )));
        }

        if iv.len() != description.iv_bytes() {
            return Err(CryptError::InvalidParameter(format!(
                "iv must be {} bytes, got {}",
                description.iv_bytes(),
                iv.len()
            )));
        }

        Ok(Self::new(key, iv, info))
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn info(&self) -> &[u8] {
        &self.info
    }

    /// Overwrites all three buffers in place, preserving lengths
    pub fn scrub(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
        self.info.zeroize();
    }

    /// True when every owned byte is zero
    pub fn is_scrubbed(&self) -> bool {
        self.key.iter().all(|b| *b == 0)
            && self.iv.iter().all(|b| *b == 0)
            && self.info.iter().all(|b| *b == 0)
    }
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "***SECRET***")
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        const_time_compare(&self.key, &other.key)
            && const_time_compare(&self.iv, &other.iv)
            && const_time_compare(&self.info, &other.info)
    }
}

impl Eq for KeyMaterial {}

/// Produces [KeyMaterial] from an entropy source and a digest. The same
/// (seed, info, lengths) always derives the same material.
pub struct KeyGenerator {
    prng: Box<dyn Prng>,
    digest: Box<dyn Digest>,
    digest_kind: DigestKind,
}

impl KeyGenerator {
    pub fn new(prng_kind: PrngKind, digest_kind: DigestKind) -> Result<Self, CryptError> {
        Ok(Self {
            prng: registry::prng_of(prng_kind)?,
            digest: registry::digest_of(digest_kind)?,
            digest_kind,
        })
    }

    /// Fresh random material sized for `description`
    pub fn generate(&mut self, description: &CipherDescription) -> KeyMaterial {
        let mut key = vec![0u8; description.key_bytes()];
        let mut iv = vec![0u8; description.iv_bytes()];
        self.prng.fill(&mut key);
        self.prng.fill(&mut iv);
        KeyMaterial::new(key, iv, Vec::new())
    }

    /// Draws a fresh seed from the entropy source and expands
    /// `digest(seed || info || counter)` blocks until `key_len + iv_len`
    /// bytes are produced
    pub fn derive(
        &mut self,
        info: &[u8],
        key_len: usize,
        iv_len: usize,
    ) -> Result<KeyMaterial, CryptError> {
        let mut seed = Zeroizing::new(vec![0u8; self.digest_kind.digest_size()]);
        self.prng.fill(&mut seed);
        self.derive_from_seed(&seed, info, key_len, iv_len)
    }

    /// The deterministic half of [Self::derive]
    pub fn derive_from_seed(
        &mut self,
        seed: &[u8],
        info: &[u8],
        key_len: usize,
        iv_len: usize,
    ) -> Result<KeyMaterial, CryptError> {
        if seed.is_empty() {
            return Err(CryptError::InvalidParameter("empty seed".to_string()));
        }

        let needed = key_len + iv_len;
        let mut stream = Zeroizing::new(Vec::with_capacity(needed));
        let mut block = Zeroizing::new(vec![0u8; self.digest_kind.digest_size()]);
        let mut counter = 0u32;

        while stream.len() < needed {
            self.digest.update(seed);
            self.digest.update(info);
            self.digest.update(&counter.to_le_bytes());
            self.digest.finalize(&mut block)?;
            let take = std::cmp::min(block.len(), needed - stream.len());
            stream.extend_from_slice(&block[..take]);
            counter = counter.wrapping_add(1);
        }

        let key = stream[..key_len].to_vec();
        let iv = stream[key_len..].to_vec();
        Ok(KeyMaterial::new(key, iv, info.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cex_types::crypto::CipherDescription;

    #[test]
    fn generated_material_matches_description() {
        let description = CipherDescription::rijndael_ctr_256();
        let mut generator = KeyGenerator::new(PrngKind::Std, DigestKind::Sha256).unwrap();
        let material = generator.generate(&description);
        assert_eq!(material.key().len(), 32);
        assert_eq!(material.iv().len(), 16);
    }

    #[test]
    fn derive_is_deterministic_in_the_seed() {
        let mut generator = KeyGenerator::new(PrngKind::Std, DigestKind::Sha512).unwrap();
        let first = generator
            .derive_from_seed(b"seed bytes", b"context", 32, 16)
            .unwrap();
        let second = generator
            .derive_from_seed(b"seed bytes", b"context", 32, 16)
            .unwrap();
        assert_eq!(first, second);

        let different = generator
            .derive_from_seed(b"seed bytes", b"other context", 32, 16)
            .unwrap();
        assert_ne!(first, different);
    }

    #[test]
    fn scrub_zeroes_in_place() {
        let mut material = KeyMaterial::new(vec![0xAA; 32], vec![0xBB; 16], vec![0xCC; 4]);
        assert!(!material.is_scrubbed());
        material.scrub();
        assert!(material.is_scrubbed());
        assert_eq!(material.key().len(), 32);
        assert_eq!(material.iv().len(), 16);
    }

    #[test]
    fn length_validation() {
        let description = CipherDescription::rijndael_ctr_256();
        assert!(KeyMaterial::for_description(
            &description,
            vec![0u8; 16],
            vec![0u8; 16],
            Vec::new()
        )
        .is_err());
    }
}
