//! The single-key wire container.
//!
//! An 80-byte little-endian record pairing a key id with its cipher
//! description and policy, plus a 16-byte extension used to obfuscate the
//! names of files encrypted under the key.

use crate::misc::CryptError;
use crate::registry;
use cex_types::crypto::{CipherDescription, DigestKind, CIPHER_DESCRIPTION_LEN};

/// The serialized length of a [CipherKey]
pub const CIPHER_KEY_LEN: usize = 16 + CIPHER_DESCRIPTION_LEN + 8 + 8 + 16;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CipherKey {
    /// Unique per key file
    pub id: u128,
    pub description: CipherDescription,
    pub created_at: i64,
    pub policy: u64,
    pub extension: [u8; 16],
}

impl CipherKey {
    pub fn new(description: CipherDescription, created_at: i64, policy: u64) -> Self {
        let mut extension = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut extension);
        Self {
            id: uuid::Uuid::new_v4().as_u128(),
            description,
            created_at,
            policy,
            extension,
        }
    }

    pub fn write_into(&self, out: &mut [u8; CIPHER_KEY_LEN]) {
        out[0..16].copy_from_slice(&self.id.to_le_bytes());
        self.description
            .write_into((&mut out[16..48]).try_into().expect("fixed sub-slice"));
        out[48..56].copy_from_slice(&self.created_at.to_le_bytes());
        out[56..64].copy_from_slice(&self.policy.to_le_bytes());
        out[64..80].copy_from_slice(&self.extension);
    }

    pub fn to_bytes(&self) -> [u8; CIPHER_KEY_LEN] {
        let mut out = [0u8; CIPHER_KEY_LEN];
        self.write_into(&mut out);
        out
    }

    pub fn from_bytes(input: &[u8]) -> Result<Self, CryptError> {
        if input.len() < CIPHER_KEY_LEN {
            return Err(CryptError::InvalidParameter(
                "cipher key record too short".to_string(),
            ));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&input[0..16]);
        let description = CipherDescription::from_bytes(&input[16..48])?;
        let mut created = [0u8; 8];
        created.copy_from_slice(&input[48..56]);
        let mut policy = [0u8; 8];
        policy.copy_from_slice(&input[56..64]);
        let mut extension = [0u8; 16];
        extension.copy_from_slice(&input[64..80]);

        Ok(Self {
            id: u128::from_le_bytes(id),
            description,
            created_at: i64::from_le_bytes(created),
            policy: u64::from_le_bytes(policy),
            extension,
        })
    }

    /// XORs the extension against a digest of `name`, producing the stored
    /// (obfuscated) filename as lowercase hex. Applying it to the stored
    /// name recovers the digest-mask relationship, so the mapping is
    /// self-inverse over the raw bytes.
    pub fn obfuscate_file_name(&self, name: &str) -> Result<String, CryptError> {
        let mut digest = registry::digest_of(DigestKind::Sha256)?;
        digest.update(name.as_bytes());
        let mut mask = [0u8; 32];
        digest.finalize(&mut mask)?;

        let mut out = [0u8; 16];
        for (idx, byte) in out.iter_mut().enumerate() {
            *byte = self.extension[idx] ^ mask[idx];
        }
        Ok(out.iter().map(|b| format!("{b:02x}")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let key = CipherKey::new(CipherDescription::rijndael_cbc_256(), 1_700_000_000, 3);
        let bytes = key.to_bytes();
        let parsed = CipherKey::from_bytes(&bytes).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn obfuscated_names_differ_per_key_and_name() {
        let first = CipherKey::new(CipherDescription::rijndael_ctr_256(), 0, 0);
        let second = CipherKey::new(CipherDescription::rijndael_ctr_256(), 0, 0);

        let name_a = first.obfuscate_file_name("journal.db").unwrap();
        let name_b = first.obfuscate_file_name("journal2.db").unwrap();
        let name_c = second.obfuscate_file_name("journal.db").unwrap();
        assert_ne!(name_a, name_b);
        assert_ne!(name_a, name_c);
        // stable for the same key and name
        assert_eq!(name_a, first.obfuscate_file_name("journal.db").unwrap());
    }
}
