//! Key derivation: PBKDF2 over the registry MAC interface, and HKDF
//! expansion for session keys.

use crate::misc::CryptError;
use crate::registry::{self};
use cex_types::crypto::MacKind;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// PBKDF2 (RFC 2898) with the given HMAC, filling all of `out`
pub fn pbkdf2(
    mac_kind: MacKind,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    out: &mut [u8],
) -> Result<(), CryptError> {
    if iterations == 0 {
        return Err(CryptError::InvalidParameter(
            "iteration count must be non-zero".to_string(),
        ));
    }

    if out.is_empty() {
        return Err(CryptError::InvalidParameter(
            "requested output length is zero".to_string(),
        ));
    }

    let mut mac = registry::mac_of(mac_kind)?;
    mac.init(password)?;
    let h_len = mac.digest_size();

    let mut u = Zeroizing::new(vec![0u8; h_len]);
    let mut t = Zeroizing::new(vec![0u8; h_len]);

    for (block_idx, chunk) in out.chunks_mut(h_len).enumerate() {
        // U_1 = PRF(password, salt || INT(i)), big-endian block index from 1
        let index = (block_idx as u32) + 1;
        mac.update(salt)?;
        mac.update(&index.to_be_bytes())?;
        mac.finalize(&mut u)?;
        t.copy_from_slice(&u);

        for _ in 1..iterations {
            mac.update(&u)?;
            mac.finalize(&mut u)?;
            for (acc, next) in t.iter_mut().zip(u.iter()) {
                *acc ^= next;
            }
        }

        chunk.copy_from_slice(&t[..chunk.len()]);
    }

    Ok(())
}

/// HKDF-SHA-256 extract-and-expand
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, out)
        .map_err(|err| CryptError::InvalidParameter(err.to_string()))
}
