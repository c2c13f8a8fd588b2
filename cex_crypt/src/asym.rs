//! Opaque asymmetric wrapper used by the exchange.
//!
//! The exchange only ever needs keygen/seal/open over small seed payloads;
//! the scheme behind the tag is interchangeable. The provided scheme is an
//! X25519 sealed box: ephemeral Diffie-Hellman, HKDF-SHA-256, then
//! ChaCha20-Poly1305 over the payload. Wire form: ephemeral public key
//! followed by the AEAD ciphertext.

use crate::misc::CryptError;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const X25519_PUBLIC_LEN: usize = 32;
const SEAL_INFO: &[u8] = b"cex-sealed-seed-v1";

/// Asymmetric schemes selectable by an identity's `pke_id` tag
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum PkeKind {
    X25519Sealed = 1,
}

impl PkeKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::X25519Sealed),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The tag bytes carried in identity payloads
    pub fn id_bytes(self) -> Vec<u8> {
        vec![self.as_u8()]
    }

    pub fn from_id_bytes(bytes: &[u8]) -> Result<Self, CryptError> {
        match bytes {
            [tag] => Self::from_u8(*tag).ok_or(CryptError::Unsupported("unknown pke id")),
            _ => Err(CryptError::Unsupported("malformed pke id")),
        }
    }
}

/// A generated keypair; the secret half is erased on drop
pub struct AsymKeypair {
    kind: PkeKind,
    public: [u8; X25519_PUBLIC_LEN],
    secret: StaticSecret,
}

impl AsymKeypair {
    /// Generates a fresh keypair for `kind`
    pub fn generate(kind: PkeKind) -> Result<Self, CryptError> {
        match kind {
            PkeKind::X25519Sealed => {
                let secret = StaticSecret::random_from_rng(rand::thread_rng());
                let public = PublicKey::from(&secret);
                Ok(Self {
                    kind,
                    public: *public.as_bytes(),
                    secret,
                })
            }
        }
    }

    pub fn kind(&self) -> PkeKind {
        self.kind
    }

    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Opens a payload sealed to this keypair's public key
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptError> {
        match self.kind {
            PkeKind::X25519Sealed => {
                if sealed.len() <= X25519_PUBLIC_LEN {
                    return Err(CryptError::AuthenticationFailed(
                        "sealed payload too short".to_string(),
                    ));
                }

                let mut ephemeral = [0u8; X25519_PUBLIC_LEN];
                ephemeral.copy_from_slice(&sealed[..X25519_PUBLIC_LEN]);
                let shared = self.secret.diffie_hellman(&PublicKey::from(ephemeral));

                let aead = seal_aead(shared.as_bytes())?;
                aead.decrypt(&Nonce::default(), &sealed[X25519_PUBLIC_LEN..])
                    .map(Zeroizing::new)
                    .map_err(|_| {
                        CryptError::AuthenticationFailed("sealed payload rejected".to_string())
                    })
            }
        }
    }
}

/// Seals `plaintext` to `peer_public` under `kind`
pub fn seal(kind: PkeKind, peer_public: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
    match kind {
        PkeKind::X25519Sealed => {
            if peer_public.len() != X25519_PUBLIC_LEN {
                return Err(CryptError::InvalidParameter(format!(
                    "X25519 public key must be {X25519_PUBLIC_LEN} bytes"
                )));
            }

            let mut peer = [0u8; X25519_PUBLIC_LEN];
            peer.copy_from_slice(peer_public);

            let ephemeral = StaticSecret::random_from_rng(rand::thread_rng());
            let ephemeral_public = PublicKey::from(&ephemeral);
            let shared = ephemeral.diffie_hellman(&PublicKey::from(peer));

            // fresh key per seal, so the all-zero nonce never repeats
            let aead = seal_aead(shared.as_bytes())?;
            let ciphertext = aead
                .encrypt(&Nonce::default(), plaintext)
                .map_err(|_| CryptError::AuthenticationFailed("seal failure".to_string()))?;

            let mut out = Vec::with_capacity(X25519_PUBLIC_LEN + ciphertext.len());
            out.extend_from_slice(ephemeral_public.as_bytes());
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
    }
}

fn seal_aead(shared: &[u8]) -> Result<ChaCha20Poly1305, CryptError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(SEAL_INFO, &mut *key)
        .map_err(|err| CryptError::InvalidParameter(err.to_string()))?;
    Ok(ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(
        &*key,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let keypair = AsymKeypair::generate(PkeKind::X25519Sealed).unwrap();
        let seed = b"a fresh symmetric session seed!!";
        let sealed = seal(PkeKind::X25519Sealed, keypair.public_bytes(), seed).unwrap();
        assert_ne!(&sealed[X25519_PUBLIC_LEN..], &seed[..]);

        let opened = keypair.open(&sealed).unwrap();
        assert_eq!(&opened[..], &seed[..]);
    }

    #[test]
    fn open_rejects_wrong_recipient() {
        let alice = AsymKeypair::generate(PkeKind::X25519Sealed).unwrap();
        let mallory = AsymKeypair::generate(PkeKind::X25519Sealed).unwrap();
        let sealed = seal(PkeKind::X25519Sealed, alice.public_bytes(), b"secret").unwrap();
        assert!(matches!(
            mallory.open(&sealed),
            Err(CryptError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn open_rejects_tampering() {
        let keypair = AsymKeypair::generate(PkeKind::X25519Sealed).unwrap();
        let mut sealed = seal(PkeKind::X25519Sealed, keypair.public_bytes(), b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(keypair.open(&sealed).is_err());
    }

    #[test]
    fn pke_id_roundtrip() {
        let id = PkeKind::X25519Sealed.id_bytes();
        assert_eq!(PkeKind::from_id_bytes(&id).unwrap(), PkeKind::X25519Sealed);
        assert!(PkeKind::from_id_bytes(&[9]).is_err());
        assert!(PkeKind::from_id_bytes(&[]).is_err());
    }
}
