//! Primitive lookup by kind tag.
//!
//! Every primitive family is reached through a small constructor function
//! keyed by its [cex_types] kind enum, so adding a provider touches only
//! this module, never the call sites. Unknown or provider-less kinds fail
//! with [CryptError::Unsupported].

use crate::keyed_material::KeyMaterial;
use crate::misc::CryptError;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use cex_types::crypto::{BlockCipherKind, DigestKind, MacKind, PrngKind, StreamCipherKind};
use chacha20::cipher::{KeyIvInit, StreamCipher as _};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac as HmacMacTrait};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::{Sha256, Sha512};
use sha3::{Keccak256, Keccak512};

/// Whether a cipher is keyed for encryption or decryption
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// A raw block transform. Implementations are cheap to clone once keyed;
/// the parallel engine clones one instance per worker.
pub trait BlockCipher: Send + Sync {
    fn name(&self) -> &'static str;
    fn block_size(&self) -> usize;
    fn is_initialized(&self) -> bool;
    fn init(&mut self, direction: Direction, key: &KeyMaterial) -> Result<(), CryptError>;
    /// Transforms exactly one block; `input` and `output` must both be
    /// `block_size` bytes
    fn transform_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptError>;
    /// A fresh handle sharing this instance's key schedule
    fn clone_instance(&self) -> Box<dyn BlockCipher>;
}

/// A keystream transform over arbitrary-length slices
pub trait StreamCipher: Send {
    fn name(&self) -> &'static str;
    fn init(&mut self, key: &KeyMaterial) -> Result<(), CryptError>;
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CryptError>;
}

/// Incremental hash
pub trait Digest: Send {
    fn name(&self) -> &'static str;
    fn block_size(&self) -> usize;
    fn digest_size(&self) -> usize;
    fn update(&mut self, input: &[u8]);
    /// Writes the digest into `into` and resets the state
    fn finalize(&mut self, into: &mut [u8]) -> Result<(), CryptError>;
    fn reset(&mut self);
}

/// Keyed incremental authenticator; as [Digest] plus a key
pub trait Mac: Send {
    fn name(&self) -> &'static str;
    fn key_size(&self) -> usize;
    fn block_size(&self) -> usize;
    fn digest_size(&self) -> usize;
    fn init(&mut self, key: &[u8]) -> Result<(), CryptError>;
    fn update(&mut self, input: &[u8]) -> Result<(), CryptError>;
    /// Writes the tag into `into` and resets to the keyed initial state
    fn finalize(&mut self, into: &mut [u8]) -> Result<(), CryptError>;
    fn reset(&mut self);
}

/// Deterministic or OS-backed random source
pub trait Prng: Send {
    fn name(&self) -> &'static str;
    fn fill(&mut self, dest: &mut [u8]);
    fn next_u32(&mut self) -> u32;
}

/// Returns a fresh, un-keyed block cipher for `kind`
pub fn block_cipher_of(kind: BlockCipherKind) -> Result<Box<dyn BlockCipher>, CryptError> {
    match kind {
        BlockCipherKind::Rijndael => Ok(Box::new(RijndaelCipher::default())),
        BlockCipherKind::Serpent => Err(CryptError::Unsupported("no Serpent provider")),
        BlockCipherKind::Twofish => Err(CryptError::Unsupported("no Twofish provider")),
    }
}

/// Returns a fresh, un-keyed stream cipher for `kind`
pub fn stream_cipher_of(kind: StreamCipherKind) -> Result<Box<dyn StreamCipher>, CryptError> {
    match kind {
        StreamCipherKind::ChaCha => Ok(Box::new(ChaChaCipher::default())),
    }
}

/// Returns a fresh digest for `kind`
pub fn digest_of(kind: DigestKind) -> Result<Box<dyn Digest>, CryptError> {
    match kind {
        DigestKind::Sha256 => Ok(Box::new(RustCryptoDigest {
            inner: <Sha256 as sha2::Digest>::new(),
            kind,
            name: "SHA-256",
        })),
        DigestKind::Sha512 => Ok(Box::new(RustCryptoDigest {
            inner: <Sha512 as sha2::Digest>::new(),
            kind,
            name: "SHA-512",
        })),
        DigestKind::Keccak256 => Ok(Box::new(RustCryptoDigest {
            inner: <Keccak256 as sha3::Digest>::new(),
            kind,
            name: "Keccak-256",
        })),
        DigestKind::Keccak512 => Ok(Box::new(RustCryptoDigest {
            inner: <Keccak512 as sha3::Digest>::new(),
            kind,
            name: "Keccak-512",
        })),
        DigestKind::None => Err(CryptError::Unsupported("digest kind None")),
    }
}

/// Returns a fresh, un-keyed MAC for `kind`
pub fn mac_of(kind: MacKind) -> Result<Box<dyn Mac>, CryptError> {
    Ok(Box::new(HmacMac { kind, inner: None }))
}

/// Returns a fresh PRNG for `kind`
pub fn prng_of(kind: PrngKind) -> Result<Box<dyn Prng>, CryptError> {
    match kind {
        PrngKind::Os => Ok(Box::new(OsPrng)),
        PrngKind::Std => Ok(Box::new(StdPrng(StdRng::from_entropy()))),
    }
}

const RIJNDAEL_BLOCK_SIZE: usize = 16;

#[derive(Clone)]
enum RijndaelKeyed {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

/// Rijndael with the AES-standard 128-bit block, keyed at 128/192/256 bits
#[derive(Clone, Default)]
pub struct RijndaelCipher {
    keyed: Option<(Direction, RijndaelKeyed)>,
}

impl BlockCipher for RijndaelCipher {
    fn name(&self) -> &'static str {
        "Rijndael"
    }

    fn block_size(&self) -> usize {
        RIJNDAEL_BLOCK_SIZE
    }

    fn is_initialized(&self) -> bool {
        self.keyed.is_some()
    }

    fn init(&mut self, direction: Direction, key: &KeyMaterial) -> Result<(), CryptError> {
        let keyed = match key.key().len() {
            16 => RijndaelKeyed::Aes128(
                Aes128::new_from_slice(key.key())
                    .map_err(|err| CryptError::InvalidParameter(err.to_string()))?,
            ),
            24 => RijndaelKeyed::Aes192(
                Aes192::new_from_slice(key.key())
                    .map_err(|err| CryptError::InvalidParameter(err.to_string()))?,
            ),
            32 => RijndaelKeyed::Aes256(
                Aes256::new_from_slice(key.key())
                    .map_err(|err| CryptError::InvalidParameter(err.to_string()))?,
            ),
            n => {
                return Err(CryptError::InvalidParameter(format!(
                    "Rijndael key must be 16, 24, or 32 bytes, got {n}"
                )))
            }
        };

        self.keyed = Some((direction, keyed));
        Ok(())
    }

    fn transform_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptError> {
        let (direction, keyed) = self.keyed.as_ref().ok_or(CryptError::NotInitialized)?;
        if input.len() != RIJNDAEL_BLOCK_SIZE || output.len() != RIJNDAEL_BLOCK_SIZE {
            return Err(CryptError::InvalidParameter(format!(
                "block transform requires {RIJNDAEL_BLOCK_SIZE}-byte slices"
            )));
        }

        let mut block = aes::Block::clone_from_slice(input);
        match (keyed, direction) {
            (RijndaelKeyed::Aes128(cipher), Direction::Encrypt) => cipher.encrypt_block(&mut block),
            (RijndaelKeyed::Aes128(cipher), Direction::Decrypt) => cipher.decrypt_block(&mut block),
            (RijndaelKeyed::Aes192(cipher), Direction::Encrypt) => cipher.encrypt_block(&mut block),
            (RijndaelKeyed::Aes192(cipher), Direction::Decrypt) => cipher.decrypt_block(&mut block),
            (RijndaelKeyed::Aes256(cipher), Direction::Encrypt) => cipher.encrypt_block(&mut block),
            (RijndaelKeyed::Aes256(cipher), Direction::Decrypt) => cipher.decrypt_block(&mut block),
        }

        output.copy_from_slice(&block);
        Ok(())
    }

    fn clone_instance(&self) -> Box<dyn BlockCipher> {
        Box::new(self.clone())
    }
}

const CHACHA_KEY_LEN: usize = 32;
const CHACHA_NONCE_LEN: usize = 12;

/// ChaCha20 keystream cipher
#[derive(Default)]
pub struct ChaChaCipher {
    inner: Option<ChaCha20>,
}

impl StreamCipher for ChaChaCipher {
    fn name(&self) -> &'static str {
        "ChaCha20"
    }

    fn init(&mut self, key: &KeyMaterial) -> Result<(), CryptError> {
        if key.key().len() != CHACHA_KEY_LEN || key.iv().len() != CHACHA_NONCE_LEN {
            return Err(CryptError::InvalidParameter(format!(
                "ChaCha20 requires a {CHACHA_KEY_LEN}-byte key and {CHACHA_NONCE_LEN}-byte nonce"
            )));
        }

        self.inner = Some(ChaCha20::new(
            chacha20::Key::from_slice(key.key()),
            chacha20::Nonce::from_slice(key.iv()),
        ));
        Ok(())
    }

    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CryptError> {
        let inner = self.inner.as_mut().ok_or(CryptError::NotInitialized)?;
        if input.len() != output.len() {
            return Err(CryptError::InvalidParameter(
                "input and output lengths differ".to_string(),
            ));
        }

        output.copy_from_slice(input);
        inner.apply_keystream(output);
        Ok(())
    }
}

struct RustCryptoDigest<D> {
    inner: D,
    kind: DigestKind,
    name: &'static str,
}

impl<D> Digest for RustCryptoDigest<D>
where
    D: sha2::Digest + sha2::digest::FixedOutputReset + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn block_size(&self) -> usize {
        self.kind.block_size()
    }

    fn digest_size(&self) -> usize {
        self.kind.digest_size()
    }

    fn update(&mut self, input: &[u8]) {
        sha2::Digest::update(&mut self.inner, input);
    }

    fn finalize(&mut self, into: &mut [u8]) -> Result<(), CryptError> {
        let size = self.digest_size();
        if into.len() < size {
            return Err(CryptError::InvalidParameter(format!(
                "output buffer smaller than digest size {size}"
            )));
        }

        let output = sha2::Digest::finalize_reset(&mut self.inner);
        into[..size].copy_from_slice(&output);
        Ok(())
    }

    fn reset(&mut self) {
        sha2::Digest::reset(&mut self.inner);
    }
}

enum HmacImpl {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

struct HmacMac {
    kind: MacKind,
    inner: Option<HmacImpl>,
}

impl Mac for HmacMac {
    fn name(&self) -> &'static str {
        match self.kind {
            MacKind::HmacSha256 => "HMAC-SHA-256",
            MacKind::HmacSha512 => "HMAC-SHA-512",
        }
    }

    fn key_size(&self) -> usize {
        self.digest_size()
    }

    fn block_size(&self) -> usize {
        match self.kind {
            MacKind::HmacSha256 => 64,
            MacKind::HmacSha512 => 128,
        }
    }

    fn digest_size(&self) -> usize {
        self.kind.digest_size()
    }

    fn init(&mut self, key: &[u8]) -> Result<(), CryptError> {
        let inner = match self.kind {
            MacKind::HmacSha256 => HmacImpl::Sha256(
                HmacMacTrait::new_from_slice(key)
                    .map_err(|err| CryptError::InvalidParameter(err.to_string()))?,
            ),
            MacKind::HmacSha512 => HmacImpl::Sha512(
                HmacMacTrait::new_from_slice(key)
                    .map_err(|err| CryptError::InvalidParameter(err.to_string()))?,
            ),
        };

        self.inner = Some(inner);
        Ok(())
    }

    fn update(&mut self, input: &[u8]) -> Result<(), CryptError> {
        match self.inner.as_mut().ok_or(CryptError::NotInitialized)? {
            HmacImpl::Sha256(mac) => mac.update(input),
            HmacImpl::Sha512(mac) => mac.update(input),
        }
        Ok(())
    }

    fn finalize(&mut self, into: &mut [u8]) -> Result<(), CryptError> {
        let size = self.digest_size();
        if into.len() < size {
            return Err(CryptError::InvalidParameter(format!(
                "output buffer smaller than tag size {size}"
            )));
        }

        match self.inner.as_mut().ok_or(CryptError::NotInitialized)? {
            HmacImpl::Sha256(mac) => {
                into[..size].copy_from_slice(&mac.finalize_reset().into_bytes())
            }
            HmacImpl::Sha512(mac) => {
                into[..size].copy_from_slice(&mac.finalize_reset().into_bytes())
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            match inner {
                HmacImpl::Sha256(mac) => mac.reset(),
                HmacImpl::Sha512(mac) => mac.reset(),
            }
        }
    }
}

struct OsPrng;

impl Prng for OsPrng {
    fn name(&self) -> &'static str {
        "OS"
    }

    fn fill(&mut self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    fn next_u32(&mut self) -> u32 {
        OsRng.next_u32()
    }
}

struct StdPrng(StdRng);

impl Prng for StdPrng {
    fn name(&self) -> &'static str {
        "Std"
    }

    fn fill(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest);
    }

    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
}
