use crate::errors::Error;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

/// The serialized length of a [CipherDescription]
pub const CIPHER_DESCRIPTION_LEN: usize = 32;

/// Block cipher families selectable through the primitive registry
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockCipherKind {
    Rijndael = 1,
    Serpent = 2,
    Twofish = 3,
}

impl BlockCipherKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Rijndael),
            2 => Some(Self::Serpent),
            3 => Some(Self::Twofish),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Stream cipher families selectable through the primitive registry
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamCipherKind {
    ChaCha = 32,
}

impl StreamCipherKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            32 => Some(Self::ChaCha),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Digest families selectable through the primitive registry
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DigestKind {
    None = 0,
    Sha256 = 1,
    Sha512 = 2,
    Keccak256 = 3,
    Keccak512 = 4,
}

impl DigestKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::None),
            1 => Some(Self::Sha256),
            2 => Some(Self::Sha512),
            3 => Some(Self::Keccak256),
            4 => Some(Self::Keccak512),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Output length in bytes, zero for `None`
    pub fn digest_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Sha256 | Self::Keccak256 => 32,
            Self::Sha512 | Self::Keccak512 => 64,
        }
    }

    /// Internal block length in bytes, zero for `None`
    pub fn block_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Sha256 => 64,
            Self::Sha512 => 128,
            Self::Keccak256 => 136,
            Self::Keccak512 => 72,
        }
    }
}

/// MAC families selectable through the primitive registry
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MacKind {
    HmacSha256 = 1,
    HmacSha512 = 2,
}

impl MacKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::HmacSha256),
            2 => Some(Self::HmacSha512),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn digest_size(self) -> usize {
        match self {
            Self::HmacSha256 => 32,
            Self::HmacSha512 => 64,
        }
    }

    /// The MAC kind paired with a digest kind, if one exists
    pub fn for_digest(digest: DigestKind) -> Option<Self> {
        match digest {
            DigestKind::Sha256 => Some(Self::HmacSha256),
            DigestKind::Sha512 => Some(Self::HmacSha512),
            _ => None,
        }
    }
}

/// PRNG families selectable through the primitive registry
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrngKind {
    Os = 1,
    Std = 2,
}

impl PrngKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Os),
            2 => Some(Self::Std),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Block cipher chaining modes
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CipherMode {
    Ctr = 1,
    Cbc = 2,
    Cfb = 3,
    Ofb = 4,
}

impl CipherMode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Ctr),
            2 => Some(Self::Cbc),
            3 => Some(Self::Cfb),
            4 => Some(Self::Ofb),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Block padding schemes
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PaddingMode {
    None = 0,
    Pkcs7 = 1,
    X923 = 2,
    Iso7816 = 3,
    Tbc = 4,
}

impl PaddingMode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::None),
            1 => Some(Self::Pkcs7),
            2 => Some(Self::X923),
            3 => Some(Self::Iso7816),
            4 => Some(Self::Tbc),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The engine selector of a [CipherDescription]: either a block cipher
/// (driven through a chaining mode) or a raw stream cipher.
///
/// Block kinds occupy tags 1..=31 on the wire, stream kinds 32..
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CipherEngine {
    Block(BlockCipherKind),
    Stream(StreamCipherKind),
}

impl CipherEngine {
    pub fn from_u16(val: u16) -> Option<Self> {
        let tag = u8::try_from(val).ok()?;
        if tag < 32 {
            BlockCipherKind::from_u8(tag).map(Self::Block)
        } else {
            StreamCipherKind::from_u8(tag).map(Self::Stream)
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Block(kind) => kind.as_u8() as u16,
            Self::Stream(kind) => kind.as_u8() as u16,
        }
    }
}

/// The fixed-size record describing a symmetric cipher configuration.
///
/// Two descriptions are equal iff every field is equal. The 32-byte
/// little-endian wire layout is an external contract; do not reorder fields
/// in [Self::write_into].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CipherDescription {
    pub engine: CipherEngine,
    pub key_bits: u16,
    pub iv_bits: u16,
    pub mode: CipherMode,
    pub padding: PaddingMode,
    pub block_bits: u16,
    pub rounds: u16,
    pub kdf_digest: DigestKind,
    pub mac_digest_size: u16,
    pub mac_digest: DigestKind,
}

impl CipherDescription {
    /// Rijndael-256 in counter mode with HMAC-SHA-256 authentication; the
    /// default session configuration
    pub fn rijndael_ctr_256() -> Self {
        Self {
            engine: CipherEngine::Block(BlockCipherKind::Rijndael),
            key_bits: 256,
            iv_bits: 128,
            mode: CipherMode::Ctr,
            padding: PaddingMode::None,
            block_bits: 128,
            rounds: 14,
            kdf_digest: DigestKind::Sha256,
            mac_digest_size: 32,
            mac_digest: DigestKind::Sha256,
        }
    }

    /// Rijndael-256 in CBC mode with PKCS7 padding
    pub fn rijndael_cbc_256() -> Self {
        Self {
            padding: PaddingMode::Pkcs7,
            mode: CipherMode::Cbc,
            ..Self::rijndael_ctr_256()
        }
    }

    pub fn key_bytes(&self) -> usize {
        self.key_bits as usize / 8
    }

    pub fn iv_bytes(&self) -> usize {
        self.iv_bits as usize / 8
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bits as usize / 8
    }

    /// Writes the 32-byte wire form into `out`
    pub fn write_into(&self, out: &mut [u8; CIPHER_DESCRIPTION_LEN]) {
        out.fill(0);
        out[0..2].copy_from_slice(&self.engine.as_u16().to_le_bytes());
        out[2..4].copy_from_slice(&self.key_bits.to_le_bytes());
        out[4..6].copy_from_slice(&self.iv_bits.to_le_bytes());
        out[6] = self.mode.as_u8();
        out[7] = self.padding.as_u8();
        out[8..10].copy_from_slice(&self.block_bits.to_le_bytes());
        out[10..12].copy_from_slice(&self.rounds.to_le_bytes());
        out[12] = self.kdf_digest.as_u8();
        out[13..15].copy_from_slice(&self.mac_digest_size.to_le_bytes());
        out[15] = self.mac_digest.as_u8();
        // bytes 16..32 are reserved-zero
    }

    pub fn to_bytes(&self) -> [u8; CIPHER_DESCRIPTION_LEN] {
        let mut out = [0u8; CIPHER_DESCRIPTION_LEN];
        self.write_into(&mut out);
        out
    }

    pub fn from_bytes(input: &[u8]) -> Result<Self, Error> {
        if input.len() < CIPHER_DESCRIPTION_LEN {
            return Err(Error::InvalidLength);
        }

        let engine = CipherEngine::from_u16(u16::from_le_bytes([input[0], input[1]]))
            .ok_or(Error::UnknownKind("engine"))?;
        let mode = CipherMode::from_u8(input[6]).ok_or(Error::UnknownKind("mode"))?;
        let padding = PaddingMode::from_u8(input[7]).ok_or(Error::UnknownKind("padding"))?;
        let kdf_digest = DigestKind::from_u8(input[12]).ok_or(Error::UnknownKind("kdf_digest"))?;
        let mac_digest = DigestKind::from_u8(input[15]).ok_or(Error::UnknownKind("mac_digest"))?;

        Ok(Self {
            engine,
            key_bits: u16::from_le_bytes([input[2], input[3]]),
            iv_bits: u16::from_le_bytes([input[4], input[5]]),
            mode,
            padding,
            block_bits: u16::from_le_bytes([input[8], input[9]]),
            rounds: u16::from_le_bytes([input[10], input[11]]),
            kdf_digest,
            mac_digest_size: u16::from_le_bytes([input[13], input[14]]),
            mac_digest,
        })
    }
}

impl Debug for CipherDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}-{}/{:?}/{:?}",
            self.engine, self.key_bits, self.mode, self.mac_digest
        )
    }
}
