//! Per-frame seal/open for DTM traffic.
//!
//! Each direction owns one `SessionCrypto` expanded from a session seed.
//! Frames are encrypt-then-MAC: the cipher runs under a per-frame IV formed
//! by folding the frame sequence number into the session base IV, and the
//! tag covers the header bytes followed by the ciphertext. Tags compare in
//! constant time.

use crate::error::DtmError;
use crate::packet::DtmHeader;
use cex_crypt::block_mode::{BlockModeEngine, Direction};
use cex_crypt::keyed_material::KeyMaterial;
use cex_crypt::misc::CryptError;
use cex_crypt::registry::{self, Mac};
use cex_crypt::padding;
use cex_types::crypto::{CipherDescription, CipherMode, MacKind, PaddingMode};
use cex_types::utils::const_time_compare;
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use zerocopy::AsBytes;
use zeroize::{Zeroize, Zeroizing};

/// One direction's framing cipher and MAC
pub struct SessionCrypto {
    description: CipherDescription,
    material: KeyMaterial,
    mac_kind: MacKind,
    mac_key: Zeroizing<Vec<u8>>,
    tag_len: usize,
}

impl SessionCrypto {
    /// Bytes of seed required to key one direction under `description`
    pub fn seed_len(description: &CipherDescription) -> usize {
        let mac_len = description.mac_digest.digest_size();
        description.key_bytes() + description.iv_bytes() + mac_len
    }

    /// A fresh random seed sized for `description`
    pub fn generate_seed(description: &CipherDescription) -> Zeroizing<Vec<u8>> {
        let mut seed = Zeroizing::new(vec![0u8; Self::seed_len(description)]);
        rand::thread_rng().fill_bytes(&mut seed);
        seed
    }

    /// Splits `seed` into cipher key, base IV, and MAC key
    pub fn from_seed(description: &CipherDescription, seed: &[u8]) -> Result<Self, DtmError> {
        if seed.len() != Self::seed_len(description) {
            return Err(DtmError::AuthenticationFailed(format!(
                "session seed must be {} bytes, got {}",
                Self::seed_len(description),
                seed.len()
            )));
        }

        let mac_kind = MacKind::for_digest(description.mac_digest)
            .ok_or(DtmError::Unsupported("no MAC for the described digest"))?;

        if description.mode != CipherMode::Ctr && description.padding == PaddingMode::None {
            return Err(DtmError::Unsupported(
                "chained session modes require a padding scheme",
            ));
        }

        let key_len = description.key_bytes();
        let iv_len = description.iv_bytes();
        let material = KeyMaterial::new(
            seed[..key_len].to_vec(),
            seed[key_len..key_len + iv_len].to_vec(),
            Vec::new(),
        );
        let mac_key = Zeroizing::new(seed[key_len + iv_len..].to_vec());
        let tag_len = (description.mac_digest_size as usize).min(mac_kind.digest_size());

        Ok(Self {
            description: *description,
            material,
            mac_kind,
            mac_key,
            tag_len,
        })
    }

    /// The payload length [Self::seal] will produce for `plaintext_len`
    pub fn sealed_len(&self, plaintext_len: usize) -> usize {
        let body = if self.description.mode == CipherMode::Ctr {
            plaintext_len
        } else {
            // chained modes always pad out the final block
            let block = self.description.block_bytes();
            (plaintext_len / block + 1) * block
        };
        body + self.tag_len
    }

    /// Encrypts `plaintext` for the frame described by `header` and appends
    /// the tag. `header.payload_len` must already equal
    /// [Self::sealed_len] of the plaintext.
    pub fn seal(&self, header: &DtmHeader, plaintext: &[u8]) -> Result<Vec<u8>, DtmError> {
        if header.payload_len.get() as usize != self.sealed_len(plaintext.len()) {
            return Err(DtmError::InvalidParameter(
                "header payload length does not match the sealed size".to_string(),
            ));
        }

        let mut engine = self.frame_engine(header.sequence.get(), Direction::Encrypt)?;

        let mut body = if self.description.mode == CipherMode::Ctr {
            let mut out = vec![0u8; plaintext.len()];
            engine.transform(plaintext, &mut out).map_err(seal_err)?;
            out
        } else {
            let mut padded = Zeroizing::new(plaintext.to_vec());
            padding::pad(
                self.description.padding,
                &mut padded,
                self.description.block_bytes(),
            )
            .map_err(seal_err)?;
            let mut out = vec![0u8; padded.len()];
            engine.transform(&padded, &mut out).map_err(seal_err)?;
            out
        };

        let tag = self.tag(header, &body)?;
        body.extend_from_slice(&tag[..self.tag_len]);
        Ok(body)
    }

    /// Verifies the tag and decrypts. Any mismatch is an authentication
    /// failure; the caller tears the session down.
    pub fn open(
        &self,
        header: &DtmHeader,
        payload: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, DtmError> {
        if payload.len() < self.tag_len {
            return Err(DtmError::AuthenticationFailed(
                "frame shorter than its tag".to_string(),
            ));
        }

        let (body, presented) = payload.split_at(payload.len() - self.tag_len);
        let expected = self.tag(header, body)?;
        if !const_time_compare(presented, &expected[..self.tag_len]) {
            return Err(DtmError::AuthenticationFailed(
                "frame tag mismatch".to_string(),
            ));
        }

        let mut engine = self.frame_engine(header.sequence.get(), Direction::Decrypt)?;
        let mut plaintext = Zeroizing::new(vec![0u8; body.len()]);
        engine.transform(body, &mut plaintext).map_err(open_err)?;

        if self.description.mode != CipherMode::Ctr {
            let keep = padding::unpad(
                self.description.padding,
                &plaintext,
                self.description.block_bytes(),
            )
            .map_err(open_err)?;
            plaintext.truncate(keep);
        }

        Ok(plaintext)
    }

    /// SHA-256 over the cipher key; safe to surface to the host
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.material.key());
        hasher.finalize().into()
    }

    /// A keyed MAC over this direction's MAC key, for transfer chains
    pub fn transfer_mac(&self) -> Result<Box<dyn Mac>, DtmError> {
        let mut mac = registry::mac_of(self.mac_kind)?;
        mac.init(&self.mac_key)?;
        Ok(mac)
    }

    /// Overwrites all key material in place
    pub fn scrub(&mut self) {
        self.material.scrub();
        self.mac_key.zeroize();
    }

    pub fn is_scrubbed(&self) -> bool {
        self.material.is_scrubbed() && self.mac_key.iter().all(|b| *b == 0)
    }

    fn frame_engine(
        &self,
        sequence: u32,
        direction: Direction,
    ) -> Result<BlockModeEngine, DtmError> {
        let mut iv = self.material.iv().to_vec();
        let seq_bytes = sequence.to_le_bytes();
        let fold = iv.len().saturating_sub(4);
        for (slot, byte) in iv[fold..].iter_mut().zip(seq_bytes) {
            *slot ^= byte;
        }

        let key = KeyMaterial::new(self.material.key().to_vec(), iv, Vec::new());
        let mut engine =
            BlockModeEngine::from_description(&self.description).map_err(DtmError::from)?;
        engine.init(direction, &key).map_err(DtmError::from)?;
        Ok(engine)
    }

    fn tag(&self, header: &DtmHeader, ciphertext: &[u8]) -> Result<Vec<u8>, DtmError> {
        let mut mac = registry::mac_of(self.mac_kind)?;
        mac.init(&self.mac_key)?;
        mac.update(header.as_bytes())?;
        mac.update(ciphertext)?;
        let mut tag = vec![0u8; mac.digest_size()];
        mac.finalize(&mut tag)?;
        Ok(tag)
    }
}

/// A running MAC over a fragment stream: each tag covers the previous tag
/// and the new chunk, so the final tag authenticates the whole file
pub struct ChainedMac {
    mac: Box<dyn Mac>,
    last: Vec<u8>,
}

impl ChainedMac {
    pub fn new(mac: Box<dyn Mac>) -> Self {
        Self {
            mac,
            last: Vec::new(),
        }
    }

    pub fn tag_len(&self) -> usize {
        self.mac.digest_size()
    }

    /// Absorbs `chunk` and returns the chain tag for it
    pub fn next(&mut self, chunk: &[u8]) -> Result<Vec<u8>, DtmError> {
        self.mac.update(&self.last)?;
        self.mac.update(chunk)?;
        let mut tag = vec![0u8; self.mac.digest_size()];
        self.mac.finalize(&mut tag)?;
        self.last = tag.clone();
        Ok(tag)
    }

    /// Recomputes the chain for `chunk` and compares against the presented
    /// tag in constant time
    pub fn verify_next(&mut self, chunk: &[u8], presented: &[u8]) -> Result<(), DtmError> {
        let expected = self.next(chunk)?;
        if !const_time_compare(presented, &expected) {
            return Err(DtmError::AuthenticationFailed(
                "transfer chain tag mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

fn seal_err(err: CryptError) -> DtmError {
    DtmError::AuthenticationFailed(format!("seal failure: {}", err.into_string()))
}

fn open_err(err: CryptError) -> DtmError {
    DtmError::AuthenticationFailed(format!("open failure: {}", err.into_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{packet_type, DtmHeader};

    fn crypto_pair() -> (SessionCrypto, SessionCrypto) {
        let description = CipherDescription::rijndael_ctr_256();
        let seed = SessionCrypto::generate_seed(&description);
        let sealer = SessionCrypto::from_seed(&description, &seed).unwrap();
        let opener = SessionCrypto::from_seed(&description, &seed).unwrap();
        (sealer, opener)
    }

    fn header_for(crypto: &SessionCrypto, sequence: u32, plaintext_len: usize) -> DtmHeader {
        DtmHeader::new(
            packet_type::MESSAGE,
            sequence,
            0,
            0,
            crypto.sealed_len(plaintext_len) as u32,
        )
    }

    #[test]
    fn seal_open_roundtrip() {
        let (sealer, opener) = crypto_pair();
        let header = header_for(&sealer, 5, 32);
        let sealed = sealer.seal(&header, &[0x42; 32]).unwrap();
        assert_eq!(sealed.len(), sealer.sealed_len(32));
        let opened = opener.open(&header, &sealed).unwrap();
        assert_eq!(&opened[..], &[0x42; 32]);
    }

    #[test]
    fn tampered_frames_are_rejected() {
        let (sealer, opener) = crypto_pair();
        let header = header_for(&sealer, 9, 16);
        let mut sealed = sealer.seal(&header, &[7u8; 16]).unwrap();
        sealed[3] ^= 0x80;
        assert!(matches!(
            opener.open(&header, &sealed),
            Err(DtmError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn header_is_bound_into_the_tag() {
        let (sealer, opener) = crypto_pair();
        let header = header_for(&sealer, 3, 16);
        let sealed = sealer.seal(&header, &[7u8; 16]).unwrap();

        let mut altered = header.clone();
        altered.option_flag = zerocopy::byteorder::little_endian::U64::new(0xDEAD);
        assert!(opener.open(&altered, &sealed).is_err());
    }

    #[test]
    fn sequence_changes_the_ciphertext() {
        let (sealer, _) = crypto_pair();
        let first = sealer
            .seal(&header_for(&sealer, 1, 16), &[0xAA; 16])
            .unwrap();
        let second = sealer
            .seal(&header_for(&sealer, 2, 16), &[0xAA; 16])
            .unwrap();
        assert_ne!(first[..16], second[..16]);
    }

    #[test]
    fn scrub_is_observable() {
        let (mut sealer, _) = crypto_pair();
        assert!(!sealer.is_scrubbed());
        sealer.scrub();
        assert!(sealer.is_scrubbed());
    }

    #[test]
    fn cbc_sessions_pad_and_unpad() {
        let description = CipherDescription::rijndael_cbc_256();
        let seed = SessionCrypto::generate_seed(&description);
        let sealer = SessionCrypto::from_seed(&description, &seed).unwrap();
        let opener = SessionCrypto::from_seed(&description, &seed).unwrap();

        let header = DtmHeader::new(packet_type::MESSAGE, 1, 0, 0, sealer.sealed_len(20) as u32);
        let sealed = sealer.seal(&header, &[9u8; 20]).unwrap();
        let opened = opener.open(&header, &sealed).unwrap();
        assert_eq!(&opened[..], &[9u8; 20]);
    }
}
