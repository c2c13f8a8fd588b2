//! Block padding schemes.
//!
//! `pad` extends the final partial block of `data` to a whole block;
//! `unpad` returns the payload length of a padded final block. `None`
//! requires already-aligned input.

use crate::misc::CryptError;
use cex_types::crypto::PaddingMode;

/// Appends padding so `data.len()` becomes a multiple of `block_size`.
/// All schemes except `None` always add at least one byte.
pub fn pad(mode: PaddingMode, data: &mut Vec<u8>, block_size: usize) -> Result<(), CryptError> {
    if block_size == 0 || block_size > 255 {
        return Err(CryptError::InvalidParameter(
            "padding requires a block size in 1..=255".to_string(),
        ));
    }

    let fill = block_size - (data.len() % block_size);
    match mode {
        PaddingMode::None => {
            if fill != block_size {
                return Err(CryptError::InvalidParameter(
                    "input is not block-aligned and padding is disabled".to_string(),
                ));
            }
        }
        PaddingMode::Pkcs7 => data.extend(std::iter::repeat(fill as u8).take(fill)),
        PaddingMode::X923 => {
            data.extend(std::iter::repeat(0u8).take(fill - 1));
            data.push(fill as u8);
        }
        PaddingMode::Iso7816 => {
            data.push(0x80);
            data.extend(std::iter::repeat(0u8).take(fill - 1));
        }
        PaddingMode::Tbc => {
            // trailing bit complement of the last payload bit
            let filler = match data.last() {
                Some(last) if last & 1 == 1 => 0x00,
                _ => 0xFF,
            };
            data.extend(std::iter::repeat(filler).take(fill));
        }
    }

    Ok(())
}

/// Returns the payload length of `data` after stripping the padding from
/// its final block
pub fn unpad(mode: PaddingMode, data: &[u8], block_size: usize) -> Result<usize, CryptError> {
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(CryptError::InvalidParameter(
            "padded input must be a non-empty multiple of the block size".to_string(),
        ));
    }

    match mode {
        PaddingMode::None => Ok(data.len()),
        PaddingMode::Pkcs7 => {
            let fill = *data.last().expect("non-empty") as usize;
            if fill == 0 || fill > block_size || fill > data.len() {
                return Err(CryptError::InvalidParameter("corrupt PKCS7 padding".to_string()));
            }
            if !data[data.len() - fill..].iter().all(|b| *b as usize == fill) {
                return Err(CryptError::InvalidParameter("corrupt PKCS7 padding".to_string()));
            }
            Ok(data.len() - fill)
        }
        PaddingMode::X923 => {
            let fill = *data.last().expect("non-empty") as usize;
            if fill == 0 || fill > block_size || fill > data.len() {
                return Err(CryptError::InvalidParameter("corrupt X923 padding".to_string()));
            }
            if !data[data.len() - fill..data.len() - 1].iter().all(|b| *b == 0) {
                return Err(CryptError::InvalidParameter("corrupt X923 padding".to_string()));
            }
            Ok(data.len() - fill)
        }
        PaddingMode::Iso7816 => {
            let marker = data
                .iter()
                .rposition(|b| *b == 0x80)
                .ok_or_else(|| CryptError::InvalidParameter("corrupt ISO7816 padding".to_string()))?;
            if data.len() - marker > block_size || !data[marker + 1..].iter().all(|b| *b == 0) {
                return Err(CryptError::InvalidParameter("corrupt ISO7816 padding".to_string()));
            }
            Ok(marker)
        }
        PaddingMode::Tbc => {
            let filler = *data.last().expect("non-empty");
            let payload_end = data
                .iter()
                .rposition(|b| *b != filler)
                .map(|idx| idx + 1)
                .unwrap_or(0);
            // the pad never spans more than one block
            if data.len() - payload_end > block_size {
                return Ok(data.len() - block_size);
            }
            Ok(payload_end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PaddingMode::Pkcs7)]
    #[case(PaddingMode::X923)]
    #[case(PaddingMode::Iso7816)]
    fn pad_roundtrip(#[case] mode: PaddingMode) {
        for len in [0usize, 1, 15, 16, 17, 31] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut padded = payload.clone();
            pad(mode, &mut padded, 16).unwrap();
            assert_eq!(padded.len() % 16, 0);
            assert!(padded.len() > payload.len());
            let recovered = unpad(mode, &padded, 16).unwrap();
            assert_eq!(&padded[..recovered], &payload[..]);
        }
    }

    #[test]
    fn tbc_roundtrip_odd_and_even_tails() {
        for tail in [0x02u8, 0x03] {
            let payload = vec![0x10, 0x20, tail];
            let mut padded = payload.clone();
            pad(PaddingMode::Tbc, &mut padded, 16).unwrap();
            assert_eq!(padded.len(), 16);
            let recovered = unpad(PaddingMode::Tbc, &padded, 16).unwrap();
            assert_eq!(&padded[..recovered], &payload[..]);
        }
    }

    #[test]
    fn none_requires_alignment() {
        let mut unaligned = vec![0u8; 15];
        assert!(pad(PaddingMode::None, &mut unaligned, 16).is_err());
        let mut aligned = vec![0u8; 32];
        pad(PaddingMode::None, &mut aligned, 16).unwrap();
        assert_eq!(aligned.len(), 32);
    }

    #[test]
    fn corrupt_pkcs7_is_rejected() {
        let mut padded = vec![1u8; 12];
        pad(PaddingMode::Pkcs7, &mut padded, 16).unwrap();
        let last = padded.len() - 1;
        padded[last] = 0x11;
        assert!(unpad(PaddingMode::Pkcs7, &padded, 16).is_err());
    }
}
