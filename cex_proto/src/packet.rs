//! The DTM packet header and frame codec.
//!
//! Every transmission is a 23-byte little-endian header followed by
//! `payload_len` bytes. The header parses zero-copy; flag namespaces are
//! nested constant modules keyed off `packet_type`.

use crate::error::DtmError;
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// `CEX\x01`
pub const DTM_MAGIC: u32 = 0x4345_5801;

/// Header length on the wire
pub const DTM_HEADER_LEN: usize = 23;

/// Default per-frame payload ceiling; transfers fragment beneath it
pub const DEFAULT_MAX_PAYLOAD: usize = 128 * 1024;

pub mod packet_type {
    pub const SERVICE: u8 = 0;
    pub const MESSAGE: u8 = 1;
    pub const CREATE: u8 = 2;
    pub const PRE_REQUEST: u8 = 3;
    pub const EXCHANGE: u8 = 4;
    pub const TRANSFER: u8 = 5;
}

/// `packet_flag` values for [packet_type::EXCHANGE] frames, in ladder order
pub mod exchange_flags {
    pub const CONNECT: u16 = 1;
    pub const INIT: u16 = 2;
    pub const PRE_AUTH: u16 = 3;
    pub const AUTH_EX: u16 = 4;
    pub const AUTH_ESTABLISHED: u16 = 5;
    pub const PRE_PRIMARY: u16 = 6;
    pub const PRIME_EX: u16 = 7;
    pub const PRIMARY_ESTABLISHED: u16 = 8;
    pub const ESTABLISHED: u16 = 9;
}

/// `packet_flag` values for [packet_type::SERVICE] frames
pub mod service_flags {
    pub const INTERNAL: u16 = 0;
    pub const REFUSAL: u16 = 1;
    pub const DISCONNECTED: u16 = 2;
    pub const RESEND: u16 = 3;
    pub const OUT_OF_SEQUENCE: u16 = 4;
    pub const DATA_LOST: u16 = 5;
    pub const TERMINATE: u16 = 6;
    pub const RESYNC: u16 = 7;
    pub const ECHO: u16 = 8;
    pub const KEEP_ALIVE: u16 = 9;
}

/// `packet_flag` values for [packet_type::MESSAGE] frames
pub mod message_flags {
    pub const COMPLETE: u16 = 0;
    pub const FRAGMENT: u16 = 1;
    pub const FRAGMENT_LAST: u16 = 2;
}

/// `packet_flag` values for [packet_type::TRANSFER] frames
pub mod transfer_flags {
    pub const HEADER: u16 = 0;
    pub const FRAGMENT: u16 = 1;
    pub const LAST: u16 = 2;
}

/// The header for each DTM packet
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Debug)]
#[repr(C)]
pub struct DtmHeader {
    pub magic: U32,
    pub payload_len: U32,
    pub packet_type: u8,
    /// Per-direction, wrapping
    pub sequence: U32,
    /// Packet-type-dependent sub-state
    pub packet_flag: U16,
    /// Frequently a timestamp or subtype discriminator
    pub option_flag: U64,
}

impl DtmHeader {
    pub fn new(
        packet_type: u8,
        sequence: u32,
        packet_flag: u16,
        option_flag: u64,
        payload_len: u32,
    ) -> Self {
        Self {
            magic: U32::new(DTM_MAGIC),
            payload_len: U32::new(payload_len),
            packet_type,
            sequence: U32::new(sequence),
            packet_flag: U16::new(packet_flag),
            option_flag: U64::new(option_flag),
        }
    }

    /// Inscribes the header onto the packet
    pub fn inscribe_into<B: BufMut>(&self, mut writer: B) {
        writer.put_slice(self.as_bytes())
    }
}

impl AsRef<[u8]> for DtmHeader {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// A decoded frame
#[derive(Debug)]
pub struct DtmPacket {
    pub header: DtmHeader,
    pub payload: BytesMut,
}

/// Frame encoder/decoder with a receive-side payload bound
#[derive(Copy, Clone, Debug)]
pub struct DtmCodec {
    max_payload: usize,
}

impl DtmCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Appends one frame to `dst`
    pub fn encode(
        &self,
        header: &DtmHeader,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), DtmError> {
        if payload.len() > self.max_payload {
            return Err(DtmError::PayloadTooLarge(payload.len()));
        }

        if header.payload_len.get() as usize != payload.len() {
            return Err(DtmError::InvalidParameter(format!(
                "header declares {} payload bytes, got {}",
                header.payload_len.get(),
                payload.len()
            )));
        }

        dst.reserve(DTM_HEADER_LEN + payload.len());
        header.inscribe_into(&mut *dst);
        dst.put_slice(payload);
        Ok(())
    }

    /// Removes one complete frame from `src`, or returns `None` until more
    /// bytes arrive
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<DtmPacket>, DtmError> {
        if src.len() < DTM_HEADER_LEN {
            return Ok(None);
        }

        let header = DtmHeader::read_from(&src[..DTM_HEADER_LEN])
            .ok_or_else(|| DtmError::Protocol("unreadable header".to_string()))?;
        self.check_header(&header)?;

        let payload_len = header.payload_len.get() as usize;
        if src.len() < DTM_HEADER_LEN + payload_len {
            return Ok(None);
        }

        src.advance(DTM_HEADER_LEN);
        let payload = src.split_to(payload_len);
        Ok(Some(DtmPacket { header, payload }))
    }

    /// Blocking frame read off a stream. A clean EOF at a frame boundary is
    /// reported as `Io`; EOF inside a frame is a truncation.
    pub fn read_frame<R: Read>(&self, stream: &mut R) -> Result<(DtmHeader, Vec<u8>), DtmError> {
        let mut header_bytes = [0u8; DTM_HEADER_LEN];
        stream.read_exact(&mut header_bytes).map_err(map_read_err)?;

        let header = DtmHeader::read_from(&header_bytes[..])
            .ok_or_else(|| DtmError::Protocol("unreadable header".to_string()))?;
        self.check_header(&header)?;

        let mut payload = vec![0u8; header.payload_len.get() as usize];
        stream.read_exact(&mut payload).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                DtmError::Protocol("truncated frame".to_string())
            } else {
                map_read_err(err)
            }
        })?;

        Ok((header, payload))
    }

    /// Blocking frame write
    pub fn write_frame<W: Write>(
        &self,
        stream: &mut W,
        header: &DtmHeader,
        payload: &[u8],
    ) -> Result<(), DtmError> {
        let mut buf = BytesMut::with_capacity(DTM_HEADER_LEN + payload.len());
        self.encode(header, payload, &mut buf)?;
        stream.write_all(&buf)?;
        stream.flush()?;
        Ok(())
    }

    fn check_header(&self, header: &DtmHeader) -> Result<(), DtmError> {
        if header.magic.get() != DTM_MAGIC {
            return Err(DtmError::Protocol(format!(
                "bad magic {:#010x}",
                header.magic.get()
            )));
        }

        if header.payload_len.get() as usize > self.max_payload {
            return Err(DtmError::PayloadTooLarge(header.payload_len.get() as usize));
        }

        Ok(())
    }
}

fn map_read_err(err: std::io::Error) -> DtmError {
    DtmError::from(err)
}
