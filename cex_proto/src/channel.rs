//! The two halves of a DTM frame channel.
//!
//! The writer owns the outbound sequence counter and keeps the last frame
//! for retransmission; the reader owns the socket's read half. Both halves
//! hold their own clone of the underlying stream so the exchange driver,
//! the keep-alive timer, and host sends can share the writer behind a lock
//! while the receive thread owns the reader outright.

use crate::error::DtmError;
use crate::packet::{packet_type, DtmCodec, DtmHeader, DTM_HEADER_LEN};
use bytes::BytesMut;
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

pub struct FrameWriter {
    stream: TcpStream,
    codec: DtmCodec,
    tx_seq: u32,
    last_frame: Option<(DtmHeader, Vec<u8>)>,
}

impl FrameWriter {
    pub fn new(stream: TcpStream, codec: DtmCodec) -> Self {
        Self {
            stream,
            codec,
            tx_seq: 0,
            last_frame: None,
        }
    }

    /// The sequence number the next frame will carry
    pub fn next_seq(&self) -> u32 {
        self.tx_seq
    }

    /// Writes a frame whose header was built against [Self::next_seq],
    /// advances the counter, and remembers the frame for retransmission
    pub fn send(&mut self, header: DtmHeader, payload: Vec<u8>) -> Result<(), DtmError> {
        if header.sequence.get() != self.tx_seq {
            return Err(DtmError::InvalidParameter(format!(
                "frame sequence {} built against stale counter {}",
                header.sequence.get(),
                self.tx_seq
            )));
        }

        self.codec.write_frame(&mut self.stream, &header, &payload)?;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        self.last_frame = Some((header, payload));
        Ok(())
    }

    /// Control frames ride outside the sequenced stream: they carry the
    /// current counter for observability but do not advance it, and are
    /// never retransmitted
    pub fn send_service(&mut self, flag: u16, option: u64) -> Result<(), DtmError> {
        let header = DtmHeader::new(packet_type::SERVICE, self.tx_seq, flag, option, 0);
        self.codec.write_frame(&mut self.stream, &header, &[])
    }

    /// Replays the most recent frame with its original sequence number
    pub fn resend_last(&mut self) -> Result<(), DtmError> {
        match &self.last_frame {
            Some((header, payload)) => self.codec.write_frame(&mut self.stream, header, payload),
            None => Err(DtmError::Protocol("nothing to resend".to_string())),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

pub struct FrameReader {
    stream: TcpStream,
    codec: DtmCodec,
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new(stream: TcpStream, codec: DtmCodec) -> Self {
        Self {
            stream,
            codec,
            buffer: BytesMut::with_capacity(DTM_HEADER_LEN + codec.max_payload()),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), DtmError> {
        self.stream.set_read_timeout(timeout).map_err(DtmError::from)
    }

    /// Blocks for the next frame. Partial frames survive read timeouts in
    /// the accumulation buffer, so a poll tick never desyncs the stream.
    pub fn recv(&mut self) -> Result<(DtmHeader, Vec<u8>), DtmError> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buffer)? {
                return Ok((packet.header, packet.payload.to_vec()));
            }

            let mut chunk = [0u8; 8192];
            let read = self.stream.read(&mut chunk).map_err(DtmError::from)?;
            if read == 0 {
                return Err(if self.buffer.is_empty() {
                    DtmError::Io("connection closed".to_string())
                } else {
                    DtmError::Protocol("truncated frame".to_string())
                });
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Builds both halves over clones of `stream`
pub fn split(stream: TcpStream, codec: DtmCodec) -> Result<(FrameReader, FrameWriter), DtmError> {
    let read_half = stream.try_clone()?;
    Ok((
        FrameReader::new(read_half, codec),
        FrameWriter::new(stream, codec),
    ))
}
