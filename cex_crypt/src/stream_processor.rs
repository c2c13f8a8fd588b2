//! Sequential and concurrent drivers over digests, MACs, and cipher modes.
//!
//! Concurrent mode splits work across a reader thread that fills fixed-size
//! buffers from the source and a consumer that feeds them to the primitive
//! in FIFO order through a bounded queue, so output is identical to the
//! sequential path. Concurrency is inhibited for short inputs and
//! non-file-backed sources; those fall back to the sequential path
//! transparently.

use crate::block_mode::{BlockModeEngine, Direction};
use crate::misc::CryptError;
use crate::padding;
use crate::registry::{Digest, Mac};
use cex_logging::trace;
use cex_types::crypto::{CipherMode, PaddingMode};
use crossbeam_channel::bounded;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Default reader buffer; a multiple of every primitive block size in the
/// registry
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffers in flight between reader and consumer. Bounded so a stalled
/// consumer exerts backpressure on the reader instead of growing the queue.
const PIPELINE_DEPTH: usize = 4;

/// A length-aware byte source for the stream processor
pub trait StreamSource: Read + Send {
    fn stream_len(&self) -> std::io::Result<u64>;
    /// Only file-backed sources are worth a reader thread
    fn is_file_backed(&self) -> bool;
}

impl StreamSource for std::fs::File {
    fn stream_len(&self) -> std::io::Result<u64> {
        self.metadata().map(|meta| meta.len())
    }

    fn is_file_backed(&self) -> bool {
        true
    }
}

/// An owned in-memory source; scrubbed when dropped
pub struct BytesSource {
    cursor: Cursor<Zeroizing<Vec<u8>>>,
}

impl<T: Into<Vec<u8>>> From<T> for BytesSource {
    fn from(value: T) -> Self {
        Self {
            cursor: Cursor::new(Zeroizing::new(value.into())),
        }
    }
}

impl Read for BytesSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl StreamSource for BytesSource {
    fn stream_len(&self) -> std::io::Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn is_file_backed(&self) -> bool {
        false
    }
}

enum StreamTarget {
    Digest(Box<dyn Digest>),
    Mac(Box<dyn Mac>),
    Cipher {
        engine: Box<BlockModeEngine>,
        padding: PaddingMode,
    },
}

/// What a finished run produced
#[derive(Debug)]
pub enum StreamOutput {
    Digest(Vec<u8>),
    Mac(Vec<u8>),
    Cipher { bytes_written: u64 },
}

impl StreamOutput {
    /// The digest or MAC bytes, for callers that know the target kind
    pub fn into_tag(self) -> Option<Vec<u8>> {
        match self {
            Self::Digest(tag) | Self::Mac(tag) => Some(tag),
            Self::Cipher { .. } => None,
        }
    }
}

/// Invoked from the driver thread with (bytes processed, total)
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send>;

/// Drives a byte stream through a digest, MAC, or cipher-mode engine
pub struct StreamProcessor {
    target: StreamTarget,
    buffer_size: usize,
    concurrent: bool,
    progress: Option<ProgressFn>,
    cancel: Arc<AtomicBool>,
}

impl StreamProcessor {
    pub fn new_digest(digest: Box<dyn Digest>) -> Self {
        Self::with_target(StreamTarget::Digest(digest))
    }

    /// The MAC must already be keyed
    pub fn new_mac(mac: Box<dyn Mac>) -> Self {
        Self::with_target(StreamTarget::Mac(mac))
    }

    /// The engine must already be initialized
    pub fn new_cipher(engine: BlockModeEngine, padding: PaddingMode) -> Self {
        Self::with_target(StreamTarget::Cipher {
            engine: Box::new(engine),
            padding,
        })
    }

    fn with_target(target: StreamTarget) -> Self {
        Self {
            target,
            buffer_size: DEFAULT_BUFFER_SIZE,
            concurrent: true,
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_concurrent(&mut self, concurrent: bool) {
        self.concurrent = concurrent;
    }

    pub fn set_buffer_size(&mut self, size: usize) -> Result<(), CryptError> {
        let block = self.target_block_size();
        if size == 0 || size % block != 0 {
            return Err(CryptError::InvalidParameter(format!(
                "buffer size must be a non-zero multiple of the {block}-byte block"
            )));
        }
        self.buffer_size = size;
        Ok(())
    }

    pub fn set_progress(&mut self, callback: ProgressFn) {
        self.progress = Some(callback);
    }

    /// Shared flag the host may set to abort at the next buffer boundary
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Runs the full stream through the target. Cipher targets require a
    /// `sink`; digest and MAC targets ignore it.
    pub fn process<S: StreamSource>(
        &mut self,
        source: &mut S,
        mut sink: Option<&mut dyn Write>,
    ) -> Result<StreamOutput, CryptError> {
        let total = source.stream_len()?;
        if matches!(self.target, StreamTarget::Cipher { .. }) && sink.is_none() {
            return Err(CryptError::InvalidParameter(
                "cipher streaming requires an output sink".to_string(),
            ));
        }

        let run_concurrent =
            self.concurrent && source.is_file_backed() && total >= self.buffer_size as u64;
        trace!(target: "cex", "streaming {total} bytes, concurrent={run_concurrent}");

        let interval = self.progress_interval(total);
        let buffer_size = self.buffer_size;
        let cancel = self.cancel.clone();
        let target = &mut self.target;
        let mut progress = ProgressTracker {
            callback: self.progress.as_deref(),
            interval,
            processed: 0,
            emitted_at: 0,
            total,
        };

        let bytes_written = if run_concurrent {
            drive_concurrent(
                target,
                source,
                &mut sink,
                total,
                buffer_size,
                &cancel,
                &mut progress,
            )?
        } else {
            drive_sequential(
                target,
                source,
                &mut sink,
                total,
                buffer_size,
                &cancel,
                &mut progress,
            )?
        };

        progress.finish();

        match target {
            StreamTarget::Digest(digest) => {
                let mut tag = vec![0u8; digest.digest_size()];
                digest.finalize(&mut tag)?;
                Ok(StreamOutput::Digest(tag))
            }
            StreamTarget::Mac(mac) => {
                let mut tag = vec![0u8; mac.digest_size()];
                mac.finalize(&mut tag)?;
                Ok(StreamOutput::Mac(tag))
            }
            StreamTarget::Cipher { .. } => Ok(StreamOutput::Cipher { bytes_written }),
        }
    }

    fn target_block_size(&self) -> usize {
        match &self.target {
            StreamTarget::Digest(digest) => digest.block_size().max(1),
            StreamTarget::Mac(mac) => mac.block_size().max(1),
            StreamTarget::Cipher { engine, .. } => engine.block_size(),
        }
    }

    /// Progress fires every `ceil(total / 100)` bytes, rounded down to the
    /// target's block size
    fn progress_interval(&self, total: u64) -> u64 {
        let block = self.target_block_size() as u64;
        let raw = total.div_ceil(100);
        std::cmp::max(block, (raw / block) * block)
    }
}

fn drive_sequential<S: StreamSource>(
    target: &mut StreamTarget,
    source: &mut S,
    sink: &mut Option<&mut dyn Write>,
    total: u64,
    buffer_size: usize,
    cancel: &AtomicBool,
    progress: &mut ProgressTracker<'_>,
) -> Result<u64, CryptError> {
    let mut remaining = total;
    let mut written = 0u64;

    while remaining > 0 {
        if cancel.load(Ordering::Relaxed) {
            return Err(CryptError::Cancelled);
        }

        let expected = std::cmp::min(buffer_size as u64, remaining) as usize;
        let mut buf = Zeroizing::new(vec![0u8; expected]);
        read_exactly(source, &mut buf)?;
        remaining -= expected as u64;

        written += feed_target(target, &buf, remaining == 0, sink)?;
        progress.advance(expected as u64);
    }

    Ok(written)
}

fn drive_concurrent<S: StreamSource>(
    target: &mut StreamTarget,
    source: &mut S,
    sink: &mut Option<&mut dyn Write>,
    total: u64,
    buffer_size: usize,
    cancel: &AtomicBool,
    progress: &mut ProgressTracker<'_>,
) -> Result<u64, CryptError> {
    std::thread::scope(|scope| {
        let (tx, rx) = bounded::<Result<Zeroizing<Vec<u8>>, CryptError>>(PIPELINE_DEPTH);

        let _reader = scope.spawn(move || {
            let mut remaining = total;
            while remaining > 0 {
                if cancel.load(Ordering::Relaxed) {
                    let _ = tx.send(Err(CryptError::Cancelled));
                    return;
                }

                let expected = std::cmp::min(buffer_size as u64, remaining) as usize;
                let mut buf = Zeroizing::new(vec![0u8; expected]);
                if let Err(err) = read_exactly(source, &mut buf) {
                    let _ = tx.send(Err(err));
                    return;
                }
                remaining -= expected as u64;

                if tx.send(Ok(buf)).is_err() {
                    // consumer bailed; nothing left to do
                    return;
                }
            }
        });

        let mut consumed = 0u64;
        let mut written = 0u64;
        // FIFO drain; the channel closes once the reader is done
        while let Ok(item) = rx.recv() {
            let buf = item?;
            consumed += buf.len() as u64;
            written += feed_target(target, &buf, consumed == total, sink)?;
            progress.advance(buf.len() as u64);
        }

        if consumed != total {
            return Err(CryptError::UnexpectedEof);
        }

        Ok(written)
    })
}

struct ProgressTracker<'a> {
    callback: Option<&'a (dyn Fn(u64, u64) + Send)>,
    interval: u64,
    processed: u64,
    emitted_at: u64,
    total: u64,
}

impl ProgressTracker<'_> {
    fn advance(&mut self, bytes: u64) {
        self.processed += bytes;
        if self.processed - self.emitted_at >= self.interval {
            self.emitted_at = self.processed;
            if let Some(callback) = self.callback {
                callback(self.processed, self.total);
            }
        }
    }

    fn finish(&mut self) {
        if let Some(callback) = self.callback {
            callback(self.total, self.total);
        }
    }
}

/// A short read anywhere before the declared length is an error
fn read_exactly<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<(), CryptError> {
    source.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CryptError::UnexpectedEof
        } else {
            CryptError::Io(err.to_string())
        }
    })
}

fn feed_target(
    target: &mut StreamTarget,
    buf: &[u8],
    is_final: bool,
    sink: &mut Option<&mut dyn Write>,
) -> Result<u64, CryptError> {
    match target {
        StreamTarget::Digest(digest) => {
            digest.update(buf);
            Ok(0)
        }
        StreamTarget::Mac(mac) => {
            mac.update(buf)?;
            Ok(0)
        }
        StreamTarget::Cipher { engine, padding } => {
            let sink = sink.as_mut().expect("checked in process()");
            let block = engine.block_size();
            let chained = engine.mode() != CipherMode::Ctr;

            if chained && is_final && engine.direction() == Direction::Encrypt {
                let mut padded = Zeroizing::new(buf.to_vec());
                padding::pad(*padding, &mut padded, block)?;
                let mut out = vec![0u8; padded.len()];
                engine.transform(&padded, &mut out)?;
                sink.write_all(&out).map_err(CryptError::from)?;
                return Ok(out.len() as u64);
            }

            let mut out = vec![0u8; buf.len()];
            engine.transform(buf, &mut out)?;

            if chained && is_final && engine.direction() == Direction::Decrypt {
                let keep = padding::unpad(*padding, &out, block)?;
                sink.write_all(&out[..keep]).map_err(CryptError::from)?;
                return Ok(keep as u64);
            }

            sink.write_all(&out).map_err(CryptError::from)?;
            Ok(out.len() as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use cex_types::crypto::DigestKind;

    #[test]
    fn bytes_source_reports_length() {
        let source = BytesSource::from(vec![1u8, 2, 3]);
        assert_eq!(source.stream_len().unwrap(), 3);
        assert!(!source.is_file_backed());
    }

    #[test]
    fn sequential_digest_matches_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut one_shot = registry::digest_of(DigestKind::Sha256).unwrap();
        one_shot.update(&data);
        let mut expected = vec![0u8; 32];
        one_shot.finalize(&mut expected).unwrap();

        let mut processor =
            StreamProcessor::new_digest(registry::digest_of(DigestKind::Sha256).unwrap());
        let mut source = BytesSource::from(data);
        let output = processor.process(&mut source, None).unwrap();
        assert_eq!(output.into_tag().unwrap(), expected);
    }

    #[test]
    fn truncated_source_is_an_error() {
        struct LyingSource(Cursor<Vec<u8>>);
        impl Read for LyingSource {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.read(buf)
            }
        }
        impl StreamSource for LyingSource {
            fn stream_len(&self) -> std::io::Result<u64> {
                Ok(1024)
            }
            fn is_file_backed(&self) -> bool {
                false
            }
        }

        let mut processor =
            StreamProcessor::new_digest(registry::digest_of(DigestKind::Sha256).unwrap());
        let mut source = LyingSource(Cursor::new(vec![0u8; 100]));
        assert!(matches!(
            processor.process(&mut source, None),
            Err(CryptError::UnexpectedEof)
        ));
    }

    #[test]
    fn cancellation_stops_the_run() {
        let mut processor =
            StreamProcessor::new_digest(registry::digest_of(DigestKind::Sha256).unwrap());
        processor.cancel_token().store(true, Ordering::Relaxed);
        let mut source = BytesSource::from(vec![0u8; 4096]);
        assert!(matches!(
            processor.process(&mut source, None),
            Err(CryptError::Cancelled)
        ));
    }
}
