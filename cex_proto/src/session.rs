//! The post-exchange encrypted session transport.
//!
//! An established session runs two dedicated threads: a receive loop that
//! decrypts, re-orders, and dispatches inbound frames, and a keep-alive
//! timer that probes idle links and expires silent peers. Host sends go
//! straight out on the calling thread through the shared writer.
//!
//! Control (`Service`) frames carry empty payloads and ride outside the
//! encrypted, sequenced stream. Everything else is sealed per frame under
//! the forward cipher and opened under the return cipher.
//!
//! A `Service/Resync` re-runs the primary key phase inside the current
//! session ciphers on the receive thread; on success the cipher pair is
//! swapped atomically and the old keys are zeroized.

use crate::channel::{self, FrameReader, FrameWriter};
use crate::error::DtmError;
use crate::events::{ErrorSeverity, EventRegistry, SessionEvent};
use crate::kex::{self, DtmConfig, DtmIdentity, KexTransport, RecvState};
use crate::packet::{
    message_flags, packet_type, service_flags, transfer_flags, DtmCodec, DtmHeader,
    DEFAULT_MAX_PAYLOAD,
};
use crate::sequence::{SequenceDecision, SequenceWindow};
use crate::session_crypto::{ChainedMac, SessionCrypto};
use cex_crypt::registry::{self, Prng};
use cex_logging::trace;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Transfer frames carry at most this much plaintext
pub const TRANSFER_CHUNK: usize = 64 * 1024;

/// Messages fragment at this size
pub const MESSAGE_FRAGMENT: usize = 64 * 1024;

/// The suggested reassembly cap for [DtmConfig::max_allocation]
pub const SUGGESTED_MAX_ALLOCATION: usize = 240 * 1024 * 1024;

/// How long a receive gap may stand before a resend request goes out
const RTT_MAX: Duration = Duration::from_millis(1500);

/// Distinguishes echo replies from echo requests in the option flag
const ECHO_REPLY_BIT: u64 = 1 << 63;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Closed,
    Connecting,
    AuthExchanging,
    AuthEstablished,
    PrimaryExchanging,
    Established,
    Rekeying,
}

/// Invoked on the receive thread when the peer offers a file; return the
/// destination path to accept, or `None` to refuse
pub type FileRequestFn = Box<dyn Fn(&str, u64) -> Option<PathBuf> + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct FileMeta {
    name: String,
    total_size: u64,
}

struct CryptoPair {
    forward: SessionCrypto,
    return_: SessionCrypto,
}

struct Shared {
    config: DtmConfig,
    is_initiator: bool,
    writer: Mutex<FrameWriter>,
    crypto: Mutex<Option<CryptoPair>>,
    state: Mutex<SessionState>,
    events: Arc<EventRegistry>,
    file_request: Mutex<Option<FileRequestFn>>,
    prng: Mutex<Box<dyn Prng>>,
    running: AtomicBool,
    rekey_pending: AtomicBool,
    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    peer_identity: DtmIdentity,
}

/// One endpoint of an established DTM session
pub struct DtmSession {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DtmSession {
    /// Dials the peer and drives the exchange as the initiator. Subscribe
    /// identity listeners on `events` before calling.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        config: DtmConfig,
        events: Arc<EventRegistry>,
    ) -> Result<Self, DtmError> {
        let stream = TcpStream::connect(addr)?;
        Self::establish(stream, config, events, true)
    }

    /// Accepts one inbound connection and drives the exchange as the
    /// responder
    pub fn accept(
        listener: &TcpListener,
        config: DtmConfig,
        events: Arc<EventRegistry>,
    ) -> Result<Self, DtmError> {
        let (stream, peer) = listener.accept()?;
        trace!(target: "cex", "inbound exchange from {peer}");
        Self::establish(stream, config, events, false)
    }

    fn establish(
        stream: TcpStream,
        config: DtmConfig,
        events: Arc<EventRegistry>,
        is_initiator: bool,
    ) -> Result<Self, DtmError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.exchange_timeout))?;

        let codec = DtmCodec::new(DEFAULT_MAX_PAYLOAD);
        let (mut reader, writer) = channel::split(stream, codec)?;
        let writer = Mutex::new(writer);

        let mut rx_state = RecvState { expected: 0 };
        let exchange_result = {
            let mut transport = KexTransport {
                reader: &mut reader,
                writer: &writer,
            };
            kex::run_exchange(
                &mut transport,
                &mut rx_state,
                &config,
                &events,
                is_initiator,
                &|state| trace!(target: "cex", "exchange state: {state:?}"),
            )
        };
        let outcome = match exchange_result {
            Ok(outcome) => outcome,
            Err(err) => {
                if matches!(err, DtmError::ExchangeTimeout) {
                    let _ = writer.lock().send_service(service_flags::TERMINATE, 0);
                }
                return Err(err);
            }
        };

        let prng = registry::prng_of(config.parameters.random_kind)?;
        let poll = poll_interval(&config);
        reader.set_read_timeout(Some(poll))?;

        let shared = Arc::new(Shared {
            config,
            is_initiator,
            writer,
            crypto: Mutex::new(Some(CryptoPair {
                forward: outcome.forward,
                return_: outcome.return_,
            })),
            state: Mutex::new(SessionState::Established),
            events,
            file_request: Mutex::new(None),
            prng: Mutex::new(prng),
            running: AtomicBool::new(true),
            rekey_pending: AtomicBool::new(false),
            last_received: Mutex::new(Instant::now()),
            last_sent: Mutex::new(Instant::now()),
            peer_identity: outcome.peer_identity,
        });

        let window = SequenceWindow::new(rx_state.expected);
        let rx_shared = shared.clone();
        let rx_thread = std::thread::Builder::new()
            .name("dtm-rx".to_string())
            .spawn(move || rx_loop(rx_shared, reader, window))?;
        let ka_shared = shared.clone();
        let ka_thread = std::thread::Builder::new()
            .name("dtm-keepalive".to_string())
            .spawn(move || keepalive_loop(ka_shared))?;

        Ok(Self {
            shared,
            threads: Mutex::new(vec![rx_thread, ka_thread]),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_initiator(&self) -> bool {
        self.shared.is_initiator
    }

    pub fn peer_identity(&self) -> &DtmIdentity {
        &self.shared.peer_identity
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.shared.events
    }

    pub fn set_file_request_handler(&self, handler: FileRequestFn) {
        *self.shared.file_request.lock() = Some(handler);
    }

    /// True once every session key buffer has been overwritten
    pub fn keys_scrubbed(&self) -> bool {
        match self.shared.crypto.lock().as_ref() {
            Some(pair) => pair.forward.is_scrubbed() && pair.return_.is_scrubbed(),
            None => true,
        }
    }

    /// Encrypts and transmits `payload`, fragmenting above
    /// [MESSAGE_FRAGMENT], with the configured random padding and delay
    pub fn send(&self, payload: &[u8]) -> Result<(), DtmError> {
        self.ensure_established()?;

        {
            let mut prng = self.shared.prng.lock();
            kex::delay_full(prng.as_mut(), self.shared.config.parameters.delays.message_ms);
        }

        let crypto_guard = self.shared.crypto.lock();
        let crypto = crypto_guard.as_ref().ok_or(DtmError::NotEstablished)?;

        let fragments = payload.len().div_ceil(MESSAGE_FRAGMENT).max(1);
        let mut chunks = payload.chunks(MESSAGE_FRAGMENT);
        for index in 0..fragments {
            let chunk = chunks.next().unwrap_or(&[]);
            let flag = if fragments == 1 {
                message_flags::COMPLETE
            } else if index == fragments - 1 {
                message_flags::FRAGMENT_LAST
            } else {
                message_flags::FRAGMENT
            };

            let padded = {
                let mut prng = self.shared.prng.lock();
                kex::pad_random(
                    prng.as_mut(),
                    chunk,
                    self.shared.config.parameters.padding.message,
                )
            };

            self.send_sealed(&crypto.forward, packet_type::MESSAGE, flag, 0, &padded)?;
        }

        Ok(())
    }

    /// Streams a file as a metadata frame plus chained-MAC fragments. The
    /// receiving host picks the destination through its file-request
    /// handler.
    pub fn send_file(&self, path: &Path) -> Result<(), DtmError> {
        self.ensure_established()?;

        let mut file = File::open(path)?;
        let total_size = file.metadata()?.len();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                DtmError::InvalidParameter("path has no usable file name".to_string())
            })?
            .to_string();

        let crypto_guard = self.shared.crypto.lock();
        let crypto = crypto_guard.as_ref().ok_or(DtmError::NotEstablished)?;

        let meta = bincode2::serialize(&FileMeta { name, total_size })?;
        self.send_sealed(
            &crypto.forward,
            packet_type::TRANSFER,
            transfer_flags::HEADER,
            total_size,
            &meta,
        )?;

        let mut chain = ChainedMac::new(crypto.forward.transfer_mac()?);
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let mut remaining = total_size;

        loop {
            let take = std::cmp::min(TRANSFER_CHUNK as u64, remaining) as usize;
            file.read_exact(&mut buf[..take])?;
            remaining -= take as u64;

            let tag = chain.next(&buf[..take])?;
            let mut payload = Vec::with_capacity(take + tag.len());
            payload.extend_from_slice(&buf[..take]);
            payload.extend_from_slice(&tag);

            let flag = if remaining == 0 {
                transfer_flags::LAST
            } else {
                transfer_flags::FRAGMENT
            };
            self.send_sealed(&crypto.forward, packet_type::TRANSFER, flag, 0, &payload)?;

            if remaining == 0 {
                break;
            }
        }

        Ok(())
    }

    /// Sends a latency probe; the peer answers with the same token
    pub fn echo(&self) -> Result<(), DtmError> {
        self.ensure_established()?;
        let token = self.shared.prng.lock().next_u32() as u64;
        self.shared
            .writer
            .lock()
            .send_service(service_flags::ECHO, token)
    }

    /// Requests an in-session rekey: the primary phase re-runs inside the
    /// current ciphers and the pair is swapped on completion. Progress is
    /// observable through [Self::state].
    pub fn resync(&self) -> Result<(), DtmError> {
        self.ensure_established()?;
        // the resync announcement must hit the wire before the receive
        // thread can emit the first rekey frame
        self.shared
            .writer
            .lock()
            .send_service(service_flags::RESYNC, 0)?;
        *self.shared.state.lock() = SessionState::Rekeying;
        self.shared.rekey_pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Announces the teardown, closes the socket, joins the worker
    /// threads, and scrubs the session keys
    pub fn disconnect(&self) -> Result<(), DtmError> {
        if self.shared.running.load(Ordering::SeqCst) {
            let _ = self
                .shared
                .writer
                .lock()
                .send_service(service_flags::TERMINATE, 0);
            teardown(&self.shared);
        }

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }

    fn ensure_established(&self) -> Result<(), DtmError> {
        if *self.shared.state.lock() != SessionState::Established {
            return Err(DtmError::NotEstablished);
        }
        Ok(())
    }

    fn send_sealed(
        &self,
        crypto: &SessionCrypto,
        packet_type: u8,
        packet_flag: u16,
        option_flag: u64,
        plaintext: &[u8],
    ) -> Result<(), DtmError> {
        let mut writer = self.shared.writer.lock();
        let header = DtmHeader::new(
            packet_type,
            writer.next_seq(),
            packet_flag,
            option_flag,
            crypto.sealed_len(plaintext.len()) as u32,
        );
        let sealed = crypto.seal(&header, plaintext)?;
        let length = sealed.len();
        writer.send(header, sealed)?;
        drop(writer);

        *self.shared.last_sent.lock() = Instant::now();
        self.shared.events.emit(&SessionEvent::PacketSent {
            packet_type,
            packet_flag,
            length,
        });
        Ok(())
    }
}

impl Drop for DtmSession {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

fn poll_interval(config: &DtmConfig) -> Duration {
    std::cmp::min(config.keep_alive_interval / 2, Duration::from_millis(500))
        .max(Duration::from_millis(50))
}

fn teardown(shared: &Shared) {
    if !shared.running.swap(false, Ordering::SeqCst) {
        return;
    }

    if let Some(pair) = shared.crypto.lock().as_mut() {
        pair.forward.scrub();
        pair.return_.scrub();
    }
    *shared.state.lock() = SessionState::Closed;
    shared.writer.lock().shutdown();
}

struct TransferState {
    final_path: PathBuf,
    part_path: PathBuf,
    file: File,
    chain: ChainedMac,
    received: u64,
    total: u64,
}

type Frame = (DtmHeader, Vec<u8>);

fn rx_loop(shared: Arc<Shared>, mut reader: FrameReader, mut window: SequenceWindow<Frame>) {
    let mut assembler: Vec<u8> = Vec::new();
    let mut transfer: Option<TransferState> = None;

    while shared.running.load(Ordering::SeqCst) {
        // a locally requested rekey starts here, between frames
        if shared.rekey_pending.load(Ordering::SeqCst) {
            run_rekey_on_rx(&shared, &mut reader, &mut window, true);
            continue;
        }

        let (header, payload) = match reader.recv() {
            Ok(frame) => frame,
            Err(DtmError::ExchangeTimeout) => continue,
            Err(_) if !shared.running.load(Ordering::SeqCst) => break,
            Err(err) => {
                shared.events.emit(&SessionEvent::SessionError {
                    severity: ErrorSeverity::Fatal,
                    message: err.into_string(),
                });
                teardown(&shared);
                break;
            }
        };

        *shared.last_received.lock() = Instant::now();

        if header.packet_type == packet_type::SERVICE {
            if !handle_service(&shared, &mut reader, &mut window, &header) {
                break;
            }
            continue;
        }

        match window.offer(header.sequence.get(), (header, payload)) {
            SequenceDecision::Deliver(frame) => {
                if !process_frame(&shared, frame, &mut assembler, &mut transfer) {
                    break;
                }
                let mut alive = true;
                while let Some(next) = window.pop_ready() {
                    if !process_frame(&shared, next, &mut assembler, &mut transfer) {
                        alive = false;
                        break;
                    }
                }
                if !alive {
                    break;
                }
            }
            SequenceDecision::Buffered | SequenceDecision::Duplicate => {}
            SequenceDecision::TooFar => {
                shared.events.emit(&SessionEvent::SessionError {
                    severity: ErrorSeverity::Error,
                    message: "frame sequence outside the receive window".to_string(),
                });
                let _ = shared
                    .writer
                    .lock()
                    .send_service(service_flags::OUT_OF_SEQUENCE, 0);
            }
        }

        if let Some(missing) = window.needs_resend(RTT_MAX) {
            let _ = shared
                .writer
                .lock()
                .send_service(service_flags::RESEND, missing as u64);
        }
    }
}

/// Returns false when the session should stop
fn handle_service(
    shared: &Arc<Shared>,
    reader: &mut FrameReader,
    window: &mut SequenceWindow<Frame>,
    header: &DtmHeader,
) -> bool {
    match header.packet_flag.get() {
        service_flags::KEEP_ALIVE => true,
        service_flags::ECHO => {
            let option = header.option_flag.get();
            if option & ECHO_REPLY_BIT == 0 {
                let _ = shared
                    .writer
                    .lock()
                    .send_service(service_flags::ECHO, option | ECHO_REPLY_BIT);
            }
            true
        }
        service_flags::RESEND => {
            let _ = shared.writer.lock().resend_last();
            true
        }
        service_flags::RESYNC => {
            if shared.rekey_pending.load(Ordering::SeqCst) && shared.is_initiator {
                // simultaneous resync: the session initiator proceeds as
                // rekey initiator on its next poll tick, the peer yields
            } else {
                shared.rekey_pending.store(false, Ordering::SeqCst);
                run_rekey_on_rx(shared, reader, window, false);
            }
            shared.running.load(Ordering::SeqCst)
        }
        service_flags::TERMINATE | service_flags::DISCONNECTED => {
            shared.events.emit(&SessionEvent::SessionError {
                severity: ErrorSeverity::Warning,
                message: "peer closed the session".to_string(),
            });
            teardown(shared);
            false
        }
        _ => {
            shared.events.emit(&SessionEvent::SessionError {
                severity: ErrorSeverity::Warning,
                message: format!("service flag {} from peer", header.packet_flag.get()),
            });
            true
        }
    }
}

fn run_rekey_on_rx(
    shared: &Arc<Shared>,
    reader: &mut FrameReader,
    window: &mut SequenceWindow<Frame>,
    initiator: bool,
) {
    shared.rekey_pending.store(false, Ordering::SeqCst);
    *shared.state.lock() = SessionState::Rekeying;
    let _ = reader.set_read_timeout(Some(shared.config.exchange_timeout));

    let mut rx_state = RecvState {
        expected: window.expected(),
    };

    let result = {
        let mut crypto_guard = shared.crypto.lock();
        match crypto_guard.as_mut() {
            Some(pair) => {
                let mut transport = KexTransport {
                    reader,
                    writer: &shared.writer,
                };
                kex::run_rekey(
                    &mut transport,
                    &mut rx_state,
                    &shared.config,
                    &pair.forward,
                    &pair.return_,
                    initiator,
                )
                .map(|(forward, return_)| {
                    pair.forward.scrub();
                    pair.return_.scrub();
                    *pair = CryptoPair { forward, return_ };
                    (pair.forward.fingerprint(), pair.return_.fingerprint())
                })
            }
            None => Err(DtmError::NotEstablished),
        }
    };

    let _ = reader.set_read_timeout(Some(poll_interval(&shared.config)));

    match result {
        Ok((forward_fingerprint, return_fingerprint)) => {
            *window = SequenceWindow::new(rx_state.expected);
            *shared.state.lock() = SessionState::Established;
            shared.events.emit(&SessionEvent::SessionEstablished {
                forward_fingerprint,
                return_fingerprint,
            });
        }
        Err(err) => {
            shared.events.emit(&SessionEvent::SessionError {
                severity: ErrorSeverity::Fatal,
                message: format!("rekey failed: {}", err.into_string()),
            });
            teardown(shared);
        }
    }
}

/// Returns false when the session should stop
fn process_frame(
    shared: &Arc<Shared>,
    (header, payload): Frame,
    assembler: &mut Vec<u8>,
    transfer: &mut Option<TransferState>,
) -> bool {
    let plaintext = {
        let crypto_guard = shared.crypto.lock();
        let Some(pair) = crypto_guard.as_ref() else {
            return false;
        };
        match pair.return_.open(&header, &payload) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                shared.events.emit(&SessionEvent::SessionError {
                    severity: ErrorSeverity::Fatal,
                    message: err.into_string(),
                });
                let _ = shared
                    .writer
                    .lock()
                    .send_service(service_flags::TERMINATE, 0);
                drop(crypto_guard);
                teardown(shared);
                return false;
            }
        }
    };

    shared.events.emit(&SessionEvent::PacketReceived {
        packet_type: header.packet_type,
        packet_flag: header.packet_flag.get(),
        length: payload.len(),
    });

    match header.packet_type {
        packet_type::MESSAGE => handle_message(shared, &header, &plaintext, assembler),
        packet_type::TRANSFER => handle_transfer(shared, &header, &plaintext, transfer),
        _ => {
            shared.events.emit(&SessionEvent::SessionError {
                severity: ErrorSeverity::Warning,
                message: format!("unexpected packet type {}", header.packet_type),
            });
            true
        }
    }
}

fn handle_message(
    shared: &Arc<Shared>,
    header: &DtmHeader,
    plaintext: &[u8],
    assembler: &mut Vec<u8>,
) -> bool {
    let body = match kex::unpad_random(plaintext) {
        Ok(body) => body,
        Err(err) => {
            shared.events.emit(&SessionEvent::SessionError {
                severity: ErrorSeverity::Error,
                message: err.into_string(),
            });
            return true;
        }
    };

    match header.packet_flag.get() {
        message_flags::COMPLETE => {
            shared.events.emit(&SessionEvent::DataReceived(body));
        }
        flag @ (message_flags::FRAGMENT | message_flags::FRAGMENT_LAST) => {
            if assembler.len() + body.len() > shared.config.max_allocation {
                let over = assembler.len() + body.len();
                assembler.clear();
                shared.events.emit(&SessionEvent::SessionError {
                    severity: ErrorSeverity::Error,
                    message: DtmError::PayloadTooLarge(over).into_string(),
                });
                return true;
            }

            assembler.extend_from_slice(&body);
            if flag == message_flags::FRAGMENT_LAST {
                shared
                    .events
                    .emit(&SessionEvent::DataReceived(std::mem::take(assembler)));
            }
        }
        other => {
            shared.events.emit(&SessionEvent::SessionError {
                severity: ErrorSeverity::Warning,
                message: format!("message flag {other} from peer"),
            });
        }
    }

    true
}

fn handle_transfer(
    shared: &Arc<Shared>,
    header: &DtmHeader,
    plaintext: &[u8],
    transfer: &mut Option<TransferState>,
) -> bool {
    match header.packet_flag.get() {
        transfer_flags::HEADER => {
            let meta: FileMeta = match bincode2::deserialize(plaintext) {
                Ok(meta) => meta,
                Err(err) => {
                    emit_transfer_error(shared, ErrorSeverity::Error, err.to_string());
                    return true;
                }
            };

            if meta.total_size > shared.config.max_allocation as u64 {
                let _ = shared
                    .writer
                    .lock()
                    .send_service(service_flags::REFUSAL, header.option_flag.get());
                emit_transfer_error(
                    shared,
                    ErrorSeverity::Warning,
                    DtmError::PayloadTooLarge(meta.total_size as usize).into_string(),
                );
                return true;
            }

            let accepted = shared
                .file_request
                .lock()
                .as_ref()
                .and_then(|handler| handler(&meta.name, meta.total_size));
            let Some(final_path) = accepted else {
                let _ = shared
                    .writer
                    .lock()
                    .send_service(service_flags::REFUSAL, header.option_flag.get());
                return true;
            };

            let chain = {
                let crypto_guard = shared.crypto.lock();
                let Some(pair) = crypto_guard.as_ref() else {
                    return false;
                };
                match pair.return_.transfer_mac() {
                    Ok(mac) => ChainedMac::new(mac),
                    Err(err) => {
                        emit_transfer_error(shared, ErrorSeverity::Error, err.into_string());
                        return true;
                    }
                }
            };

            let part_path = final_path.with_extension("part");
            match File::create(&part_path) {
                Ok(file) => {
                    *transfer = Some(TransferState {
                        final_path,
                        part_path,
                        file,
                        chain,
                        received: 0,
                        total: meta.total_size,
                    });
                }
                Err(err) => emit_transfer_error(shared, ErrorSeverity::Error, err.to_string()),
            }
            true
        }
        flag @ (transfer_flags::FRAGMENT | transfer_flags::LAST) => {
            let Some(state) = transfer.as_mut() else {
                emit_transfer_error(
                    shared,
                    ErrorSeverity::Warning,
                    "transfer fragment without a header".to_string(),
                );
                return true;
            };

            let tag_len = state.chain.tag_len();
            if plaintext.len() < tag_len {
                abort_transfer(shared, transfer, "transfer fragment shorter than its tag");
                return true;
            }

            let (chunk, tag) = plaintext.split_at(plaintext.len() - tag_len);
            if state.chain.verify_next(chunk, tag).is_err() {
                abort_transfer(shared, transfer, "transfer chain tag mismatch");
                return true;
            }

            if state.received + chunk.len() as u64 > state.total {
                abort_transfer(shared, transfer, "transfer exceeded its declared size");
                return true;
            }

            if state.file.write_all(chunk).is_err() {
                abort_transfer(shared, transfer, "failed writing the transfer file");
                return true;
            }
            state.received += chunk.len() as u64;

            if flag == transfer_flags::LAST {
                let state = transfer.take().expect("checked above");
                if state.received != state.total
                    || state.file.sync_all().is_err()
                    || std::fs::rename(&state.part_path, &state.final_path).is_err()
                {
                    let _ = std::fs::remove_file(&state.part_path);
                    emit_transfer_error(
                        shared,
                        ErrorSeverity::Error,
                        "transfer finalization failed".to_string(),
                    );
                    return true;
                }
                shared
                    .events
                    .emit(&SessionEvent::FileReceived(state.final_path));
            }
            true
        }
        other => {
            emit_transfer_error(
                shared,
                ErrorSeverity::Warning,
                format!("transfer flag {other} from peer"),
            );
            true
        }
    }
}

fn abort_transfer(shared: &Arc<Shared>, transfer: &mut Option<TransferState>, reason: &str) {
    if let Some(state) = transfer.take() {
        let _ = std::fs::remove_file(&state.part_path);
    }
    let _ = shared
        .writer
        .lock()
        .send_service(service_flags::DATA_LOST, 0);
    emit_transfer_error(shared, ErrorSeverity::Error, reason.to_string());
}

fn emit_transfer_error(shared: &Arc<Shared>, severity: ErrorSeverity, message: String) {
    shared
        .events
        .emit(&SessionEvent::SessionError { severity, message });
}

fn keepalive_loop(shared: Arc<Shared>) {
    let interval = shared.config.keep_alive_interval;
    let tick = std::cmp::min(interval / 4, Duration::from_millis(500))
        .max(Duration::from_millis(50));

    while shared.running.load(Ordering::SeqCst) {
        std::thread::sleep(tick);
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        if *shared.state.lock() != SessionState::Established {
            continue;
        }

        if shared.last_received.lock().elapsed() > interval * 3 {
            shared.events.emit(&SessionEvent::SessionError {
                severity: ErrorSeverity::Fatal,
                message: "peer silent past the keep-alive deadline".to_string(),
            });
            let _ = shared
                .writer
                .lock()
                .send_service(service_flags::TERMINATE, 0);
            teardown(&shared);
            break;
        }

        if shared.last_sent.lock().elapsed() >= interval {
            if shared
                .writer
                .lock()
                .send_service(service_flags::KEEP_ALIVE, 0)
                .is_ok()
            {
                *shared.last_sent.lock() = Instant::now();
            }
        }
    }
}
