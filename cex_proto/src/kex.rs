//! The DTM-KEX exchange state machine.
//!
//! Two endpoints run symmetric roles through a lock-step ladder:
//! identities under a pre-shared-domain key, then an authentication phase
//! that seals fresh symmetric seeds under freshly generated asymmetric
//! keys, then a primary phase running the same shape inside the auth
//! ciphers. The auth ciphers exist only to wrap primary-phase traffic and
//! are zeroized at switchover.
//!
//! Timing defenses: asymmetric keys and sealed seeds are prefixed/suffixed
//! with bounded random padding and transmitted after bounded random delays,
//! both configured by [DtmParameters].

use crate::channel::{FrameReader, FrameWriter};
use crate::error::DtmError;
use crate::events::{EventRegistry, SessionEvent};
use crate::packet::{exchange_flags, packet_type, service_flags, DtmHeader};
use crate::session::SessionState;
use crate::session_crypto::SessionCrypto;
use cex_crypt::asym::{self, AsymKeypair, PkeKind};
use cex_crypt::kdf;
use cex_crypt::registry::{self, Prng};
use cex_types::crypto::{CipherDescription, PrngKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

const PREAUTH_FORWARD_INFO: &[u8] = b"dtm-preauth-v1-forward";
const PREAUTH_RETURN_INFO: &[u8] = b"dtm-preauth-v1-return";

/// Inclusive upper bounds on random prepend/append bytes, per payload
/// class. Field order here is the wire order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaddingBounds {
    pub asm_key: [u16; 2],
    pub sym_key: [u16; 2],
    pub asm_params: [u16; 2],
    pub message: [u16; 2],
}

impl PaddingBounds {
    pub fn none() -> Self {
        Self {
            asm_key: [0, 0],
            sym_key: [0, 0],
            asm_params: [0, 0],
            message: [0, 0],
        }
    }
}

/// Upper bounds on randomized transmit delays, in milliseconds
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransmitDelays {
    pub asm_key_ms: u64,
    pub sym_key_ms: u64,
    pub message_ms: u64,
}

impl TransmitDelays {
    pub fn none() -> Self {
        Self {
            asm_key_ms: 0,
            sym_key_ms: 0,
            message_ms: 0,
        }
    }
}

/// The negotiated exchange profile; both endpoints must hold equal values
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DtmParameters {
    pub oid: [u8; 16],
    pub auth_pke_id: PkeKind,
    pub primary_pke_id: PkeKind,
    pub auth_session: CipherDescription,
    pub primary_session: CipherDescription,
    pub random_kind: PrngKind,
    pub padding: PaddingBounds,
    pub delays: TransmitDelays,
}

impl DtmParameters {
    /// The `X41RNT1R1` profile: Rijndael-256 CTR sessions, X25519 sealed
    /// seeds, light padding and delays
    pub fn x41rnt1r1() -> Self {
        let mut oid = [0u8; 16];
        oid[..9].copy_from_slice(b"X41RNT1R1");
        Self {
            oid,
            auth_pke_id: PkeKind::X25519Sealed,
            primary_pke_id: PkeKind::X25519Sealed,
            auth_session: CipherDescription::rijndael_ctr_256(),
            primary_session: CipherDescription::rijndael_ctr_256(),
            random_kind: PrngKind::Std,
            padding: PaddingBounds {
                asm_key: [16, 16],
                sym_key: [16, 16],
                asm_params: [16, 16],
                message: [32, 32],
            },
            delays: TransmitDelays {
                asm_key_ms: 10,
                sym_key_ms: 10,
                message_ms: 5,
            },
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, DtmError> {
        bincode2::serialize(self).map_err(DtmError::from)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DtmError> {
        bincode2::deserialize(bytes).map_err(DtmError::from)
    }
}

/// The identity payload exchanged in the Connect/Init round
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DtmIdentity {
    /// Application-defined token
    pub identity: Vec<u8>,
    /// Selects the asymmetric parameters the peer will use
    pub pke_id: Vec<u8>,
    pub session: CipherDescription,
    pub option_flag: i64,
}

/// Everything an endpoint needs to run the exchange and the session
pub struct DtmConfig {
    pub parameters: DtmParameters,
    pub identity: DtmIdentity,
    /// Pre-shared domain secret; the pre-auth ciphers derive from it
    pub domain_secret: Zeroizing<Vec<u8>>,
    pub exchange_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Hard cap on receive-side reassembly. Required: a hostile peer can
    /// exhaust memory at any default.
    pub max_allocation: usize,
}

impl DtmConfig {
    pub fn new(
        parameters: DtmParameters,
        identity: DtmIdentity,
        domain_secret: Vec<u8>,
        max_allocation: usize,
    ) -> Self {
        Self {
            parameters,
            identity,
            domain_secret: Zeroizing::new(domain_secret),
            exchange_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(10),
            max_allocation,
        }
    }
}

/// Receive-side lock-step position during an exchange
pub(crate) struct RecvState {
    pub expected: u32,
}

/// The exchange's view of the frame channel: exclusive reader, shared
/// writer
pub(crate) struct KexTransport<'a> {
    pub reader: &'a mut FrameReader,
    pub writer: &'a Mutex<FrameWriter>,
}

impl KexTransport<'_> {
    fn send_encrypted(
        &self,
        crypto: &SessionCrypto,
        flag: u16,
        option: u64,
        plaintext: &[u8],
    ) -> Result<(), DtmError> {
        let mut writer = self.writer.lock();
        let header = DtmHeader::new(
            packet_type::EXCHANGE,
            writer.next_seq(),
            flag,
            option,
            crypto.sealed_len(plaintext.len()) as u32,
        );
        let payload = crypto.seal(&header, plaintext)?;
        writer.send(header, payload)
    }

    fn send_service(&self, flag: u16, option: u64) {
        let _ = self.writer.lock().send_service(flag, option);
    }

    /// Receives the next frame with the expected exchange flag, honoring
    /// resend requests and tolerating one ordering slip before
    /// terminating
    fn recv_exchange(
        &mut self,
        crypto: &SessionCrypto,
        expected_flag: u16,
        state: &mut RecvState,
    ) -> Result<Zeroizing<Vec<u8>>, DtmError> {
        let mut resend_requested = false;
        loop {
            let (header, payload) = self.reader.recv()?;
            let seq = header.sequence.get();

            if header.packet_type == packet_type::SERVICE {
                match header.packet_flag.get() {
                    service_flags::RESEND => {
                        self.writer.lock().resend_last()?;
                        continue;
                    }
                    service_flags::REFUSAL => return Err(DtmError::PeerRefused),
                    service_flags::TERMINATE | service_flags::DISCONNECTED => {
                        return Err(DtmError::Protocol(
                            "peer terminated during exchange".to_string(),
                        ))
                    }
                    _ => continue,
                }
            }

            // stale duplicate from a spurious resend
            if seq.wrapping_sub(state.expected) > u32::MAX / 2 {
                continue;
            }

            if header.packet_type == packet_type::EXCHANGE
                && header.packet_flag.get() == expected_flag
                && seq == state.expected
            {
                state.expected = state.expected.wrapping_add(1);
                return match crypto.open(&header, &payload) {
                    Ok(plaintext) => Ok(plaintext),
                    Err(err) => {
                        self.send_service(service_flags::TERMINATE, 0);
                        Err(err)
                    }
                };
            }

            if resend_requested {
                self.send_service(service_flags::TERMINATE, 0);
                return Err(DtmError::Protocol("packet ordering violation".to_string()));
            }
            resend_requested = true;
            self.writer.lock().send_service(service_flags::RESEND, 0)?;
        }
    }
}

/// Session ciphers and the authenticated peer identity
pub(crate) struct ExchangeOutcome {
    pub forward: SessionCrypto,
    pub return_: SessionCrypto,
    pub peer_identity: DtmIdentity,
}

/// Runs the full ladder. `notify_state` observes phase transitions.
pub(crate) fn run_exchange(
    transport: &mut KexTransport<'_>,
    rx_state: &mut RecvState,
    config: &DtmConfig,
    events: &EventRegistry,
    initiator: bool,
    notify_state: &dyn Fn(SessionState),
) -> Result<ExchangeOutcome, DtmError> {
    let params = &config.parameters;
    let mut prng = registry::prng_of(params.random_kind)?;

    notify_state(SessionState::Connecting);
    let (pre_tx, pre_rx) = preauth_pair(config, initiator)?;

    let identity_bytes = bincode2::serialize(&config.identity)?;
    let peer_identity = if initiator {
        transport.send_encrypted(&pre_tx, exchange_flags::CONNECT, 0, &identity_bytes)?;
        let plaintext = transport.recv_exchange(&pre_rx, exchange_flags::INIT, rx_state)?;
        let peer: DtmIdentity = bincode2::deserialize(&plaintext)?;
        accept_identity(transport, events, params, &peer)?;
        peer
    } else {
        let plaintext = transport.recv_exchange(&pre_rx, exchange_flags::CONNECT, rx_state)?;
        let peer: DtmIdentity = bincode2::deserialize(&plaintext)?;
        accept_identity(transport, events, params, &peer)?;
        transport.send_encrypted(&pre_tx, exchange_flags::INIT, 0, &identity_bytes)?;
        peer
    };

    notify_state(SessionState::AuthExchanging);
    let (forward_seed, return_seed) = run_phase(
        transport,
        rx_state,
        &pre_tx,
        &pre_rx,
        params.auth_pke_id,
        &params.auth_session,
        params,
        prng.as_mut(),
        initiator,
        auth_phase_flags(initiator),
    )?;
    let mut auth_tx = SessionCrypto::from_seed(&params.auth_session, &forward_seed)?;
    let mut auth_rx = SessionCrypto::from_seed(&params.auth_session, &return_seed)?;
    notify_state(SessionState::AuthEstablished);

    notify_state(SessionState::PrimaryExchanging);
    let (forward_seed, return_seed) = run_phase(
        transport,
        rx_state,
        &auth_tx,
        &auth_rx,
        params.primary_pke_id,
        &params.primary_session,
        params,
        prng.as_mut(),
        initiator,
        primary_phase_flags(initiator),
    )?;
    let forward = SessionCrypto::from_seed(&params.primary_session, &forward_seed)?;
    let return_ = SessionCrypto::from_seed(&params.primary_session, &return_seed)?;

    confirm_switchover(transport, rx_state, &forward, &return_, &params.oid, initiator)?;

    // the auth ciphers never touch application data; retire them now
    auth_tx.scrub();
    auth_rx.scrub();

    notify_state(SessionState::Established);
    events.emit(&SessionEvent::SessionEstablished {
        forward_fingerprint: forward.fingerprint(),
        return_fingerprint: return_.fingerprint(),
    });

    Ok(ExchangeOutcome {
        forward,
        return_,
        peer_identity,
    })
}

/// Re-runs the primary phase inside the current session ciphers; used by
/// `Service/Resync`
pub(crate) fn run_rekey(
    transport: &mut KexTransport<'_>,
    rx_state: &mut RecvState,
    config: &DtmConfig,
    wrap_tx: &SessionCrypto,
    wrap_rx: &SessionCrypto,
    initiator: bool,
) -> Result<(SessionCrypto, SessionCrypto), DtmError> {
    let params = &config.parameters;
    let mut prng = registry::prng_of(params.random_kind)?;

    let (forward_seed, return_seed) = run_phase(
        transport,
        rx_state,
        wrap_tx,
        wrap_rx,
        params.primary_pke_id,
        &params.primary_session,
        params,
        prng.as_mut(),
        initiator,
        primary_phase_flags(initiator),
    )?;
    let forward = SessionCrypto::from_seed(&params.primary_session, &forward_seed)?;
    let return_ = SessionCrypto::from_seed(&params.primary_session, &return_seed)?;

    confirm_switchover(transport, rx_state, &forward, &return_, &params.oid, initiator)?;
    Ok((forward, return_))
}

/// Which exchange flags each side sends and expects within a phase
struct PhaseFlags {
    local_key: u16,
    peer_key: u16,
    local_seed: u16,
    peer_seed: u16,
}

fn auth_phase_flags(initiator: bool) -> PhaseFlags {
    if initiator {
        PhaseFlags {
            local_key: exchange_flags::PRE_AUTH,
            peer_key: exchange_flags::AUTH_EX,
            local_seed: exchange_flags::PRE_AUTH,
            peer_seed: exchange_flags::AUTH_ESTABLISHED,
        }
    } else {
        PhaseFlags {
            local_key: exchange_flags::AUTH_EX,
            peer_key: exchange_flags::PRE_AUTH,
            local_seed: exchange_flags::AUTH_ESTABLISHED,
            peer_seed: exchange_flags::PRE_AUTH,
        }
    }
}

fn primary_phase_flags(initiator: bool) -> PhaseFlags {
    if initiator {
        PhaseFlags {
            local_key: exchange_flags::PRE_PRIMARY,
            peer_key: exchange_flags::PRIME_EX,
            local_seed: exchange_flags::PRE_PRIMARY,
            peer_seed: exchange_flags::PRIMARY_ESTABLISHED,
        }
    } else {
        PhaseFlags {
            local_key: exchange_flags::PRIME_EX,
            peer_key: exchange_flags::PRE_PRIMARY,
            local_seed: exchange_flags::PRIMARY_ESTABLISHED,
            peer_seed: exchange_flags::PRE_PRIMARY,
        }
    }
}

/// One key-agreement phase: trade public keys, then trade sealed session
/// seeds. Returns (local seed, peer seed): the local seed keys this
/// endpoint's forward cipher.
#[allow(clippy::too_many_arguments)]
fn run_phase(
    transport: &mut KexTransport<'_>,
    rx_state: &mut RecvState,
    wrap_tx: &SessionCrypto,
    wrap_rx: &SessionCrypto,
    pke: PkeKind,
    session: &CipherDescription,
    params: &DtmParameters,
    prng: &mut dyn Prng,
    initiator: bool,
    flags: PhaseFlags,
) -> Result<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>), DtmError> {
    let keypair = AsymKeypair::generate(pke)?;

    // round one: public keys
    let peer_public;
    {
        let padded = pad_random(prng, keypair.public_bytes(), params.padding.asm_key);
        if initiator {
            delay_upper_half(prng, params.delays.asm_key_ms);
            transport.send_encrypted(wrap_tx, flags.local_key, 0, &padded)?;
            let plaintext = transport.recv_exchange(wrap_rx, flags.peer_key, rx_state)?;
            peer_public = unpad_random(&plaintext)?;
        } else {
            let plaintext = transport.recv_exchange(wrap_rx, flags.peer_key, rx_state)?;
            peer_public = unpad_random(&plaintext)?;
            delay_upper_half(prng, params.delays.asm_key_ms);
            transport.send_encrypted(wrap_tx, flags.local_key, 0, &padded)?;
        }
    }

    // round two: sealed symmetric seeds
    let local_seed = SessionCrypto::generate_seed(session);
    let sealed = asym::seal(pke, &peer_public, &local_seed)?;
    let padded = pad_random(prng, &sealed, params.padding.sym_key);

    let peer_sealed;
    if initiator {
        delay_upper_half(prng, params.delays.sym_key_ms);
        transport.send_encrypted(wrap_tx, flags.local_seed, 1, &padded)?;
        let plaintext = transport.recv_exchange(wrap_rx, flags.peer_seed, rx_state)?;
        peer_sealed = unpad_random(&plaintext)?;
    } else {
        let plaintext = transport.recv_exchange(wrap_rx, flags.peer_seed, rx_state)?;
        peer_sealed = unpad_random(&plaintext)?;
        delay_upper_half(prng, params.delays.sym_key_ms);
        transport.send_encrypted(wrap_tx, flags.local_seed, 1, &padded)?;
    }

    let peer_seed = match keypair.open(&peer_sealed) {
        Ok(seed) => seed,
        Err(err) => {
            transport.send_service(service_flags::TERMINATE, 0);
            return Err(err.into());
        }
    };

    Ok((local_seed, peer_seed))
}

/// Both sides prove possession of the new ciphers by echoing the profile
/// OID under them
fn confirm_switchover(
    transport: &mut KexTransport<'_>,
    rx_state: &mut RecvState,
    forward: &SessionCrypto,
    return_: &SessionCrypto,
    oid: &[u8; 16],
    initiator: bool,
) -> Result<(), DtmError> {
    let check = |plaintext: &[u8]| -> Result<(), DtmError> {
        if plaintext != oid {
            return Err(DtmError::AuthenticationFailed(
                "switchover oid mismatch".to_string(),
            ));
        }
        Ok(())
    };

    if initiator {
        transport.send_encrypted(forward, exchange_flags::ESTABLISHED, 0, oid)?;
        let plaintext = transport.recv_exchange(return_, exchange_flags::ESTABLISHED, rx_state)?;
        check(&plaintext)
    } else {
        let plaintext = transport.recv_exchange(return_, exchange_flags::ESTABLISHED, rx_state)?;
        check(&plaintext)?;
        transport.send_encrypted(forward, exchange_flags::ESTABLISHED, 0, oid)
    }
}

/// Raises the identity hook; a cancelled hook or a parameter mismatch
/// refuses the peer
fn accept_identity(
    transport: &KexTransport<'_>,
    events: &EventRegistry,
    params: &DtmParameters,
    peer: &DtmIdentity,
) -> Result<(), DtmError> {
    if PkeKind::from_id_bytes(&peer.pke_id)? != params.auth_pke_id
        || peer.session != params.auth_session
    {
        transport.send_service(service_flags::REFUSAL, 0);
        return Err(DtmError::Protocol(
            "peer proposed mismatched session parameters".to_string(),
        ));
    }

    let cancel = Arc::new(AtomicBool::new(false));
    events.emit(&SessionEvent::IdentityReceived {
        identity: peer.identity.clone(),
        oid: params.oid,
        cancel: cancel.clone(),
    });

    if cancel.load(Ordering::Relaxed) {
        transport.send_service(service_flags::REFUSAL, 0);
        return Err(DtmError::IdentityRejected);
    }

    Ok(())
}

/// The two pre-auth ciphers, derived from the domain secret per direction.
/// "forward" is initiator-to-responder.
fn preauth_pair(
    config: &DtmConfig,
    initiator: bool,
) -> Result<(SessionCrypto, SessionCrypto), DtmError> {
    let description = &config.parameters.auth_session;
    let seed_len = SessionCrypto::seed_len(description);

    let mut forward_seed = Zeroizing::new(vec![0u8; seed_len]);
    kdf::hkdf_sha256(
        &config.domain_secret,
        None,
        PREAUTH_FORWARD_INFO,
        &mut forward_seed,
    )?;
    let mut return_seed = Zeroizing::new(vec![0u8; seed_len]);
    kdf::hkdf_sha256(
        &config.domain_secret,
        None,
        PREAUTH_RETURN_INFO,
        &mut return_seed,
    )?;

    let forward = SessionCrypto::from_seed(description, &forward_seed)?;
    let return_ = SessionCrypto::from_seed(description, &return_seed)?;

    if initiator {
        Ok((forward, return_))
    } else {
        Ok((return_, forward))
    }
}

/// `[u16 pre][u16 post][pre random][data][post random]`, lengths drawn
/// uniformly from `[0, bound]`
pub(crate) fn pad_random(prng: &mut dyn Prng, data: &[u8], bounds: [u16; 2]) -> Vec<u8> {
    let pre = (prng.next_u32() % (bounds[0] as u32 + 1)) as usize;
    let post = (prng.next_u32() % (bounds[1] as u32 + 1)) as usize;

    let mut out = Vec::with_capacity(4 + pre + data.len() + post);
    out.extend_from_slice(&(pre as u16).to_le_bytes());
    out.extend_from_slice(&(post as u16).to_le_bytes());

    let mut filler = vec![0u8; pre.max(post)];
    prng.fill(&mut filler);
    out.extend_from_slice(&filler[..pre]);
    out.extend_from_slice(data);
    out.extend_from_slice(&filler[..post]);
    out
}

pub(crate) fn unpad_random(padded: &[u8]) -> Result<Vec<u8>, DtmError> {
    if padded.len() < 4 {
        return Err(DtmError::Protocol("padded payload too short".to_string()));
    }

    let pre = u16::from_le_bytes([padded[0], padded[1]]) as usize;
    let post = u16::from_le_bytes([padded[2], padded[3]]) as usize;
    let body = &padded[4..];
    if pre + post > body.len() {
        return Err(DtmError::Protocol(
            "padding lengths exceed the payload".to_string(),
        ));
    }

    Ok(body[pre..body.len() - post].to_vec())
}

/// Uniform delay in `[max/2, max]` milliseconds; the exchange-phase range
pub(crate) fn delay_upper_half(prng: &mut dyn Prng, max_ms: u64) {
    if max_ms == 0 {
        return;
    }
    let low = max_ms / 2;
    let ms = low + prng.next_u32() as u64 % (max_ms - low + 1);
    std::thread::sleep(Duration::from_millis(ms));
}

/// Uniform delay in `[0, max]` milliseconds; the post-exchange range
pub(crate) fn delay_full(prng: &mut dyn Prng, max_ms: u64) {
    if max_ms == 0 {
        return;
    }
    let ms = prng.next_u32() as u64 % (max_ms + 1);
    std::thread::sleep(Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_wire_roundtrip() {
        let params = DtmParameters::x41rnt1r1();
        let bytes = params.to_vec().unwrap();
        let parsed = DtmParameters::from_slice(&bytes).unwrap();
        assert_eq!(params, parsed);
    }

    #[test]
    fn random_padding_roundtrip() {
        let mut prng = registry::prng_of(PrngKind::Std).unwrap();
        for bounds in [[0u16, 0u16], [13, 0], [0, 13], [64, 64]] {
            let data = b"the payload under the padding";
            let padded = pad_random(prng.as_mut(), data, bounds);
            assert!(padded.len() >= data.len() + 4);
            assert_eq!(unpad_random(&padded).unwrap(), data);
        }
    }

    #[test]
    fn corrupt_padding_lengths_are_rejected() {
        assert!(unpad_random(&[1, 0]).is_err());
        // declares 300 bytes of front padding over a 2-byte body
        assert!(unpad_random(&[44, 1, 0, 0, 9, 9]).is_err());
    }

    #[test]
    fn preauth_pair_is_symmetric_across_roles() {
        let config_a = test_config(b"shared-domain".to_vec());
        let config_b = test_config(b"shared-domain".to_vec());

        let (a_tx, _a_rx) = preauth_pair(&config_a, true).unwrap();
        let (_b_tx, b_rx) = preauth_pair(&config_b, false).unwrap();

        // initiator's tx and responder's rx are the same cipher
        let header = DtmHeader::new(packet_type::EXCHANGE, 0, exchange_flags::CONNECT, 0, {
            a_tx.sealed_len(5) as u32
        });
        let sealed = a_tx.seal(&header, b"hello").unwrap();
        assert_eq!(&b_rx.open(&header, &sealed).unwrap()[..], b"hello");
    }

    fn test_config(secret: Vec<u8>) -> DtmConfig {
        DtmConfig::new(
            DtmParameters::x41rnt1r1(),
            DtmIdentity {
                identity: b"node".to_vec(),
                pke_id: PkeKind::X25519Sealed.id_bytes(),
                session: CipherDescription::rijndael_ctr_256(),
                option_flag: 0,
            },
            secret,
            240 * 1024 * 1024,
        )
    }
}
