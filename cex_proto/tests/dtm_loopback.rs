//! Two endpoints over a loopback socket: full exchange, traffic, rekey,
//! file transfer, teardown.

use cex_crypt::asym::PkeKind;
use cex_proto::prelude::*;
use cex_types::crypto::CipherDescription;
use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn endpoint_config(identity: &[u8], secret: &[u8]) -> DtmConfig {
    let mut config = DtmConfig::new(
        DtmParameters::x41rnt1r1(),
        DtmIdentity {
            identity: identity.to_vec(),
            pke_id: PkeKind::X25519Sealed.id_bytes(),
            session: CipherDescription::rijndael_ctr_256(),
            option_flag: 0,
        },
        secret.to_vec(),
        240 * 1024 * 1024,
    );
    config.exchange_timeout = Duration::from_secs(10);
    config.keep_alive_interval = Duration::from_secs(2);
    config
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

/// Full happy path: exchange, a 32-byte message, disconnect, zeroized keys
#[test]
fn exchange_message_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let responder_events = Arc::new(EventRegistry::new());
    let (data_tx, data_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let _ = responder_events.subscribe(
        EventKind::DataReceived,
        Box::new(move |event| {
            if let SessionEvent::DataReceived(data) = event {
                let _ = data_tx.send(data.clone());
            }
        }),
    );

    let responder_handle = std::thread::spawn(move || {
        DtmSession::accept(
            &listener,
            endpoint_config(b"responder-node", b"the domain shared secret"),
            responder_events,
        )
        .unwrap()
    });

    let initiator_events = Arc::new(EventRegistry::new());
    let identity_seen = Arc::new(AtomicBool::new(false));
    let seen = identity_seen.clone();
    let _ = initiator_events.subscribe(
        EventKind::IdentityReceived,
        Box::new(move |event| {
            if let SessionEvent::IdentityReceived { identity, .. } = event {
                assert_eq!(identity, b"responder-node");
                seen.store(true, Ordering::Relaxed);
            }
        }),
    );

    let initiator = DtmSession::connect(
        addr,
        endpoint_config(b"initiator-node", b"the domain shared secret"),
        initiator_events,
    )
    .unwrap();
    let responder = responder_handle.join().unwrap();

    assert_eq!(initiator.state(), SessionState::Established);
    assert_eq!(responder.state(), SessionState::Established);
    assert!(identity_seen.load(Ordering::Relaxed));
    assert_eq!(initiator.peer_identity().identity, b"responder-node");
    assert_eq!(responder.peer_identity().identity, b"initiator-node");

    let message: Vec<u8> = (0..32u8).collect();
    initiator.send(&message).unwrap();
    let received = data_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(received, message);

    initiator.disconnect().unwrap();
    wait_for("responder to close", || {
        responder.state() == SessionState::Closed
    });
    responder.disconnect().unwrap();

    assert_eq!(initiator.state(), SessionState::Closed);
    assert!(initiator.keys_scrubbed());
    assert!(responder.keys_scrubbed());
}

/// A cancelled identity hook refuses the peer on both sides
#[test]
fn identity_refusal_tears_down() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let responder_events = Arc::new(EventRegistry::new());
    let _ = responder_events.subscribe(
        EventKind::IdentityReceived,
        Box::new(|event| {
            if let SessionEvent::IdentityReceived { cancel, .. } = event {
                cancel.store(true, Ordering::Relaxed);
            }
        }),
    );

    let responder_handle = std::thread::spawn(move || {
        DtmSession::accept(
            &listener,
            endpoint_config(b"responder", b"shared"),
            responder_events,
        )
    });

    let initiator = DtmSession::connect(
        addr,
        endpoint_config(b"initiator", b"shared"),
        Arc::new(EventRegistry::new()),
    );
    assert!(matches!(initiator, Err(DtmError::PeerRefused)));
    assert!(matches!(
        responder_handle.join().unwrap(),
        Err(DtmError::IdentityRejected)
    ));
}

/// Mismatched domain secrets fail authentication, never establishing
#[test]
fn wrong_domain_secret_fails_auth() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let responder_handle = std::thread::spawn(move || {
        DtmSession::accept(
            &listener,
            endpoint_config(b"responder", b"secret-one"),
            Arc::new(EventRegistry::new()),
        )
    });

    let initiator = DtmSession::connect(
        addr,
        endpoint_config(b"initiator", b"secret-two"),
        Arc::new(EventRegistry::new()),
    );
    assert!(initiator.is_err());
    assert!(matches!(
        responder_handle.join().unwrap(),
        Err(DtmError::AuthenticationFailed(_))
    ));
}

/// Resync swaps the session ciphers without tearing the transport down
#[test]
fn rekey_produces_fresh_ciphers() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let responder_events = Arc::new(EventRegistry::new());
    let (data_tx, data_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let _ = responder_events.subscribe(
        EventKind::DataReceived,
        Box::new(move |event| {
            if let SessionEvent::DataReceived(data) = event {
                let _ = data_tx.send(data.clone());
            }
        }),
    );

    let responder_handle = std::thread::spawn(move || {
        DtmSession::accept(
            &listener,
            endpoint_config(b"responder", b"rekey secret"),
            responder_events,
        )
        .unwrap()
    });

    let initiator_events = Arc::new(EventRegistry::new());
    let establishments = Arc::new(AtomicU32::new(0));
    let counter = establishments.clone();
    let _ = initiator_events.subscribe(
        EventKind::SessionEstablished,
        Box::new(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let initiator =
        DtmSession::connect(addr, endpoint_config(b"initiator", b"rekey secret"), initiator_events)
            .unwrap();
    let responder = responder_handle.join().unwrap();

    // the initial exchange already emitted one establishment event
    assert_eq!(establishments.load(Ordering::SeqCst), 1);

    initiator.resync().unwrap();
    wait_for("rekey to complete", || {
        initiator.state() == SessionState::Established
            && establishments.load(Ordering::SeqCst) >= 2
    });
    wait_for("responder to settle", || {
        responder.state() == SessionState::Established
    });

    // traffic still flows under the fresh ciphers
    initiator.send(b"post-rekey message").unwrap();
    let received = data_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(received, b"post-rekey message");

    initiator.disconnect().unwrap();
    wait_for("responder to close", || {
        responder.state() == SessionState::Closed
    });
    responder.disconnect().unwrap();
}

/// A file lands at the host-chosen path with its chained MAC verified
#[test]
fn file_transfer_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("payload.bin");
    let dest_path = dir.path().join("received.bin");

    let contents: Vec<u8> = (0..150_000u32).map(|i| (i % 249) as u8).collect();
    let mut source = std::fs::File::create(&source_path).unwrap();
    source.write_all(&contents).unwrap();
    source.sync_all().unwrap();

    let responder_events = Arc::new(EventRegistry::new());
    let (file_tx, file_rx) = crossbeam_channel::unbounded::<PathBuf>();
    let _ = responder_events.subscribe(
        EventKind::FileReceived,
        Box::new(move |event| {
            if let SessionEvent::FileReceived(path) = event {
                let _ = file_tx.send(path.clone());
            }
        }),
    );

    let responder_handle = std::thread::spawn(move || {
        DtmSession::accept(
            &listener,
            endpoint_config(b"responder", b"transfer secret"),
            responder_events,
        )
        .unwrap()
    });

    let initiator = DtmSession::connect(
        addr,
        endpoint_config(b"initiator", b"transfer secret"),
        Arc::new(EventRegistry::new()),
    )
    .unwrap();
    let responder = responder_handle.join().unwrap();

    let accepted = dest_path.clone();
    responder.set_file_request_handler(Box::new(move |name, total| {
        assert_eq!(name, "payload.bin");
        assert_eq!(total, 150_000);
        Some(accepted.clone())
    }));

    initiator.send_file(&source_path).unwrap();

    let landed = file_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(landed, dest_path);
    assert_eq!(std::fs::read(&dest_path).unwrap(), contents);
    assert!(!dest_path.with_extension("part").exists());

    initiator.disconnect().unwrap();
    wait_for("responder to close", || {
        responder.state() == SessionState::Closed
    });
    responder.disconnect().unwrap();
}
