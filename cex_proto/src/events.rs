//! Host-visible session events.
//!
//! Listeners subscribe per event kind and are invoked synchronously from
//! the thread that produced the event (the receive thread for inbound
//! traffic). Handlers must not block.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorSeverity {
    Warning,
    Error,
    Fatal,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A peer identity arrived during the exchange. Setting `cancel`
    /// refuses the peer and tears the exchange down.
    IdentityReceived {
        identity: Vec<u8>,
        oid: [u8; 16],
        cancel: Arc<AtomicBool>,
    },
    PacketReceived {
        packet_type: u8,
        packet_flag: u16,
        length: usize,
    },
    PacketSent {
        packet_type: u8,
        packet_flag: u16,
        length: usize,
    },
    SessionEstablished {
        forward_fingerprint: [u8; 32],
        return_fingerprint: [u8; 32],
    },
    DataReceived(Vec<u8>),
    FileReceived(PathBuf),
    SessionError {
        severity: ErrorSeverity,
        message: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    IdentityReceived,
    PacketReceived,
    PacketSent,
    SessionEstablished,
    DataReceived,
    FileReceived,
    SessionError,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::IdentityReceived { .. } => EventKind::IdentityReceived,
            SessionEvent::PacketReceived { .. } => EventKind::PacketReceived,
            SessionEvent::PacketSent { .. } => EventKind::PacketSent,
            SessionEvent::SessionEstablished { .. } => EventKind::SessionEstablished,
            SessionEvent::DataReceived(_) => EventKind::DataReceived,
            SessionEvent::FileReceived(_) => EventKind::FileReceived,
            SessionEvent::SessionError { .. } => EventKind::SessionError,
        }
    }
}

type Callback = Box<dyn Fn(&SessionEvent) + Send + Sync>;

struct Listener {
    id: u64,
    kind: EventKind,
    callback: Callback,
}

/// Typed listener registry with explicit subscribe/unsubscribe
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `kind`; returns a token for
    /// [Self::unsubscribe]
    pub fn subscribe(&self, kind: EventKind, callback: Callback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Listener { id, kind, callback });
        id
    }

    /// Removes a listener; returns whether it existed
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    /// Invokes every listener registered for the event's kind, in
    /// subscription order
    pub fn emit(&self, event: &SessionEvent) {
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            if listener.kind == event.kind() {
                (listener.callback)(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn subscribe_emit_unsubscribe() {
        let registry = EventRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));

        let hits_cb = hits.clone();
        let id = registry.subscribe(
            EventKind::DataReceived,
            Box::new(move |_| {
                let _ = hits_cb.fetch_add(1, Ordering::Relaxed);
            }),
        );

        registry.emit(&SessionEvent::DataReceived(vec![1]));
        registry.emit(&SessionEvent::SessionError {
            severity: ErrorSeverity::Warning,
            message: "other kind".to_string(),
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&SessionEvent::DataReceived(vec![2]));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
