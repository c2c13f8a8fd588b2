//! The DTM protocol: length-prefixed packet codec, the two-phase
//! authenticated key exchange, and the post-exchange encrypted session
//! transport.
#![deny(
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_features,
    unused_results
)]

/// Convenient imports for external use
pub mod prelude {
    pub use crate::error::DtmError;
    pub use crate::events::{ErrorSeverity, EventKind, EventRegistry, SessionEvent};
    pub use crate::kex::{DtmConfig, DtmIdentity, DtmParameters, PaddingBounds, TransmitDelays};
    pub use crate::packet::{DtmCodec, DtmHeader, DTM_HEADER_LEN, DTM_MAGIC};
    pub use crate::session::{DtmSession, SessionState};
}

/// Frame channel halves shared by the exchange and the transport
pub mod channel;
/// Error type
pub mod error;
/// Host-visible event registry
pub mod events;
/// The DTM-KEX exchange state machine
pub mod kex;
/// Packet header, flag namespaces, and the frame codec
pub mod packet;
/// Per-direction receive sequencing
pub mod sequence;
/// Post-exchange encrypted transport
pub mod session;
/// Per-frame seal/open for session traffic
pub mod session_crypto;
