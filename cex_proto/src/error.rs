use cex_crypt::misc::CryptError;
use std::error::Error;
use std::fmt::Formatter;
use std::fmt::{Debug, Display};

/// The basic error type for this crate
pub enum DtmError {
    /// An operation that requires an established session ran without one
    NotEstablished,
    /// Length/bounds violation on an API input
    InvalidParameter(String),
    /// Unknown primitive kind or unsupported configuration
    Unsupported(&'static str),
    /// Malformed frame, bad magic, or a sequencing violation
    Protocol(String),
    /// MAC mismatch or decrypt failure
    AuthenticationFailed(String),
    /// Peer silent past the configured timeout
    ExchangeTimeout,
    /// Peer sent Service/Refusal
    PeerRefused,
    /// The local host rejected the peer's identity
    IdentityRejected,
    /// Receive or reassembly exceeded the allocation bound
    PayloadTooLarge(usize),
    /// Underlying socket failure
    Io(String),
}

impl Error for DtmError {}

impl Debug for DtmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_msg())
    }
}

impl Display for DtmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <Self as Debug>::fmt(self, f)
    }
}

impl DtmError {
    fn to_msg(&self) -> String {
        match self {
            DtmError::NotEstablished => "Session is not established".to_string(),
            DtmError::InvalidParameter(msg) => msg.clone(),
            DtmError::Unsupported(msg) => (*msg).to_string(),
            DtmError::Protocol(msg) => format!("Protocol violation: {msg}"),
            DtmError::AuthenticationFailed(msg) => format!("Authentication failed: {msg}"),
            DtmError::ExchangeTimeout => "Exchange timed out".to_string(),
            DtmError::PeerRefused => "Peer refused the exchange".to_string(),
            DtmError::IdentityRejected => "Local host rejected the peer identity".to_string(),
            DtmError::PayloadTooLarge(size) => format!("Payload of {size} bytes over limit"),
            DtmError::Io(msg) => msg.clone(),
        }
    }

    pub fn into_string(self) -> String {
        self.to_msg()
    }
}

impl From<std::io::Error> for DtmError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                DtmError::ExchangeTimeout
            }
            _ => DtmError::Io(err.to_string()),
        }
    }
}

impl From<CryptError> for DtmError {
    fn from(err: CryptError) -> Self {
        match err {
            CryptError::AuthenticationFailed(msg) => DtmError::AuthenticationFailed(msg),
            CryptError::NotInitialized => DtmError::NotEstablished,
            CryptError::Unsupported(msg) => DtmError::Unsupported(msg),
            CryptError::Io(msg) => DtmError::Io(msg),
            other => DtmError::InvalidParameter(other.into_string()),
        }
    }
}

impl From<bincode2::Error> for DtmError {
    fn from(err: bincode2::Error) -> Self {
        DtmError::Protocol(err.to_string())
    }
}
