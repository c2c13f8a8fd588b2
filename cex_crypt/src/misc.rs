use std::fmt::{Debug, Display, Formatter};

/// Default Error type for this crate
#[derive(Clone)]
pub enum CryptError<T = String> {
    /// An engine method was called before `init`
    NotInitialized,
    /// Length, alignment, or bounds violation on an API input
    InvalidParameter(T),
    /// Unknown primitive kind or unsupported mode combination
    Unsupported(&'static str),
    /// MAC mismatch, decrypt failure, or key-policy mismatch
    AuthenticationFailed(T),
    /// A short read occurred before the declared end of the stream
    UnexpectedEof,
    /// The stream operation was cancelled by the host
    Cancelled,
    /// Underlying stream failure
    Io(T),
}

impl<T> CryptError<T> {
    /// Use for converting to different types
    pub fn into_string(self) -> String
    where
        T: Into<String>,
    {
        match self {
            CryptError::NotInitialized => "[CryptError] Engine not initialized".to_string(),
            CryptError::InvalidParameter(s) => s.into(),
            CryptError::Unsupported(s) => format!("[CryptError] Unsupported: {s}"),
            CryptError::AuthenticationFailed(s) => s.into(),
            CryptError::UnexpectedEof => "[CryptError] Unexpected end of stream".to_string(),
            CryptError::Cancelled => "[CryptError] Operation cancelled".to_string(),
            CryptError::Io(s) => s.into(),
        }
    }

    pub fn as_str(&self) -> &str
    where
        T: AsRef<str>,
    {
        match self {
            CryptError::NotInitialized => "[CryptError] Engine not initialized",
            CryptError::InvalidParameter(s) => s.as_ref(),
            CryptError::Unsupported(s) => s,
            CryptError::AuthenticationFailed(s) => s.as_ref(),
            CryptError::UnexpectedEof => "[CryptError] Unexpected end of stream",
            CryptError::Cancelled => "[CryptError] Operation cancelled",
            CryptError::Io(s) => s.as_ref(),
        }
    }
}

impl<T: AsRef<str>> Debug for CryptError<T> {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

impl<T: AsRef<str>> Display for CryptError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl<T: AsRef<str>> std::error::Error for CryptError<T> {}

impl From<std::io::Error> for CryptError {
    fn from(err: std::io::Error) -> Self {
        CryptError::Io(err.to_string())
    }
}

impl From<cex_types::errors::Error> for CryptError {
    fn from(err: cex_types::errors::Error) -> Self {
        CryptError::InvalidParameter(err.to_string())
    }
}
