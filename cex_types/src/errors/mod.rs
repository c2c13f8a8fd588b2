use std::fmt::{Debug, Display, Formatter};

/// The default error type for this crate
#[derive(Debug)]
pub enum Error {
    /// A tag on the wire did not correspond to a known kind
    UnknownKind(&'static str),
    /// Bad length
    InvalidLength,
    /// For generic error types
    Generic(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}
