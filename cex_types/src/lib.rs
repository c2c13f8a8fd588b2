//! Types shared between the CEX crates
#![deny(
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    variant_size_differences,
    unused_features,
    unused_results
)]

/// Primitive kind tags and the cipher description record
pub mod crypto;
/// Error type
pub mod errors;
/// Key authority, package policy bits, and subkey lifecycle states
pub mod policy;
/// Byte-level helpers
pub mod utils;

/// Convenient imports for external use
pub mod prelude {
    pub use crate::crypto::{
        BlockCipherKind, CipherDescription, CipherEngine, CipherMode, DigestKind, MacKind,
        PaddingMode, PrngKind, StreamCipherKind,
    };
    pub use crate::errors::Error;
    pub use crate::policy::{package_policy, subkey_state, KeyAuthority};
}
