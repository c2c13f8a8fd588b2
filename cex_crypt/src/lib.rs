//! CEX cryptography: the parallel symmetric-cipher engine, stream
//! processing pipeline, key derivation, and on-disk key containers.
#![deny(
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    variant_size_differences,
    unused_features,
    unused_results
)]

/// Convenient imports for external use
pub mod prelude {
    pub use cex_types::prelude::*;

    pub use crate::asym::{AsymKeypair, PkeKind};
    pub use crate::block_mode::{BlockModeEngine, Direction};
    pub use crate::key_package::{AccessCredential, KeyPackage};
    pub use crate::keyed_material::{KeyGenerator, KeyMaterial};
    pub use crate::misc::CryptError;
    pub use crate::registry;
    pub use crate::stream_processor::{BytesSource, StreamProcessor, StreamSource};
}

/// Sealed-seed asymmetric wrapper over the schemes the exchange can select
pub mod asym;
/// CTR/CBC/CFB/OFB over a block cipher, with the parallel decomposition
pub mod block_mode;
/// Single-key wire container with filename obfuscation
pub mod cipher_key;
/// PBKDF2 and HKDF key derivation
pub mod kdf;
/// On-disk policy-bearing subkey store
pub mod key_package;
/// Key/IV/info container and the deterministic key generator
pub mod keyed_material;
/// Error type
pub mod misc;
/// Block padding schemes
pub mod padding;
/// Primitive lookup by kind tag
pub mod registry;
/// Sequential and concurrent drivers over digests, MACs, and ciphers
pub mod stream_processor;
