use crate::errors::Error;
use serde::{Deserialize, Serialize};

/// The serialized length of a [KeyAuthority] block.
///
/// The persisted form carries the five identity fields plus the option flag;
/// `policy_flags` is replicated into every subkey policy word at creation and
/// recovered from there on open.
pub const KEY_AUTHORITY_LEN: usize = 136;

/// Package-level and per-subkey policy bits, or-able into a `u64`
pub mod package_policy {
    /// Reads must present the package tag
    pub const PACKAGE_AUTH: u64 = 1 << 0;
    /// Reads must present the domain id
    pub const DOMAIN_AUTH: u64 = 1 << 1;
    /// A read consumes the subkey: blob zeroed on disk, state becomes Used
    pub const POST_OVERWRITE: u64 = 1 << 2;
    /// The subkey expires at the authority option flag (tick timestamp)
    pub const VOLATILE: u64 = 1 << 3;
}

/// Subkey lifecycle bits. Transitions are monotone; `USED` is terminal.
pub mod subkey_state {
    pub const LOCKED: u8 = 1 << 0;
    pub const ACTIVE: u8 = 1 << 1;
    pub const EXPIRED: u8 = 1 << 2;
    pub const USED: u8 = 1 << 3;
}

/// The identity header of a key package: who may read it, where it came
/// from, and the package-wide policy.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct KeyAuthority {
    pub domain_id: [u8; 32],
    pub origin_id: [u8; 16],
    pub target_id: [u8; 16],
    pub package_id: [u8; 32],
    pub package_tag: [u8; 32],
    pub policy_flags: u64,
    /// Policy-dependent argument; under `VOLATILE` this is the expiry tick
    pub option_flag: i64,
}

impl KeyAuthority {
    /// Writes the fixed 136-byte wire form into `out`
    pub fn write_into(&self, out: &mut [u8; KEY_AUTHORITY_LEN]) {
        out[0..32].copy_from_slice(&self.domain_id);
        out[32..48].copy_from_slice(&self.origin_id);
        out[48..64].copy_from_slice(&self.target_id);
        out[64..96].copy_from_slice(&self.package_id);
        out[96..128].copy_from_slice(&self.package_tag);
        out[128..136].copy_from_slice(&self.option_flag.to_le_bytes());
    }

    /// Reads the fixed wire form; `policy_flags` is supplied by the caller
    /// (recovered from the subkey policy table)
    pub fn from_bytes(input: &[u8], policy_flags: u64) -> Result<Self, Error> {
        if input.len() < KEY_AUTHORITY_LEN {
            return Err(Error::InvalidLength);
        }

        let mut this = Self {
            domain_id: [0u8; 32],
            origin_id: [0u8; 16],
            target_id: [0u8; 16],
            package_id: [0u8; 32],
            package_tag: [0u8; 32],
            policy_flags,
            option_flag: 0,
        };

        this.domain_id.copy_from_slice(&input[0..32]);
        this.origin_id.copy_from_slice(&input[32..48]);
        this.target_id.copy_from_slice(&input[48..64]);
        this.package_id.copy_from_slice(&input[64..96]);
        this.package_tag.copy_from_slice(&input[96..128]);
        let mut opt = [0u8; 8];
        opt.copy_from_slice(&input[128..136]);
        this.option_flag = i64::from_le_bytes(opt);

        Ok(this)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_wire_roundtrip() {
        let authority = KeyAuthority {
            domain_id: [1u8; 32],
            origin_id: [2u8; 16],
            target_id: [3u8; 16],
            package_id: [4u8; 32],
            package_tag: [5u8; 32],
            policy_flags: package_policy::PACKAGE_AUTH | package_policy::POST_OVERWRITE,
            option_flag: -7,
        };

        let mut bytes = [0u8; KEY_AUTHORITY_LEN];
        authority.write_into(&mut bytes);
        let parsed = KeyAuthority::from_bytes(&bytes, authority.policy_flags).unwrap();
        assert_eq!(authority, parsed);
    }
}
