//! On-disk policy-bearing subkey store.
//!
//! Layout, all little-endian:
//!
//! ```text
//! [authority: 136 B]
//! [description: 32 B]
//! [created: 8 B i64]
//! [subkey_count: 4 B u32]
//! [per subkey i in 0..N : { policy: 8 B, id: 16 B, state: 1 B }]
//! [extension: 16 B]
//! [subkey_blob_size: 4 B u32]
//! [per subkey i : blob of subkey_blob_size]
//! ```
//!
//! There is no trailer and no checksum; integrity is the caller's business.
//! Subkey states only ever move forward; a consumed (`Used`) subkey never
//! becomes readable again. Under the `POST_OVERWRITE` policy a read zeroes
//! the blob on disk before the state flip is persisted, so a crash between
//! the two is recovered on open by treating an all-zero blob as consumed.

use crate::keyed_material::{KeyGenerator, KeyMaterial};
use crate::misc::CryptError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cex_logging::warn;
use cex_types::crypto::{CipherDescription, CIPHER_DESCRIPTION_LEN};
use cex_types::policy::{package_policy, subkey_state, KeyAuthority, KEY_AUTHORITY_LEN};
use cex_types::utils::const_time_compare;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SUBKEY_ENTRY_LEN: u64 = 8 + 16 + 1;

/// Proof-of-access material presented on read
#[derive(Default, Clone)]
pub struct AccessCredential {
    pub package_tag: Option<[u8; 32]>,
    pub domain_id: Option<[u8; 32]>,
}

impl AccessCredential {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_package_tag(tag: [u8; 32]) -> Self {
        Self {
            package_tag: Some(tag),
            domain_id: None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct SubkeyEntry {
    policy: u64,
    id: u128,
    state: u8,
}

/// A handle over an on-disk key package
pub struct KeyPackage {
    path: PathBuf,
    authority: KeyAuthority,
    description: CipherDescription,
    created: i64,
    entries: Vec<SubkeyEntry>,
    extension: [u8; 16],
    blob_size: u32,
}

impl KeyPackage {
    /// Creates a package of `count` freshly generated subkeys at `path`,
    /// all `Active`, each carrying the authority's policy flags
    pub fn create(
        path: &Path,
        authority: KeyAuthority,
        description: CipherDescription,
        count: u32,
        generator: &mut KeyGenerator,
    ) -> Result<Self, CryptError> {
        let blob_size = (description.key_bytes() + description.iv_bytes()) as u32;
        let entries: Vec<SubkeyEntry> = (0..count)
            .map(|_| SubkeyEntry {
                policy: authority.policy_flags,
                id: uuid::Uuid::new_v4().as_u128(),
                state: subkey_state::ACTIVE,
            })
            .collect();

        let mut extension = [0u8; 16];
        let mut ext_material = generator.derive(b"package-extension", 16, 0)?;
        extension.copy_from_slice(ext_material.key());
        ext_material.scrub();

        let created = now_ticks();

        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        let mut authority_bytes = [0u8; KEY_AUTHORITY_LEN];
        authority.write_into(&mut authority_bytes);
        file.write_all(&authority_bytes)?;
        file.write_all(&description.to_bytes())?;
        file.write_i64::<LittleEndian>(created)?;
        file.write_u32::<LittleEndian>(count)?;

        for entry in &entries {
            file.write_u64::<LittleEndian>(entry.policy)?;
            file.write_u128::<LittleEndian>(entry.id)?;
            file.write_u8(entry.state)?;
        }

        file.write_all(&extension)?;
        file.write_u32::<LittleEndian>(blob_size)?;

        for _ in 0..count {
            let mut material = generator.generate(&description);
            file.write_all(material.key())?;
            file.write_all(material.iv())?;
            material.scrub();
        }

        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            authority,
            description,
            created,
            entries,
            extension,
            blob_size,
        })
    }

    /// Opens an existing package, recovering any `Active` post-overwrite
    /// subkey whose blob was already zeroed by an interrupted read
    pub fn open(path: &Path) -> Result<Self, CryptError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut this = Self::parse(&mut file, path)?;

        for index in 0..this.entries.len() {
            let entry = this.entries[index];
            if entry.policy & package_policy::POST_OVERWRITE != 0
                && entry.state & subkey_state::ACTIVE != 0
                && entry.state & subkey_state::USED == 0
            {
                let blob = this.read_blob(&mut file, index)?;
                if blob.iter().all(|b| *b == 0) {
                    warn!(target: "cex", "subkey {index} was zeroed but never marked; completing the consume");
                    this.persist_state(&mut file, index, entry.state | subkey_state::USED)?;
                    file.sync_all()?;
                }
            }
        }

        Ok(this)
    }

    fn parse<R: Read + Seek>(stream: &mut R, path: &Path) -> Result<Self, CryptError> {
        let mut authority_bytes = [0u8; KEY_AUTHORITY_LEN];
        stream.read_exact(&mut authority_bytes)?;

        let mut description_bytes = [0u8; CIPHER_DESCRIPTION_LEN];
        stream.read_exact(&mut description_bytes)?;
        let description = CipherDescription::from_bytes(&description_bytes)?;

        let created = stream.read_i64::<LittleEndian>()?;
        let count = stream.read_u32::<LittleEndian>()?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let policy = stream.read_u64::<LittleEndian>()?;
            let id = stream.read_u128::<LittleEndian>()?;
            let state = stream.read_u8()?;
            entries.push(SubkeyEntry { policy, id, state });
        }

        let mut extension = [0u8; 16];
        stream.read_exact(&mut extension)?;
        let blob_size = stream.read_u32::<LittleEndian>()?;

        // package policy is replicated into every subkey at creation
        let policy_flags = entries.first().map(|entry| entry.policy).unwrap_or(0);
        let authority = KeyAuthority::from_bytes(&authority_bytes, policy_flags)?;

        Ok(Self {
            path: path.to_path_buf(),
            authority,
            description,
            created,
            entries,
            extension,
            blob_size,
        })
    }

    pub fn authority(&self) -> &KeyAuthority {
        &self.authority
    }

    pub fn description(&self) -> &CipherDescription {
        &self.description
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn subkey_count(&self) -> usize {
        self.entries.len()
    }

    pub fn subkey_ids(&self) -> Vec<u128> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    pub fn subkey_state(&self, index: usize) -> Option<u8> {
        self.entries.get(index).map(|entry| entry.state)
    }

    /// Reads the subkey with the given id, enforcing its policy. Consuming
    /// policies mutate the file before this returns.
    pub fn read(
        &mut self,
        id: u128,
        credential: &AccessCredential,
    ) -> Result<(CipherDescription, KeyMaterial, [u8; 16]), CryptError> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| CryptError::AuthenticationFailed("subkey unavailable".to_string()))?;

        let entry = self.entries[index];
        if entry.state & (subkey_state::USED | subkey_state::EXPIRED) != 0
            || entry.state & subkey_state::ACTIVE == 0
        {
            return Err(CryptError::AuthenticationFailed(
                "subkey unavailable".to_string(),
            ));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        if entry.policy & package_policy::VOLATILE != 0 && self.authority.option_flag < now_ticks()
        {
            self.persist_state(&mut file, index, entry.state | subkey_state::EXPIRED)?;
            file.sync_all()?;
            return Err(CryptError::AuthenticationFailed(
                "subkey expired".to_string(),
            ));
        }

        self.check_credential(entry.policy, credential)?;

        let blob = self.read_blob(&mut file, index)?;
        let key_len = self.description.key_bytes();
        let material = KeyMaterial::new(
            blob[..key_len].to_vec(),
            blob[key_len..].to_vec(),
            Vec::new(),
        );

        if entry.policy & package_policy::POST_OVERWRITE != 0 {
            // zero the blob before the state flip so a crash in between is
            // recoverable on open
            let zeros = vec![0u8; self.blob_size as usize];
            let _ = file.seek(SeekFrom::Start(self.blob_offset(index)))?;
            file.write_all(&zeros)?;
            self.persist_state(&mut file, index, entry.state | subkey_state::USED)?;
            file.sync_all()?;
        }

        Ok((self.description, material, self.extension))
    }

    /// Positional read without policy enforcement or mutation; volume-key
    /// mode where `id == index`
    pub fn read_at<S: Read + Seek>(
        stream: &mut S,
        index: usize,
    ) -> Result<(CipherDescription, KeyMaterial, [u8; 16]), CryptError> {
        let this = Self::parse(stream, Path::new(""))?;
        if index >= this.entries.len() {
            return Err(CryptError::InvalidParameter(format!(
                "subkey index {index} out of range"
            )));
        }

        let _ = stream.seek(SeekFrom::Start(this.blob_offset(index)))?;
        let mut blob = vec![0u8; this.blob_size as usize];
        stream.read_exact(&mut blob)?;

        let key_len = this.description.key_bytes();
        let material = KeyMaterial::new(
            blob[..key_len].to_vec(),
            blob[key_len..].to_vec(),
            Vec::new(),
        );
        Ok((this.description, material, this.extension))
    }

    fn check_credential(
        &self,
        policy: u64,
        credential: &AccessCredential,
    ) -> Result<(), CryptError> {
        if policy & package_policy::PACKAGE_AUTH != 0 {
            let presented = credential
                .package_tag
                .as_ref()
                .ok_or_else(|| CryptError::AuthenticationFailed("unauthorized".to_string()))?;
            if !const_time_compare(presented, &self.authority.package_tag) {
                return Err(CryptError::AuthenticationFailed("unauthorized".to_string()));
            }
        }

        if policy & package_policy::DOMAIN_AUTH != 0 {
            let presented = credential
                .domain_id
                .as_ref()
                .ok_or_else(|| CryptError::AuthenticationFailed("unauthorized".to_string()))?;
            if !const_time_compare(presented, &self.authority.domain_id) {
                return Err(CryptError::AuthenticationFailed("unauthorized".to_string()));
            }
        }

        Ok(())
    }

    fn table_offset(&self) -> u64 {
        (KEY_AUTHORITY_LEN + CIPHER_DESCRIPTION_LEN) as u64 + 8 + 4
    }

    fn state_offset(&self, index: usize) -> u64 {
        self.table_offset() + index as u64 * SUBKEY_ENTRY_LEN + 8 + 16
    }

    fn blob_offset(&self, index: usize) -> u64 {
        self.table_offset()
            + self.entries.len() as u64 * SUBKEY_ENTRY_LEN
            + 16
            + 4
            + index as u64 * self.blob_size as u64
    }

    fn read_blob(&self, file: &mut File, index: usize) -> Result<Vec<u8>, CryptError> {
        let _ = file.seek(SeekFrom::Start(self.blob_offset(index)))?;
        let mut blob = vec![0u8; self.blob_size as usize];
        file.read_exact(&mut blob)?;
        Ok(blob)
    }

    fn persist_state(
        &mut self,
        file: &mut File,
        index: usize,
        state: u8,
    ) -> Result<(), CryptError> {
        let _ = file.seek(SeekFrom::Start(self.state_offset(index)))?;
        file.write_u8(state)?;
        self.entries[index].state = state;
        Ok(())
    }
}

fn now_ticks() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cex_types::crypto::{DigestKind, PrngKind};

    fn authority(policy_flags: u64, option_flag: i64) -> KeyAuthority {
        KeyAuthority {
            domain_id: [0xD0; 32],
            origin_id: [0x01; 16],
            target_id: [0x02; 16],
            package_id: [0xAB; 32],
            package_tag: [0xEE; 32],
            policy_flags,
            option_flag,
        }
    }

    fn generator() -> KeyGenerator {
        KeyGenerator::new(PrngKind::Std, DigestKind::Sha256).unwrap()
    }

    #[test]
    fn create_then_reopen_preserves_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.key");
        let package = KeyPackage::create(
            &path,
            authority(0, 0),
            CipherDescription::rijndael_ctr_256(),
            4,
            &mut generator(),
        )
        .unwrap();
        let ids = package.subkey_ids();

        let reopened = KeyPackage::open(&path).unwrap();
        assert_eq!(reopened.subkey_ids(), ids);
        assert_eq!(reopened.subkey_count(), 4);
        assert_eq!(
            reopened.description(),
            &CipherDescription::rijndael_ctr_256()
        );
    }

    #[test]
    fn subkey_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.key");
        let package = KeyPackage::create(
            &path,
            authority(0, 0),
            CipherDescription::rijndael_ctr_256(),
            16,
            &mut generator(),
        )
        .unwrap();

        let mut ids = package.subkey_ids();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn package_auth_requires_matching_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.key");
        let mut package = KeyPackage::create(
            &path,
            authority(package_policy::PACKAGE_AUTH, 0),
            CipherDescription::rijndael_ctr_256(),
            2,
            &mut generator(),
        )
        .unwrap();
        let id = package.subkey_ids()[0];

        assert!(package.read(id, &AccessCredential::none()).is_err());
        assert!(package
            .read(id, &AccessCredential::with_package_tag([0x11; 32]))
            .is_err());
        assert!(package
            .read(id, &AccessCredential::with_package_tag([0xEE; 32]))
            .is_ok());
    }

    #[test]
    fn volatile_rejects_past_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.key");
        let mut package = KeyPackage::create(
            &path,
            authority(package_policy::VOLATILE, now_ticks() - 10),
            CipherDescription::rijndael_ctr_256(),
            1,
            &mut generator(),
        )
        .unwrap();
        let id = package.subkey_ids()[0];

        let err = package.read(id, &AccessCredential::none()).unwrap_err();
        assert!(matches!(err, CryptError::AuthenticationFailed(ref msg) if msg.contains("expired")));
        assert_eq!(
            package.subkey_state(0).unwrap() & subkey_state::EXPIRED,
            subkey_state::EXPIRED
        );
    }

    #[test]
    fn read_at_is_positional_and_side_effect_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.key");
        let mut package = KeyPackage::create(
            &path,
            authority(0, 0),
            CipherDescription::rijndael_ctr_256(),
            3,
            &mut generator(),
        )
        .unwrap();
        let id = package.subkey_ids()[1];
        let (_, via_id, _) = package.read(id, &AccessCredential::none()).unwrap();

        let mut file = File::open(&path).unwrap();
        let (_, via_index, _) = KeyPackage::read_at(&mut file, 1).unwrap();
        assert_eq!(via_id, via_index);
    }
}
