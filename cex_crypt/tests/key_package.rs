//! Post-overwrite lifecycle coverage for the key package container.

use cex_crypt::key_package::{AccessCredential, KeyPackage};
use cex_crypt::keyed_material::KeyGenerator;
use cex_types::crypto::{CipherDescription, DigestKind, PrngKind};
use cex_types::policy::{package_policy, subkey_state, KeyAuthority};
use std::io::Read;

fn authority(policy_flags: u64) -> KeyAuthority {
    KeyAuthority {
        domain_id: [0x0D; 32],
        origin_id: [0x0E; 16],
        target_id: [0x0F; 16],
        package_id: [0x10; 32],
        package_tag: [0x11; 32],
        policy_flags,
        option_flag: 0,
    }
}

/// Header size for an N-subkey package: authority + description + created +
/// count + N table entries
fn blob_region_start(count: u64) -> u64 {
    136 + 32 + 8 + 4 + count * 25 + 16 + 4
}

#[test]
fn post_overwrite_consumes_the_subkey() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.key");
    let description = CipherDescription::rijndael_ctr_256();
    let blob_size = (description.key_bytes() + description.iv_bytes()) as u64;

    let mut generator = KeyGenerator::new(PrngKind::Std, DigestKind::Sha256).unwrap();
    let mut package = KeyPackage::create(
        &path,
        authority(package_policy::POST_OVERWRITE),
        description,
        10,
        &mut generator,
    )
    .unwrap();

    let id = package.subkey_ids()[3];
    let (_, material, _) = package.read(id, &AccessCredential::none()).unwrap();
    assert!(!material.is_scrubbed());
    assert_eq!(material.key().len(), 32);
    assert_eq!(material.iv().len(), 16);

    // second read of a consumed subkey is refused
    let err = package.read(id, &AccessCredential::none()).unwrap_err();
    assert!(err.into_string().contains("unavailable"));
    assert_eq!(
        package.subkey_state(3).unwrap() & subkey_state::USED,
        subkey_state::USED
    );

    // the blob region on disk is now all zero; its neighbors are not
    let mut raw = Vec::new();
    let _ = std::fs::File::open(&path)
        .unwrap()
        .read_to_end(&mut raw)
        .unwrap();
    let start = (blob_region_start(10) + 3 * blob_size) as usize;
    let end = start + blob_size as usize;
    assert!(raw[start..end].iter().all(|b| *b == 0));
    assert!(raw[end..end + blob_size as usize].iter().any(|b| *b != 0));
}

#[test]
fn consumed_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.key");
    let mut generator = KeyGenerator::new(PrngKind::Std, DigestKind::Sha256).unwrap();
    let mut package = KeyPackage::create(
        &path,
        authority(package_policy::POST_OVERWRITE),
        CipherDescription::rijndael_ctr_256(),
        4,
        &mut generator,
    )
    .unwrap();

    let id = package.subkey_ids()[0];
    let _ = package.read(id, &AccessCredential::none()).unwrap();
    drop(package);

    let mut reopened = KeyPackage::open(&path).unwrap();
    assert!(reopened.read(id, &AccessCredential::none()).is_err());

    // the other subkeys are unaffected
    let other = reopened.subkey_ids()[1];
    assert!(reopened.read(other, &AccessCredential::none()).is_ok());
}

/// A crash between the blob overwrite and the state flip leaves an
/// all-zero blob with an Active state; open() must finish the transition
#[test]
fn open_recovers_interrupted_post_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.key");
    let description = CipherDescription::rijndael_ctr_256();
    let blob_size = (description.key_bytes() + description.iv_bytes()) as u64;

    let mut generator = KeyGenerator::new(PrngKind::Std, DigestKind::Sha256).unwrap();
    let package = KeyPackage::create(
        &path,
        authority(package_policy::POST_OVERWRITE),
        description,
        3,
        &mut generator,
    )
    .unwrap();
    let id = package.subkey_ids()[2];
    drop(package);

    // simulate the crash: zero the blob but leave the state Active
    use std::io::{Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap();
    let _ = file
        .seek(SeekFrom::Start(blob_region_start(3) + 2 * blob_size))
        .unwrap();
    file.write_all(&vec![0u8; blob_size as usize]).unwrap();
    file.sync_all().unwrap();

    let mut recovered = KeyPackage::open(&path).unwrap();
    assert_eq!(
        recovered.subkey_state(2).unwrap() & subkey_state::USED,
        subkey_state::USED
    );
    assert!(recovered.read(id, &AccessCredential::none()).is_err());
}
