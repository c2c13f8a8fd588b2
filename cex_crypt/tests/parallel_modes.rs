//! Parallel-vs-serial equivalence and round-trip coverage for the block
//! mode engine.

use cex_crypt::block_mode::{BlockModeEngine, Direction};
use cex_crypt::keyed_material::KeyMaterial;
use cex_crypt::registry;
use cex_types::crypto::{BlockCipherKind, CipherMode};
use rand::RngCore;
use rstest::rstest;

fn engine(mode: CipherMode) -> BlockModeEngine {
    BlockModeEngine::new(
        mode,
        registry::block_cipher_of(BlockCipherKind::Rijndael).unwrap(),
    )
}

fn random_material() -> KeyMaterial {
    let mut key = vec![0u8; 32];
    let mut iv = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut iv);
    KeyMaterial::new(key, iv, Vec::new())
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

fn transform(
    mode: CipherMode,
    direction: Direction,
    key: &KeyMaterial,
    input: &[u8],
    parallel: bool,
) -> Vec<u8> {
    let mut engine = engine(mode);
    engine.init(direction, key).unwrap();
    engine.set_parallel(parallel);
    if parallel {
        engine.set_parallel_block_size(1024).unwrap();
    }
    let mut output = vec![0u8; input.len()];
    engine.transform(input, &mut output).unwrap();
    output
}

/// CTR over 1036 bytes: one full 1024-byte parallel unit plus a 12-byte
/// serial tail
#[test]
fn ctr_parallel_equals_serial_1036() {
    let key = random_material();
    let plaintext = random_bytes(1036);

    let parallel = transform(CipherMode::Ctr, Direction::Encrypt, &key, &plaintext, true);
    let serial = transform(CipherMode::Ctr, Direction::Encrypt, &key, &plaintext, false);
    assert_eq!(parallel, serial);

    let dec_parallel = transform(CipherMode::Ctr, Direction::Decrypt, &key, &parallel, true);
    let dec_serial = transform(CipherMode::Ctr, Direction::Decrypt, &key, &serial, false);
    assert_eq!(dec_parallel, plaintext);
    assert_eq!(dec_serial, plaintext);
}

#[rstest]
#[case::cbc(CipherMode::Cbc)]
#[case::cfb(CipherMode::Cfb)]
fn chained_decrypt_parallel_equals_serial_2048(#[case] mode: CipherMode) {
    let key = random_material();
    let plaintext = random_bytes(2048);

    let ciphertext = transform(mode, Direction::Encrypt, &key, &plaintext, false);
    let dec_parallel = transform(mode, Direction::Decrypt, &key, &ciphertext, true);
    let dec_serial = transform(mode, Direction::Decrypt, &key, &ciphertext, false);

    assert_eq!(dec_parallel, dec_serial);
    assert_eq!(dec_parallel, plaintext);
}

/// The parallel toggle must not change output even for encrypt directions,
/// where only the serial path is legal
#[rstest]
#[case::cbc(CipherMode::Cbc)]
#[case::cfb(CipherMode::Cfb)]
#[case::ofb(CipherMode::Ofb)]
fn serial_only_modes_ignore_the_parallel_toggle(#[case] mode: CipherMode) {
    let key = random_material();
    let plaintext = random_bytes(2048);

    let with_toggle = transform(mode, Direction::Encrypt, &key, &plaintext, true);
    let without = transform(mode, Direction::Encrypt, &key, &plaintext, false);
    assert_eq!(with_toggle, without);
}

#[rstest]
#[case::ctr(CipherMode::Ctr)]
#[case::cbc(CipherMode::Cbc)]
#[case::cfb(CipherMode::Cfb)]
#[case::ofb(CipherMode::Ofb)]
fn encrypt_decrypt_roundtrip(#[case] mode: CipherMode) {
    let key = random_material();
    let plaintext = random_bytes(4096);

    let ciphertext = transform(mode, Direction::Encrypt, &key, &plaintext, true);
    assert_ne!(ciphertext, plaintext);
    let recovered = transform(mode, Direction::Decrypt, &key, &ciphertext, true);
    assert_eq!(recovered, plaintext);
}

/// Multiple parallel units in one call, plus sizes straddling the unit
/// boundary
#[rstest]
#[case(1024)]
#[case(2048)]
#[case(3072)]
#[case(1023)]
#[case(1025)]
#[case(5000)]
fn ctr_equivalence_across_sizes(#[case] len: usize) {
    let key = random_material();
    let plaintext = random_bytes(len);

    let parallel = transform(CipherMode::Ctr, Direction::Encrypt, &key, &plaintext, true);
    let serial = transform(CipherMode::Ctr, Direction::Encrypt, &key, &plaintext, false);
    assert_eq!(parallel, serial);
}

/// Sequential calls against one engine must track the counter identically
/// to a single call over the concatenation
#[test]
fn ctr_counter_survives_split_calls() {
    let key = random_material();
    let plaintext = random_bytes(4096);

    let whole = transform(CipherMode::Ctr, Direction::Encrypt, &key, &plaintext, true);

    let mut engine = engine(CipherMode::Ctr);
    engine.init(Direction::Encrypt, &key).unwrap();
    engine.set_parallel_block_size(1024).unwrap();
    let mut split = vec![0u8; 4096];
    engine.transform(&plaintext[..1536], &mut split[..1536]).unwrap();
    engine.transform(&plaintext[1536..], &mut split[1536..]).unwrap();

    assert_eq!(whole, split);
}
