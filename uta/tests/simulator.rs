// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uta::{BackendKind, Context, KeySlot, ReturnCode, Simulator, UtaConfig, Version};

const MACHINE_ID: &str = "0123456789abcdef0123456789abcdef\n";

/// Accepted range of the nibble histogram's chi-squared statistic
const CHI2_MIN: f64 = 7.24628;
const CHI2_MAX: f64 = 25.0295;

fn init_logging() {
    tracing_subscriber::fmt::try_init().ok();
}

fn machine_id_file() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    fs_err::write(file.path(), MACHINE_ID).unwrap();
    file
}

fn open_simulator(machine_id: &tempfile::NamedTempFile) -> Context {
    init_logging();
    let ctx = Context::with_anchor(Arc::new(Simulator::new(machine_id.path())));
    ctx.open().unwrap();
    ctx
}

fn reference_hmac(slot: KeySlot, dv: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(Simulator::master_key(slot)).unwrap();
    mac.update(dv);
    mac.finalize().into_bytes().to_vec()
}

#[test]
fn test_known_answer_vectors() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    let vectors = [
        (
            0,
            [1u8; 8],
            "8df3033cf2d9ffaf853fecb97c4871601955219d0b6035e1bd2ea0f2ac353e66",
        ),
        (
            0,
            [0, 1, 2, 3, 4, 5, 6, 7],
            "97c6323b0c0ee26c6a637ad3f16be38dd3cff2dbcef3fdf0a61d01110cdc3b17",
        ),
        (
            1,
            [1u8; 8],
            "95d516efce154a39dea247f0ca3e0fc10f02984af5714db5641279b2c85a9dd0",
        ),
        (
            1,
            [0, 1, 2, 3, 4, 5, 6, 7],
            "2815cd2aeb5dca4bda6b5252a9f48ec88c62c818518f29a499739735e05f4bb0",
        ),
    ];
    for (slot, dv, expected) in vectors {
        let key = ctx.derive_key(slot, &dv, 32).unwrap();
        assert_eq!(hex::encode(key), expected, "slot {slot} dv {dv:?}");
    }
    ctx.close().unwrap();
}

#[test]
fn test_derivation_is_deterministic_across_sessions() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    let dv = [0xA5u8; 8];
    let first = ctx.derive_key(1, &dv, 32).unwrap();
    assert_eq!(ctx.derive_key(1, &dv, 32).unwrap(), first);
    ctx.close().unwrap();

    ctx.open().unwrap();
    assert_eq!(ctx.derive_key(1, &dv, 32).unwrap(), first);
    ctx.close().unwrap();

    let other = open_simulator(&id);
    assert_eq!(other.derive_key(1, &dv, 32).unwrap(), first);
    assert_ne!(other.derive_key(0, &dv, 32).unwrap(), first);
}

#[test]
fn test_short_keys_are_prefixes() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    let dv = *b"prefixes";
    let full = reference_hmac(KeySlot::Slot0, &dv);
    for len in [0, 1, 8, 16, 31, 32] {
        assert_eq!(ctx.derive_key(0, &dv, len).unwrap(), full[..len]);
    }
}

#[test]
fn test_validation_precedence() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    let rc = |slot, dv: &[u8], len| ctx.derive_key(slot, dv, len).unwrap_err().rc();

    // derivation value length wins over everything
    assert_eq!(rc(7, &[0; 3], 64), ReturnCode::InvalidDvLength);
    assert_eq!(rc(0, &[0; 9], 32), ReturnCode::InvalidDvLength);
    // then key length
    assert_eq!(rc(7, &[0; 8], 33), ReturnCode::InvalidKeyLength);
    // then key slot
    assert_eq!(rc(2, &[0; 8], 32), ReturnCode::InvalidKeySlot);
    assert_eq!(rc(2, &[0; 8], 32).code(), 0x03);
}

fn chi_squared(bytes: &[u8]) -> f64 {
    let mut bins = [0u32; 16];
    for b in bytes {
        bins[(b >> 4) as usize] += 1;
        bins[(b & 0x0F) as usize] += 1;
    }
    let expected = (bytes.len() * 2) as f64 / 16.0;
    bins.iter()
        .map(|&n| (n as f64 - expected).powi(2) / expected)
        .sum()
}

#[test]
fn test_random_distribution() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    let stats: Vec<f64> = (0..5)
        .map(|_| {
            let bytes = ctx.get_random(64).unwrap();
            assert_eq!(bytes.len(), 64);
            chi_squared(&bytes)
        })
        .collect();
    assert!(
        stats.iter().any(|&x| (CHI2_MIN..=CHI2_MAX).contains(&x)),
        "chi-squared statistics out of range: {stats:?}"
    );
}

#[test]
fn test_random_lengths() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    for len in [0, 1, 63, 4096] {
        assert_eq!(ctx.get_random(len).unwrap().len(), len);
    }
    // larger than one simulator chunk
    assert_eq!(ctx.get_random(10_000).unwrap().len(), 10_000);
    assert_eq!(
        ctx.get_random(usize::MAX).unwrap_err().rc(),
        ReturnCode::TaError
    );
    let mut buf = [0u8; 48];
    ctx.fill_random(&mut buf).unwrap();
    assert!(buf.iter().any(|&b| b != 0));
}

#[test]
fn test_device_uuid() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    let uuid = ctx.get_device_uuid().unwrap();
    let bytes = uuid.as_bytes();
    assert_eq!(bytes[6] & 0xF0, 0x40);
    assert_eq!(bytes[8] & 0xC0, 0x80);
    assert_eq!(uuid.to_string(), "01234567-89ab-4def-8123-456789abcdef");
    assert_eq!(ctx.get_device_uuid().unwrap(), uuid);

    ctx.close().unwrap();
    ctx.open().unwrap();
    assert_eq!(ctx.get_device_uuid().unwrap(), uuid);
}

#[test]
fn test_device_uuid_malformed_machine_id() {
    let id = tempfile::NamedTempFile::new().unwrap();
    fs_err::write(id.path(), "not-a-machine-id").unwrap();
    let ctx = open_simulator(&id);
    let err = ctx.get_device_uuid().unwrap_err();
    assert_eq!(err.rc(), ReturnCode::TaError);
}

#[test]
fn test_self_test_passes() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    ctx.self_test().unwrap();
}

#[test]
fn test_concurrent_derivations() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    let expected: Vec<Vec<u8>> = (0..8u8)
        .map(|i| reference_hmac(KeySlot::ALL[(i % 2) as usize], &[i; 8]))
        .collect();

    std::thread::scope(|s| {
        for (i, expected) in expected.iter().enumerate() {
            let ctx = &ctx;
            s.spawn(move || {
                let i = i as u8;
                for _ in 0..50 {
                    let key = ctx.derive_key(i % 2, &[i; 8], 32).unwrap();
                    assert_eq!(&key, expected);
                }
            });
        }
    });
}

#[test]
fn test_closed_context() {
    let id = machine_id_file();
    let ctx = open_simulator(&id);
    ctx.close().unwrap();
    assert_eq!(
        ctx.derive_key(0, &[0; 8], 16).unwrap_err().rc().code(),
        0x10
    );
    assert_eq!(ctx.get_random(16).unwrap_err().rc().code(), 0x10);
    assert_eq!(ctx.get_device_uuid().unwrap_err().rc().code(), 0x10);
    assert_eq!(ctx.self_test().unwrap_err().rc().code(), 0x10);
    // parameter errors are still reported as such
    assert_eq!(
        ctx.derive_key(0, &[0; 8], 33).unwrap_err().rc(),
        ReturnCode::InvalidKeyLength
    );
}

#[test]
fn test_process_backend_selection() {
    let id = machine_id_file();
    let config = UtaConfig::simulator(id.path());
    let api = uta::init(&config).unwrap();
    assert_eq!(api.backend(), BackendKind::Simulator);
    assert_eq!(api.len_key_max(), 32);
    assert_eq!(api.context_size(), Context::size());

    let version = api.get_version();
    assert_eq!(version.uta_type, BackendKind::Simulator);
    assert_eq!(version.version, Version::new(1, 2, 0));
    assert_eq!(version.to_string(), "0 1.2.0");

    // same backend: same handle
    assert!(std::ptr::eq(uta::init(&config).unwrap(), api));
    // no switching at runtime
    let device = UtaConfig {
        backend: BackendKind::TpmDevice,
        ..Default::default()
    };
    assert!(uta::init(&device).unwrap_err().is_trust_anchor());
    assert!(std::ptr::eq(uta::selected().unwrap(), api));

    let ctx = api.new_context();
    assert_eq!(ctx.kind(), BackendKind::Simulator);
    ctx.open().unwrap();
    assert_eq!(
        hex::encode(ctx.derive_key(0, &[1; 8], 32).unwrap()),
        "8df3033cf2d9ffaf853fecb97c4871601955219d0b6035e1bd2ea0f2ac353e66"
    );
    ctx.close().unwrap();
}
