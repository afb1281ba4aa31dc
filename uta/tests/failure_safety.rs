// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle, lock release and output wiping under injected backend faults

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use uta::{BackendKind, Context, KeySlot, ReturnCode, Session, TrustAnchor, UUID_LEN};

/// Shared between the test, the anchor and its sessions
#[derive(Default)]
struct Mock {
    fail_connect: AtomicBool,
    fail_close: AtomicBool,
    panic_hmac: AtomicBool,
    zero_chunk: AtomicBool,
    /// Extra bytes returned beyond the request
    oversize: AtomicUsize,
    /// Largest chunk handed out per random request (0 = unlimited)
    random_cap: AtomicUsize,
    /// Random request number (1-based) that fails (0 = never)
    fail_random_at: AtomicUsize,
    self_test_code: AtomicU32,

    connects: AtomicUsize,
    closes: AtomicUsize,
    hmac_calls: AtomicUsize,
    random_requests: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
}

impl Mock {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn context(self: &Arc<Self>) -> Context {
        tracing_subscriber::fmt::try_init().ok();
        Context::with_anchor(Arc::new(MockAnchor(self.clone())))
    }

    fn random_requests(&self) -> Vec<usize> {
        self.random_requests.lock().unwrap().clone()
    }
}

struct MockAnchor(Arc<Mock>);

impl TrustAnchor for MockAnchor {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulator
    }

    fn connect(&self) -> Result<Box<dyn Session>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_connect.load(Ordering::SeqCst) {
            bail!("device busy");
        }
        Ok(Box::new(MockSession(self.0.clone())))
    }
}

struct MockSession(Arc<Mock>);

impl MockSession {
    /// Mark a transaction in flight for a moment
    fn transaction(&self) {
        if self.0.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.0.overlapped.store(true, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_micros(200));
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Session for MockSession {
    fn hmac(&mut self, slot: KeySlot, message: &[u8]) -> Result<Vec<u8>> {
        self.0.hmac_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.panic_hmac.load(Ordering::SeqCst) {
            panic!("trust anchor crashed");
        }
        self.transaction();
        Ok(mock_digest(slot, message))
    }

    fn random(&mut self, max: usize) -> Result<Vec<u8>> {
        self.transaction();
        let n = {
            let mut requests = self.0.random_requests.lock().unwrap();
            requests.push(max);
            requests.len()
        };
        if self.0.fail_random_at.load(Ordering::SeqCst) == n {
            bail!("transport error");
        }
        if self.0.zero_chunk.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let cap = match self.0.random_cap.load(Ordering::SeqCst) {
            0 => usize::MAX,
            cap => cap,
        };
        let len = max.min(cap) + self.0.oversize.load(Ordering::SeqCst);
        Ok(vec![0x5A; len])
    }

    fn identity(&mut self) -> Result<[u8; UUID_LEN]> {
        self.transaction();
        Ok([0xFF; UUID_LEN])
    }

    fn self_test(&mut self) -> Result<u32> {
        self.transaction();
        Ok(self.0.self_test_code.load(Ordering::SeqCst))
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_close.load(Ordering::SeqCst) {
            bail!("flush failed");
        }
        Ok(())
    }
}

fn mock_digest(slot: KeySlot, message: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([slot.index() as u8]);
    hasher.update(message);
    hasher.finalize().to_vec()
}

#[test]
fn test_open_failure_leaves_context_closed() {
    let mock = Mock::new();
    let ctx = mock.context();
    mock.fail_connect.store(true, Ordering::SeqCst);

    let err = ctx.open().unwrap_err();
    assert_eq!(err.rc(), ReturnCode::TaError);
    assert!(!ctx.is_open());
    assert_eq!(
        ctx.get_random(1).unwrap_err().rc(),
        ReturnCode::TaError
    );

    mock.fail_connect.store(false, Ordering::SeqCst);
    ctx.open().unwrap();
    assert!(ctx.is_open());
    assert_eq!(mock.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn test_invalid_parameters_never_reach_backend() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();

    assert_eq!(
        ctx.derive_key(0, &[0; 4], 16).unwrap_err().rc(),
        ReturnCode::InvalidDvLength
    );
    assert_eq!(
        ctx.derive_key(0, &[0; 8], 100).unwrap_err().rc(),
        ReturnCode::InvalidKeyLength
    );
    assert_eq!(
        ctx.derive_key(3, &[0; 8], 16).unwrap_err().rc(),
        ReturnCode::InvalidKeySlot
    );
    assert_eq!(mock.hmac_calls.load(Ordering::SeqCst), 0);

    assert_eq!(
        ctx.derive_key(1, b"abcdefgh", 20).unwrap(),
        mock_digest(KeySlot::Slot1, b"abcdefgh")[..20]
    );
    assert_eq!(mock.hmac_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_random_requests_remaining_bytes() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    mock.random_cap.store(5, Ordering::SeqCst);

    assert_eq!(ctx.get_random(23).unwrap(), vec![0x5A; 23]);
    assert_eq!(mock.random_requests(), vec![23, 18, 13, 8, 3]);
}

#[test]
fn test_random_oversized_chunk_truncated() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    mock.oversize.store(7, Ordering::SeqCst);

    assert_eq!(ctx.get_random(10).unwrap().len(), 10);
    assert_eq!(mock.random_requests(), vec![10]);
}

#[test]
fn test_random_failure_yields_no_output() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    mock.random_cap.store(4, Ordering::SeqCst);
    mock.fail_random_at.store(3, Ordering::SeqCst);

    let mut buf = [0xAAu8; 16];
    let err = ctx.fill_random(&mut buf).unwrap_err();
    assert_eq!(err.rc(), ReturnCode::TaError);
    assert_eq!(buf, [0u8; 16]);
    assert_eq!(mock.random_requests().len(), 3);

    // the lock was released on the error path
    mock.fail_random_at.store(0, Ordering::SeqCst);
    assert_eq!(ctx.get_random(10).unwrap().len(), 10);
}

#[test]
fn test_random_unbufferable_length_keeps_context_usable() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();

    assert_eq!(
        ctx.get_random(usize::MAX).unwrap_err().rc(),
        ReturnCode::TaError
    );
    assert!(mock.random_requests().is_empty());

    let mut buf = [0xAAu8; 4];
    assert!(ctx.fill_random(&mut buf).is_ok());
    assert_eq!(ctx.derive_key(0, &[1; 8], 32).unwrap().len(), 32);
}

#[test]
fn test_random_empty_chunk_is_an_error() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    mock.zero_chunk.store(true, Ordering::SeqCst);

    assert_eq!(ctx.get_random(8).unwrap_err().rc(), ReturnCode::TaError);
    assert_eq!(mock.random_requests(), vec![8]);
    // zero bytes never asks the backend
    assert!(ctx.get_random(0).unwrap().is_empty());
    assert_eq!(mock.random_requests().len(), 1);
}

#[test]
fn test_close_failure_still_closes() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    mock.fail_close.store(true, Ordering::SeqCst);

    assert_eq!(ctx.close().unwrap_err().rc(), ReturnCode::TaError);
    assert!(!ctx.is_open());
    assert_eq!(mock.closes.load(Ordering::SeqCst), 1);

    mock.fail_close.store(false, Ordering::SeqCst);
    ctx.open().unwrap();
    ctx.close().unwrap();
    assert_eq!(mock.closes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_self_test_result_code() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    ctx.self_test().unwrap();

    mock.self_test_code.store(0x101, Ordering::SeqCst);
    assert_eq!(ctx.self_test().unwrap_err().rc(), ReturnCode::TaError);
}

#[test]
fn test_device_uuid_formatting() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    let uuid = ctx.get_device_uuid().unwrap();
    assert_eq!(uuid.to_string(), "ffffffff-ffff-4fff-bfff-ffffffffffff");
}

#[test]
fn test_operations_are_serialized() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();

    thread::scope(|s| {
        for i in 0..8u8 {
            let ctx = &ctx;
            s.spawn(move || {
                for _ in 0..20 {
                    let dv = [i; 8];
                    let key = ctx.derive_key(i % 2, &dv, 32).unwrap();
                    assert_eq!(key, mock_digest(KeySlot::ALL[(i % 2) as usize], &dv));
                    assert_eq!(ctx.get_random(9).unwrap().len(), 9);
                }
            });
        }
    });
    assert!(!mock.overlapped.load(Ordering::SeqCst));
    assert_eq!(mock.hmac_calls.load(Ordering::SeqCst), 160);
}

#[test]
fn test_panic_in_backend_poisons_until_close() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    mock.panic_hmac.store(true, Ordering::SeqCst);

    let panicked = thread::scope(|s| s.spawn(|| ctx.derive_key(0, &[0; 8], 32)).join());
    assert!(panicked.is_err());
    assert_eq!(ctx.get_random(4).unwrap_err().rc(), ReturnCode::TaError);

    ctx.close().unwrap();
    assert_eq!(mock.closes.load(Ordering::SeqCst), 1);

    mock.panic_hmac.store(false, Ordering::SeqCst);
    ctx.open().unwrap();
    assert_eq!(ctx.derive_key(0, &[0; 8], 32).unwrap().len(), 32);
}

#[test]
fn test_drop_closes_session() {
    let mock = Mock::new();
    let ctx = mock.context();
    ctx.open().unwrap();
    drop(ctx);
    assert_eq!(mock.closes.load(Ordering::SeqCst), 1);

    let ctx = mock.context();
    drop(ctx);
    assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
}
