// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software trust anchor for development and tests.
//!
//! Keys are public constants and random bytes come from a time-seeded,
//! non-cryptographic PRNG. Never deploy this backend.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use sha2::Sha256;
use tracing::debug;

use super::{BackendKind, Session, TrustAnchor};
use crate::derive::KeySlot;
use crate::identity::{read_machine_id, UUID_LEN};

/// Master keys: slot 0 counts up from 0x00, slot 1 counts down from 0x1F
static KEY_SLOTS: [[u8; 32]; 2] = [
    [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d,
        0x1e, 0x1f,
    ],
    [
        0x1f, 0x1e, 0x1d, 0x1c, 0x1b, 0x1a, 0x19, 0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11,
        0x10, 0x0f, 0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 0x09, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02,
        0x01, 0x00,
    ],
];

/// Largest chunk one random request hands out
const MAX_RANDOM_CHUNK: usize = 4096;

/// Simulated trust anchor
#[derive(Debug, Clone)]
pub struct Simulator {
    machine_id_path: PathBuf,
}

impl Simulator {
    pub fn new(machine_id_path: impl AsRef<Path>) -> Self {
        Self {
            machine_id_path: machine_id_path.as_ref().to_path_buf(),
        }
    }

    /// The constant master key of a slot
    pub fn master_key(slot: KeySlot) -> &'static [u8; 32] {
        &KEY_SLOTS[slot.index()]
    }
}

impl TrustAnchor for Simulator {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulator
    }

    fn connect(&self) -> Result<Box<dyn Session>> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        debug!("simulator session seeded");
        Ok(Box::new(SimulatorSession {
            rng: SmallRng::seed_from_u64(seed),
            machine_id_path: self.machine_id_path.clone(),
        }))
    }
}

struct SimulatorSession {
    rng: SmallRng,
    machine_id_path: PathBuf,
}

impl Session for SimulatorSession {
    fn hmac(&mut self, slot: KeySlot, message: &[u8]) -> Result<Vec<u8>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(Simulator::master_key(slot))
            .map_err(|_| anyhow!("invalid simulator key length"))?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn random(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; max.min(MAX_RANDOM_CHUNK)];
        self.rng.fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn identity(&mut self) -> Result<[u8; UUID_LEN]> {
        read_machine_id(&self.machine_id_path)
    }

    fn self_test(&mut self) -> Result<u32> {
        Ok(0)
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
