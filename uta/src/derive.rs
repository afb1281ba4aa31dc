// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Key derivation: HMAC-SHA256(master_key[slot], dv), truncated.
//!
//! Parameters are validated in a fixed order before the trust anchor is
//! touched: derivation value length, then key length, then key slot.

use anyhow::ensure;
use zeroize::Zeroizing;

use crate::{Result, UtaError};

/// Longest key `derive_key` hands out: one SHA-256 digest
pub const LEN_KEY_MAX: usize = 32;

/// Derivation values are always 8 bytes
pub const DV_LEN: usize = 8;

/// One of the two provisioned master keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySlot {
    Slot0,
    Slot1,
}

impl KeySlot {
    pub const ALL: [KeySlot; 2] = [KeySlot::Slot0, KeySlot::Slot1];

    pub fn index(self) -> usize {
        match self {
            KeySlot::Slot0 => 0,
            KeySlot::Slot1 => 1,
        }
    }
}

impl TryFrom<u8> for KeySlot {
    type Error = UtaError;

    fn try_from(slot: u8) -> Result<Self> {
        match slot {
            0 => Ok(KeySlot::Slot0),
            1 => Ok(KeySlot::Slot1),
            other => Err(UtaError::InvalidKeySlot(other)),
        }
    }
}

/// Caller-supplied derivation input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivationValue([u8; DV_LEN]);

impl DerivationValue {
    pub fn as_bytes(&self) -> &[u8; DV_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for DerivationValue {
    type Error = UtaError;

    fn try_from(dv: &[u8]) -> Result<Self> {
        dv.try_into()
            .map(DerivationValue)
            .map_err(|_| UtaError::InvalidDvLength(dv.len()))
    }
}

/// A validated `derive_key` call
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeriveRequest {
    pub slot: KeySlot,
    pub dv: DerivationValue,
    pub len_key: usize,
}

impl DeriveRequest {
    pub fn new(key_slot: u8, dv: &[u8], len_key: usize) -> Result<Self> {
        let dv = DerivationValue::try_from(dv)?;
        if len_key > LEN_KEY_MAX {
            return Err(UtaError::InvalidKeyLength(len_key));
        }
        let slot = KeySlot::try_from(key_slot)?;
        Ok(Self { slot, dv, len_key })
    }

    /// Cut the full digest down to the requested length, wiping the rest
    pub fn truncate(&self, digest: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let digest = Zeroizing::new(digest);
        ensure!(
            digest.len() == LEN_KEY_MAX,
            "trust anchor returned a {}-byte digest",
            digest.len()
        );
        Ok(digest[..self.len_key].to_vec())
    }
}
