// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::{DV_LEN, LEN_KEY_MAX};

pub type Result<T> = std::result::Result<T, UtaError>;

#[derive(Debug, Error)]
pub enum UtaError {
    #[error("invalid key length: {0} (at most {max})", max = LEN_KEY_MAX)]
    InvalidKeyLength(usize),
    #[error("invalid derivation value length: {0} (expected {len})", len = DV_LEN)]
    InvalidDvLength(usize),
    #[error("invalid key slot: {0}")]
    InvalidKeySlot(u8),
    /// Any failure of the underlying trust anchor. The chain is kept for
    /// logging only; callers see a single return code.
    #[error("trust anchor error: {0:#}")]
    TrustAnchor(#[from] anyhow::Error),
}

/// Integer return codes shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReturnCode {
    Success = 0x00,
    InvalidKeyLength = 0x01,
    InvalidDvLength = 0x02,
    InvalidKeySlot = 0x03,
    TaError = 0x10,
}

impl ReturnCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Return code of an operation result
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ReturnCode::Success,
            Err(e) => e.rc(),
        }
    }
}

impl UtaError {
    pub fn rc(&self) -> ReturnCode {
        match self {
            UtaError::InvalidKeyLength(_) => ReturnCode::InvalidKeyLength,
            UtaError::InvalidDvLength(_) => ReturnCode::InvalidDvLength,
            UtaError::InvalidKeySlot(_) => ReturnCode::InvalidKeySlot,
            UtaError::TrustAnchor(_) => ReturnCode::TaError,
        }
    }

    pub fn is_trust_anchor(&self) -> bool {
        matches!(self, UtaError::TrustAnchor(_))
    }
}
