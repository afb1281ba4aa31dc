// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Device identity
//!
//! Hardware backends HMAC [`DEVICE_ID_LABEL`] under a transient keyed-hash
//! primary of the endorsement hierarchy; the simulator reads the platform
//! machine id. Both feed their 16 raw bytes through [`DeviceUuid::from_raw`].

use std::fmt;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use fs_err as fs;

pub const UUID_LEN: usize = 16;

/// Message HMACed under the endorsement-derived identity key
pub const DEVICE_ID_LABEL: [u8; 8] = *b"DEVICEID";

/// RFC4122 version-4 formatted device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceUuid([u8; UUID_LEN]);

impl DeviceUuid {
    /// Force the version (4) and variant (RFC4122) bits
    pub fn from_raw(mut raw: [u8; UUID_LEN]) -> Self {
        raw[6] = (raw[6] & 0x0F) | 0x40;
        raw[8] = (raw[8] & 0x3F) | 0x80;
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; UUID_LEN] {
        &self.0
    }

    pub fn into_bytes(self) -> [u8; UUID_LEN] {
        self.0
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

/// Leading 16 bytes of an identity HMAC
pub fn raw_from_digest(digest: &[u8]) -> Result<[u8; UUID_LEN]> {
    ensure!(
        digest.len() >= UUID_LEN,
        "identity digest too short: {} bytes",
        digest.len()
    );
    let mut raw = [0u8; UUID_LEN];
    raw.copy_from_slice(&digest[..UUID_LEN]);
    Ok(raw)
}

/// Parse the first 32 hex characters of a machine-id file
pub fn read_machine_id(path: &Path) -> Result<[u8; UUID_LEN]> {
    let content = fs::read_to_string(path)?;
    parse_machine_id(&content)
        .with_context(|| format!("malformed machine id in {}", path.display()))
}

fn parse_machine_id(content: &str) -> Result<[u8; UUID_LEN]> {
    let digits = content
        .get(..UUID_LEN * 2)
        .context("fewer than 32 hex characters")?;
    let mut raw = [0u8; UUID_LEN];
    hex::decode_to_slice(digits, &mut raw).context("invalid hex")?;
    Ok(raw)
}
