// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Backend selection and trust anchor parameters

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tpm2::TpmHt;
use tracing::debug;

use crate::anchor::BackendKind;

/// Persistent handle of the slot 0 master key
pub const DEFAULT_KEY_HANDLE_0: u32 = 0x8100_0000;
/// Persistent handle of the slot 1 master key
pub const DEFAULT_KEY_HANDLE_1: u32 = 0x8100_0001;

pub const DEFAULT_MACHINE_ID_PATH: &str = "/etc/machine-id";

const ENV_CONFIG: &str = "UTA_CONFIG";
const ENV_BACKEND: &str = "UTA_BACKEND";
const ENV_TPM_DEVICE: &str = "UTA_TPM_DEVICE";
const ENV_MACHINE_ID: &str = "UTA_MACHINE_ID";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct UtaConfig {
    pub backend: BackendKind,
    /// TPM character device; detected when unset
    pub tpm_device: Option<String>,
    /// Persistent handles of the two master keys, indexed by key slot
    pub key_handles: [u32; 2],
    /// Persistent key used to salt sessions (tpm-esapi only)
    pub salt_handle: Option<u32>,
    /// Machine identifier file the simulator derives its UUID from
    pub machine_id_path: PathBuf,
}

impl Default for UtaConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::TpmDevice,
            tpm_device: None,
            key_handles: [DEFAULT_KEY_HANDLE_0, DEFAULT_KEY_HANDLE_1],
            salt_handle: None,
            machine_id_path: PathBuf::from(DEFAULT_MACHINE_ID_PATH),
        }
    }
}

impl UtaConfig {
    /// Simulator configuration reading the given machine-id file
    pub fn simulator(machine_id_path: impl AsRef<Path>) -> Self {
        Self {
            backend: BackendKind::Simulator,
            machine_id_path: machine_id_path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs_err::read_to_string(path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Configuration from `UTA_CONFIG` (if set) with the other `UTA_*`
    /// variables applied on top.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(ENV_CONFIG) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Override fields from `UTA_BACKEND`, `UTA_TPM_DEVICE` and `UTA_MACHINE_ID`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.backend = backend
                .parse()
                .with_context(|| format!("invalid {ENV_BACKEND}"))?;
        }
        if let Some(device) = lookup(ENV_TPM_DEVICE) {
            self.tpm_device = Some(device);
        }
        if let Some(path) = lookup(ENV_MACHINE_ID) {
            self.machine_id_path = PathBuf::from(path);
        }
        debug!("configured backend: {}", self.backend);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (slot, handle) in self.key_handles.iter().enumerate() {
            if TpmHt::of(*handle) != Some(TpmHt::Persistent) {
                bail!("key slot {slot}: 0x{handle:08x} is not a persistent handle");
            }
        }
        if let Some(handle) = self.salt_handle {
            if TpmHt::of(handle) != Some(TpmHt::Persistent) {
                bail!("salt key 0x{handle:08x} is not a persistent handle");
            }
        }
        if let Some(device) = &self.tpm_device {
            if device.trim().is_empty() {
                bail!("empty TPM device path");
            }
        }
        Ok(())
    }
}
