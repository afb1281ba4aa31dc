// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 backend talking to the character device through the `tpm2` crate

use anyhow::{bail, Context, Result};
use tpm2::{tpm_rh, HmacSession, TpmContext, TpmObject, TpmtPublic};
use tracing::{debug, info, warn};

use super::{BackendKind, Session, TrustAnchor};
use crate::config::UtaConfig;
use crate::derive::KeySlot;
use crate::identity::{raw_from_digest, DEVICE_ID_LABEL, UUID_LEN};

/// Largest single GetRandom request
const MAX_RANDOM_REQUEST: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct DeviceAnchor {
    device_path: Option<String>,
    key_handles: [u32; 2],
    salt_handle: Option<u32>,
}

impl DeviceAnchor {
    pub fn new(config: &UtaConfig) -> Self {
        Self {
            device_path: config.tpm_device.clone(),
            key_handles: config.key_handles,
            salt_handle: config.salt_handle,
        }
    }
}

impl TrustAnchor for DeviceAnchor {
    fn kind(&self) -> BackendKind {
        BackendKind::TpmDevice
    }

    fn connect(&self) -> Result<Box<dyn Session>> {
        if let Some(handle) = self.salt_handle {
            bail!("salted sessions (salt key 0x{handle:08x}) need the tpm-esapi backend");
        }
        let tpm = TpmContext::new(self.device_path.as_deref())?;
        Ok(Box::new(DeviceSession::start(tpm, self.key_handles)?))
    }
}

struct DeviceSession {
    tpm: TpmContext,
    session: Option<HmacSession>,
    key_handles: [u32; 2],
    /// Slot keys with their names, read once per session
    keys: [Option<TpmObject>; 2],
}

impl DeviceSession {
    fn start(mut tpm: TpmContext, key_handles: [u32; 2]) -> Result<Self> {
        // Dropping `tpm` on error closes the device again.
        let session = tpm
            .start_hmac_session()
            .context("failed to start HMAC session")?;
        info!(
            "TPM session 0x{:08x} open on {}",
            session.handle,
            tpm.device_path()
        );
        Ok(Self {
            tpm,
            session: Some(session),
            key_handles,
            keys: [None, None],
        })
    }

    fn slot_key(&mut self, slot: KeySlot) -> Result<TpmObject> {
        if let Some(key) = &self.keys[slot.index()] {
            return Ok(key.clone());
        }
        let handle = self.key_handles[slot.index()];
        let (key, _public) = self
            .tpm
            .read_public(handle)
            .with_context(|| format!("key slot {} not provisioned", slot.index()))?;
        debug!("key slot {} -> 0x{:08x}", slot.index(), handle);
        self.keys[slot.index()] = Some(key.clone());
        Ok(key)
    }

    fn hmac_with(&mut self, key: &TpmObject, message: &[u8]) -> Result<Vec<u8>> {
        let session = self.session.as_mut().context("TPM session already closed")?;
        self.tpm.hmac(session, key, message)
    }
}

impl Session for DeviceSession {
    fn hmac(&mut self, slot: KeySlot, message: &[u8]) -> Result<Vec<u8>> {
        let key = self.slot_key(slot)?;
        self.hmac_with(&key, message)
    }

    fn random(&mut self, max: usize) -> Result<Vec<u8>> {
        self.tpm.get_random(max.min(MAX_RANDOM_REQUEST) as u16)
    }

    fn identity(&mut self) -> Result<[u8; UUID_LEN]> {
        let key = self
            .tpm
            .create_primary(tpm_rh::ENDORSEMENT, &TpmtPublic::hmac_key())
            .context("failed to create identity key")?;
        let digest = self.hmac_with(&key, &DEVICE_ID_LABEL);
        let flushed = self.tpm.flush_context(key.handle);
        let digest = digest?;
        flushed.context("failed to flush identity key")?;
        raw_from_digest(&digest)
    }

    fn self_test(&mut self) -> Result<u32> {
        self.tpm.self_test(true)?;
        let (_, result) = self.tpm.get_test_result()?;
        Ok(result)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let flushed = match self.session.take() {
            Some(session) => self.tpm.flush_session(session),
            None => Ok(()),
        };
        info!("TPM session on {} closed", self.tpm.device_path());
        // The device file is released when `self` drops.
        flushed
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = self.tpm.flush_session(session) {
                warn!("failed to flush abandoned TPM session: {err:#}");
            }
        }
    }
}
