// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 backend on the TCG software stack (tss-esapi)
//!
//! Sessions are optionally salted with a persistent salt key and use
//! AES-128-CFB parameter encryption.

use std::str::FromStr;

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};
use tss_esapi::{
    attributes::{ObjectAttributesBuilder, SessionAttributesBuilder},
    constants::SessionType,
    handles::{KeyHandle, ObjectHandle, PersistentTpmHandle, SessionHandle, TpmHandle},
    interface_types::{
        algorithm::{HashingAlgorithm, PublicAlgorithm},
        resource_handles::Hierarchy,
        session_handles::AuthSession,
    },
    structures::{
        Digest, KeyedHashScheme, MaxBuffer, Public, PublicBuilder, PublicKeyedHashParameters,
        SymmetricDefinition,
    },
    tcti_ldr::{DeviceConfig, TctiNameConf},
    Context as TssContext,
};

use super::{BackendKind, Session, TrustAnchor};
use crate::config::UtaConfig;
use crate::derive::KeySlot;
use crate::identity::{raw_from_digest, DEVICE_ID_LABEL, UUID_LEN};

/// TPM_RC_FAILURE, reported when GetTestResult carries an error
const TEST_FAILED: u32 = 0x0000_0101;

/// Largest digest a TPM2B_DIGEST can carry
const MAX_RANDOM_REQUEST: usize = 64;

#[derive(Debug, Clone)]
pub struct EsapiAnchor {
    device_path: String,
    key_handles: [u32; 2],
    salt_handle: Option<u32>,
}

impl EsapiAnchor {
    pub fn new(config: &UtaConfig) -> Self {
        let device_path = config.tpm_device.as_deref().unwrap_or("/dev/tpmrm0");
        Self {
            // tss-esapi expects the path without the "device:" prefix
            device_path: device_path
                .strip_prefix("device:")
                .unwrap_or(device_path)
                .to_string(),
            key_handles: config.key_handles,
            salt_handle: config.salt_handle,
        }
    }
}

impl TrustAnchor for EsapiAnchor {
    fn kind(&self) -> BackendKind {
        BackendKind::TpmEsapi
    }

    fn connect(&self) -> Result<Box<dyn Session>> {
        let device_config =
            DeviceConfig::from_str(&self.device_path).context("failed to parse device config")?;
        let mut context = TssContext::new(TctiNameConf::Device(device_config))
            .context("failed to create TSS context")?;

        // Dropping `context` on any error below finalizes it.
        let salt_key = match self.salt_handle {
            Some(handle) => Some(KeyHandle::from(persistent_object(&mut context, handle)?)),
            None => None,
        };
        let session = context
            .start_auth_session(
                salt_key,
                None,
                None,
                SessionType::Hmac,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .context("failed to start HMAC session")?
            .context("TPM returned no session")?;

        info!(
            "TSS session open on {} (salted: {})",
            self.device_path,
            self.salt_handle.is_some()
        );
        Ok(Box::new(EsapiSession {
            context: EsapiContext(context),
            session: Some(session),
            key_handles: self.key_handles,
            keys: [None, None],
        }))
    }
}

/// ESAPI context confined to one trust anchor session. Private to this
/// module; only `EsapiSession` holds one.
struct EsapiContext(TssContext);

// SAFETY: the ESYS context is not thread safe. This is sound only while the
// `Session` built around it is never shared outside the `Context` that opened
// it, which reaches the session under its mutex alone.
unsafe impl Send for EsapiContext {}

struct EsapiSession {
    context: EsapiContext,
    session: Option<AuthSession>,
    key_handles: [u32; 2],
    keys: [Option<ObjectHandle>; 2],
}

fn persistent_object(context: &mut TssContext, handle: u32) -> Result<ObjectHandle> {
    let persistent = PersistentTpmHandle::new(handle)
        .with_context(|| format!("invalid persistent handle 0x{handle:08x}"))?;
    context
        .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(persistent)))
        .with_context(|| format!("failed to load persistent object 0x{handle:08x}"))
}

fn identity_key_template() -> Result<Public> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_sign_encrypt(true)
        .build()
        .context("failed to build object attributes")?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(
            KeyedHashScheme::HMAC_SHA_256,
        ))
        .with_keyed_hash_unique_identifier(Digest::default())
        .build()
        .context("failed to build identity key template")
}

impl EsapiSession {
    fn auth_session(&self) -> Result<AuthSession> {
        self.session.context("TSS session already closed")
    }

    /// Apply session attributes for the next command
    fn set_attributes(&mut self, decrypt: bool) -> Result<AuthSession> {
        let session = self.auth_session()?;
        let (attributes, mask) = SessionAttributesBuilder::new()
            .with_continue_session(true)
            .with_encrypt(true)
            .with_decrypt(decrypt)
            .build();
        self.context
            .0
            .tr_sess_set_attributes(session, attributes, mask)
            .context("failed to set session attributes")?;
        Ok(session)
    }

    fn slot_key(&mut self, slot: KeySlot) -> Result<ObjectHandle> {
        if let Some(key) = self.keys[slot.index()] {
            return Ok(key);
        }
        let handle = self.key_handles[slot.index()];
        let key = persistent_object(&mut self.context.0, handle)
            .with_context(|| format!("key slot {} not provisioned", slot.index()))?;
        debug!("key slot {} -> 0x{:08x}", slot.index(), handle);
        self.keys[slot.index()] = Some(key);
        Ok(key)
    }

    fn hmac_with(&mut self, key: ObjectHandle, message: &[u8]) -> Result<Vec<u8>> {
        let session = self.set_attributes(true)?;
        let buffer = MaxBuffer::try_from(message.to_vec()).context("HMAC input too large")?;
        let digest = self
            .context
            .0
            .execute_with_session(Some(session), |ctx| {
                ctx.hmac(key, buffer, HashingAlgorithm::Sha256)
            })
            .context("HMAC failed")?;
        Ok(digest.to_vec())
    }
}

impl Session for EsapiSession {
    fn hmac(&mut self, slot: KeySlot, message: &[u8]) -> Result<Vec<u8>> {
        let key = self.slot_key(slot)?;
        self.hmac_with(key, message)
    }

    fn random(&mut self, max: usize) -> Result<Vec<u8>> {
        let session = self.set_attributes(false)?;
        let digest = self
            .context
            .0
            .execute_with_session(Some(session), |ctx| {
                ctx.get_random(max.min(MAX_RANDOM_REQUEST))
            })
            .context("GetRandom failed")?;
        Ok(digest.to_vec())
    }

    fn identity(&mut self) -> Result<[u8; UUID_LEN]> {
        let template = identity_key_template()?;
        let key = self
            .context
            .0
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create_primary(Hierarchy::Endorsement, template, None, None, None, None)
            })
            .context("failed to create identity key")?
            .key_handle;

        let digest = self.hmac_with(key.into(), &DEVICE_ID_LABEL);
        let flushed = self.context.0.flush_context(key.into());
        let digest = digest?;
        flushed.context("failed to flush identity key")?;
        raw_from_digest(&digest)
    }

    fn self_test(&mut self) -> Result<u32> {
        let context = &mut self.context.0;
        let (_, result) = context
            .execute_without_session(|ctx| {
                ctx.self_test(true)?;
                ctx.get_test_result()
            })
            .context("self test failed to run")?;
        Ok(match result {
            Ok(()) => 0,
            Err(err) => {
                warn!("TPM self test reported: {err}");
                TEST_FAILED
            }
        })
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let flushed = match self.session.take() {
            Some(session) => self
                .context
                .0
                .flush_context(SessionHandle::from(session).into())
                .context("failed to flush TSS session"),
            None => Ok(()),
        };
        info!("TSS session closed");
        // The ESYS context is finalized when `self` drops.
        flushed
    }
}

impl Drop for EsapiSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = self.context.0.flush_context(SessionHandle::from(session).into()) {
                warn!("failed to flush abandoned TSS session: {err}");
            }
        }
    }
}
