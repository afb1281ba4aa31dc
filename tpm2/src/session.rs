// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 HMAC authorization sessions
//!
//! Sessions are unbound and unsalted, so the session key is empty and the
//! authorization HMAC is keyed with the authValue of the authorized object.
//! Objects used through this crate carry an empty authValue.

use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::constants::*;
use super::device::*;
use super::marshal::*;
use super::types::*;

type HmacSha256 = Hmac<Sha256>;

/// Caller nonce size, matching the SHA-256 session hash
const NONCE_SIZE: usize = 32;

/// One entry of a command authorization area
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub handle: u32,
    pub nonce_caller: Vec<u8>,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl SessionAuth {
    /// Password session with an empty password
    pub fn password() -> Self {
        Self {
            handle: tpm_rh::PW,
            nonce_caller: Vec::new(),
            attributes: 0,
            hmac: Vec::new(),
        }
    }
}

impl Marshal for SessionAuth {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.handle);
        buf.put_tpm2b(&self.nonce_caller);
        buf.put_u8(self.attributes);
        buf.put_tpm2b(&self.hmac);
    }
}

/// One entry of a response authorization area
#[derive(Debug, Clone)]
pub struct ResponseAuth {
    pub nonce_tpm: Vec<u8>,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl Unmarshal for ResponseAuth {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let nonce_tpm = buf.get_tpm2b()?;
        let attributes = buf.get_u8()?;
        let hmac = buf.get_tpm2b()?;
        Ok(Self {
            nonce_tpm,
            attributes,
            hmac,
        })
    }
}

/// HMAC authorization session
#[derive(Debug)]
pub struct HmacSession {
    pub handle: u32,
    pub hash_alg: TpmAlgId,
    nonce_tpm: Vec<u8>,
    attributes: u8,
}

impl HmacSession {
    /// Start a new HMAC session that stays open across commands
    pub fn start(device: &mut dyn Transport) -> Result<Self> {
        let mut nonce_caller = vec![0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_caller);

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        // tpmKey (TPM_RH_NULL for unsalted session)
        cmd.add_handle(tpm_rh::NULL);
        // bind (TPM_RH_NULL for unbound session)
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_tpm2b(&nonce_caller);
        // encryptedSalt (empty - no salt)
        cmd.add_tpm2b_empty();
        cmd.add_u8(TpmSe::Hmac as u8);
        // symmetric (no parameter encryption)
        cmd.add(&TpmtSymDef::null());
        cmd.add_u16(TpmAlgId::Sha256.to_u16());

        let response = device.execute(&cmd.finalize())?;
        response
            .ensure_success()
            .context("StartAuthSession failed")?;

        let mut buf = response.data_buffer();
        let handle = buf.get_u32()?;
        let nonce_tpm = buf.get_tpm2b()?;
        debug!("started HMAC session 0x{:08x}", handle);

        Ok(Self {
            handle,
            hash_alg: TpmAlgId::Sha256,
            nonce_tpm,
            attributes: TpmaSa::new().with_continue_session().0,
        })
    }

    /// Build the authorization for a command acting on objects with the given names
    pub fn authorize(
        &self,
        command_code: TpmCc,
        names: &[&[u8]],
        parameters: &[u8],
    ) -> Result<SessionAuth> {
        let mut nonce_caller = vec![0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_caller);
        self.authorize_with_nonce(command_code, names, parameters, nonce_caller)
    }

    fn authorize_with_nonce(
        &self,
        command_code: TpmCc,
        names: &[&[u8]],
        parameters: &[u8],
        nonce_caller: Vec<u8>,
    ) -> Result<SessionAuth> {
        let cp_hash = cp_hash(command_code, names, parameters);
        let hmac = session_hmac(&cp_hash, &nonce_caller, &self.nonce_tpm, self.attributes)?
            .finalize()
            .into_bytes()
            .to_vec();
        Ok(SessionAuth {
            handle: self.handle,
            nonce_caller,
            attributes: self.attributes,
            hmac,
        })
    }

    /// Check the response HMAC and roll the TPM nonce forward
    pub fn verify(
        &mut self,
        command_code: TpmCc,
        sent: &SessionAuth,
        parameters: &[u8],
        received: &ResponseAuth,
    ) -> Result<()> {
        // The TPM has already rolled its nonce, keep in step even on mismatch.
        self.nonce_tpm = received.nonce_tpm.clone();

        let rp_hash = rp_hash(command_code, parameters);
        session_hmac(
            &rp_hash,
            &received.nonce_tpm,
            &sent.nonce_caller,
            received.attributes,
        )?
        .verify_slice(&received.hmac)
        .map_err(|_| anyhow!("response HMAC mismatch for {:?}", command_code))
    }

    /// Flush (close) this session
    pub fn flush(self, device: &mut dyn Transport) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(self.handle);

        let response = device.execute(&cmd.finalize())?;
        response.ensure_success().context("FlushContext failed")?;

        debug!("flushed HMAC session 0x{:08x}", self.handle);
        Ok(())
    }
}

fn cp_hash(command_code: TpmCc, names: &[&[u8]], parameters: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(command_code.to_u32().to_be_bytes());
    for name in names {
        hasher.update(name);
    }
    hasher.update(parameters);
    hasher.finalize().to_vec()
}

fn rp_hash(command_code: TpmCc, parameters: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update((TpmRc::Success as u32).to_be_bytes());
    hasher.update(command_code.to_u32().to_be_bytes());
    hasher.update(parameters);
    hasher.finalize().to_vec()
}

fn session_hmac(
    p_hash: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    attributes: u8,
) -> Result<HmacSha256> {
    // sessionKey || authValue, both empty
    let mut mac = HmacSha256::new_from_slice(&[])
        .map_err(|_| anyhow!("invalid session HMAC key length"))?;
    mac.update(p_hash);
    mac.update(nonce_newer);
    mac.update(nonce_older);
    mac.update(&[attributes]);
    Ok(mac)
}
