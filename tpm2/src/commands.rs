// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! This module provides high-level TPM operations.

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::constants::*;
use super::device::*;
use super::marshal::*;
use super::session::*;
use super::types::*;

/// Pure Rust TPM context
pub struct TpmContext {
    device: Box<dyn Transport>,
}

impl TpmContext {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self::with_transport(Box::new(device)))
    }

    /// Drive a TPM reached through any transport
    pub fn with_transport(device: Box<dyn Transport>) -> Self {
        Self { device }
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    // ==================== Sessions ====================

    /// Start an HMAC authorization session
    pub fn start_hmac_session(&mut self) -> Result<HmacSession> {
        HmacSession::start(self.device.as_mut())
    }

    /// Flush an HMAC session
    pub fn flush_session(&mut self, session: HmacSession) -> Result<()> {
        session.flush(self.device.as_mut())
    }

    // ==================== Random Number Generation ====================

    /// Request random bytes from the TPM's RNG.
    ///
    /// A single TPM2_GetRandom call: the TPM returns at most one digest worth
    /// of bytes, so the result may be shorter than `num_bytes`.
    pub fn get_random(&mut self, num_bytes: u16) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmCc::GetRandom);
        cmd.add_u16(num_bytes);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("GetRandom failed")?;

        let mut buf = response.data_buffer();
        let random_bytes = Tpm2bDigest::unmarshal(&mut buf)?.buffer;
        if random_bytes.len() > num_bytes as usize {
            bail!(
                "GetRandom returned {} bytes, requested {}",
                random_bytes.len(),
                num_bytes
            );
        }
        debug!("GetRandom: {}/{} bytes", random_bytes.len(), num_bytes);
        Ok(random_bytes)
    }

    // ==================== Keyed Hash ====================

    /// Compute an HMAC over `data` with a loaded keyed-hash object,
    /// authorized through `session`
    pub fn hmac(
        &mut self,
        session: &mut HmacSession,
        key: &TpmObject,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut params = CommandBuffer::new();
        Tpm2bMaxBuffer::new(data)?.marshal(&mut params);
        params.put_u16(session.hash_alg.to_u16());

        let auth = session.authorize(TpmCc::Hmac, &[key.name.as_slice()], params.as_bytes())?;

        let mut cmd = TpmCommand::with_sessions(TpmCc::Hmac);
        cmd.add_handle(key.handle);
        cmd.add_auth_area(std::slice::from_ref(&auth));
        cmd.add_bytes(params.as_bytes());

        let response = self.device.execute(&cmd.finalize())?;
        response
            .ensure_success()
            .with_context(|| format!("HMAC with key 0x{:08x} failed", key.handle))?;

        let reply = response.session_reply(0)?;
        let received = reply
            .auth
            .first()
            .context("HMAC response carries no session")?;
        session.verify(TpmCc::Hmac, &auth, &reply.parameters, received)?;

        let mut buf = ResponseBuffer::new(&reply.parameters);
        let digest = Tpm2bDigest::unmarshal(&mut buf)?;
        buf.finish()?;

        debug!("HMAC with key 0x{:08x} done", key.handle);
        Ok(digest.buffer)
    }

    // ==================== Object Operations ====================

    /// Read the public area of a loaded object and return it with its name
    pub fn read_public(&mut self, handle: u32) -> Result<(TpmObject, Vec<u8>)> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);

        let response = self.device.execute(&cmd.finalize())?;
        response
            .ensure_success()
            .with_context(|| format!("ReadPublic of 0x{:08x} failed", handle))?;

        let mut buf = response.data_buffer();
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let name = Tpm2bName::unmarshal(&mut buf)?;
        let _qualified_name = Tpm2bName::unmarshal(&mut buf)?;

        Ok((
            TpmObject {
                handle,
                name: name.name,
            },
            out_public.public_area,
        ))
    }

    /// Create a transient primary object in the specified hierarchy
    pub fn create_primary(&mut self, hierarchy: u32, template: &TpmtPublic) -> Result<TpmObject> {
        let public = Tpm2bPublic::from_template(template);

        let mut cmd = TpmCommand::with_sessions(TpmCc::CreatePrimary);
        // primaryHandle (hierarchy)
        cmd.add_handle(hierarchy);
        cmd.add_null_auth_area();
        // inSensitive (empty)
        cmd.add(&Tpm2bSensitiveCreate::empty());
        cmd.add(&public);
        // outsideInfo (empty)
        cmd.add_tpm2b_empty();
        // creationPCR (empty)
        cmd.add(&TpmlPcrSelection);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("CreatePrimary failed")?;

        let reply = response.session_reply(1)?;
        let handle = reply.handles[0];

        let mut buf = ResponseBuffer::new(&reply.parameters);
        let _out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let _creation_data = Tpm2bCreationData::unmarshal(&mut buf)?;
        let _creation_hash = Tpm2bDigest::unmarshal(&mut buf)?;
        let _creation_ticket = TpmtTkCreation::unmarshal(&mut buf)?;
        let name = Tpm2bName::unmarshal(&mut buf)?;

        debug!("created primary key with handle 0x{:08x}", handle);
        Ok(TpmObject {
            handle,
            name: name.name,
        })
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("FlushContext failed")?;

        debug!("flushed handle 0x{:08x}", handle);
        Ok(())
    }

    // ==================== Self Test ====================

    /// Run the TPM self test
    pub fn self_test(&mut self, full_test: bool) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::SelfTest);
        cmd.add_u8(full_test as u8);

        let response = self.device.execute(&cmd.finalize())?;
        // Tests still running in the background are reported by GetTestResult
        if TpmRc::from_u32(response.response_code) == TpmRc::Testing {
            debug!("SelfTest continues in background");
            return Ok(());
        }
        response.ensure_success().context("SelfTest failed")?;
        Ok(())
    }

    /// Read the outcome of the last self test as (vendor data, test result code)
    pub fn get_test_result(&mut self) -> Result<(Vec<u8>, u32)> {
        let cmd = TpmCommand::new(TpmCc::GetTestResult);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("GetTestResult failed")?;

        let mut buf = response.data_buffer();
        let out_data = Tpm2bMaxBuffer::unmarshal(&mut buf)?;
        let test_result = buf.get_u32()?;

        debug!("GetTestResult: 0x{:08x}", test_result);
        Ok((out_data.buffer, test_result))
    }
}
