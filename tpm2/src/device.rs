// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! Provides low-level communication with TPM devices via /dev/tpmrm0 or /dev/tpm0.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

use super::constants::*;
use super::marshal::*;
use super::session::{ResponseAuth, SessionAuth};

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Device nodes tried when no path is configured, resource manager first
pub const DEFAULT_DEVICES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

/// TPM device handle
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str) -> Result<Self> {
        // Strip "device:" prefix if present
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {}", device_path))?;

        debug!("opened TPM device {}", device_path);
        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self> {
        match DEFAULT_DEVICES.iter().find(|p| Path::new(p).exists()) {
            Some(path) => Self::open(path),
            None => bail!("TPM device not found"),
        }
    }
}

/// Command/response channel to a TPM
pub trait Transport: Send {
    /// Where commands go, for log messages
    fn path(&self) -> &str;

    /// Send one command and receive its response
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;

    /// Execute a TPM command and parse the response
    fn execute(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let response_bytes = self.transmit(command)?;
        TpmResponse::parse(&response_bytes)
    }
}

impl Transport for TpmDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to write TPM command")?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .context("failed to read TPM response")?;

        response.truncate(n);
        Ok(response)
    }
}

/// TPM command builder
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    fn with_tag(tag: TpmSt, command_code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(command_code.to_u32());

        Self { buf }
    }

    /// Create a new command without sessions
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, command_code)
    }

    /// Create a new command with sessions
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, command_code)
    }

    /// Add a handle to the command
    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    /// Add raw bytes to the command
    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    /// Add a u8 value
    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Add a u16 value
    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    /// Add a TPM2B structure
    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    /// Add an empty TPM2B structure
    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_tpm2b_empty();
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Add the authorization area, one entry per authorized handle
    pub fn add_auth_area(&mut self, sessions: &[SessionAuth]) {
        let mut area = CommandBuffer::new();
        for session in sessions {
            session.marshal(&mut area);
        }
        self.buf.put_u32(area.len() as u32);
        self.buf.put_bytes(area.as_bytes());
    }

    /// Add password authorization session (null auth)
    pub fn add_null_auth_area(&mut self) {
        self.add_auth_area(&[SessionAuth::password()]);
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }

    /// Get current buffer for inspection
    pub fn buffer(&self) -> &CommandBuffer {
        &self.buf
    }
}

/// Response body of a command sent with an authorization area
#[derive(Debug)]
pub struct SessionReply {
    pub handles: Vec<u32>,
    pub parameters: Vec<u8>,
    pub auth: Vec<ResponseAuth>,
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < 10 {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| anyhow::anyhow!("invalid response tag: 0x{:04x}", tag_raw))?;

        let size = buf.get_u32()? as usize;
        if size < 10 || response.len() < size {
            bail!(
                "TPM response size mismatch: expected {}, got {}",
                size,
                response.len()
            );
        }

        let response_code = buf.get_u32()?;

        // Remaining data after header
        let data = response[10..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.response_code == 0
    }

    /// Get error description
    pub fn error_description(&self) -> String {
        if self.is_success() {
            "success".to_string()
        } else {
            format!(
                "TPM error: 0x{:08x} ({:?})",
                self.response_code,
                TpmRc::from_u32(self.response_code)
            )
        }
    }

    /// Ensure the response is successful
    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            bail!("{}", self.error_description())
        }
    }

    /// Get a response buffer for parsing the data
    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Split a response to a command with sessions into handles, parameters
    /// and the response authorization area
    pub fn session_reply(&self, handle_count: usize) -> Result<SessionReply> {
        if self.tag != TpmSt::Sessions {
            bail!("response carries no authorization area");
        }
        let mut buf = self.data_buffer();
        let handles = (0..handle_count)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()?;
        let parameter_size = buf.get_u32()? as usize;
        let parameters = buf.get_bytes(parameter_size)?;
        let mut auth = Vec::new();
        while buf.remaining() > 0 {
            auth.push(ResponseAuth::unmarshal(&mut buf)?);
        }
        Ok(SessionReply {
            handles,
            parameters,
            auth,
        })
    }
}
