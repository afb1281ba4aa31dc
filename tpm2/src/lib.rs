// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 transport for hardware trust anchors
//!
//! Marshals the handful of commands a key-derivation trust anchor needs and
//! exchanges them with `/dev/tpmrm0` (or `/dev/tpm0`) directly, without the
//! native TSS libraries.
//!
//! Commands: `HMAC` (authorized through an HMAC session), `CreatePrimary`,
//! `ReadPublic`, `FlushContext`, `GetRandom`, `SelfTest`, `GetTestResult`.
//! Sessions are unbound and unsalted; nonces roll on every response and
//! response HMACs are verified.
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{tpm_rh, TpmContext, TpmtPublic};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let mut session = ctx.start_hmac_session()?;
//! let key = ctx.create_primary(tpm_rh::ENDORSEMENT, &TpmtPublic::hmac_key())?;
//! let digest = ctx.hmac(&mut session, &key, b"DEVICEID")?;
//! assert_eq!(digest.len(), 32);
//! ctx.flush_context(key.handle)?;
//! ctx.flush_session(session)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod marshal;
mod session;
mod types;

pub use commands::TpmContext;
pub use constants::*;
pub use types::*;

pub use device::{
    SessionReply, TpmCommand, TpmDevice, TpmResponse, Transport, DEFAULT_DEVICES,
};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{HmacSession, ResponseAuth, SessionAuth};
