// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Unified trust anchor
//!
//! Hardware-rooted key derivation and device identity behind one operation
//! set, whichever trust anchor backs it: a TPM 2.0 reached through its
//! character device, a TPM 2.0 reached through the TCG software stack
//! (feature `esapi`), or a software simulator.
//!
//! The backend is chosen once per process with [`init`]; every [`Context`]
//! created afterwards talks to it.
//!
//! ```no_run
//! use uta::UtaConfig;
//!
//! fn main() -> uta::Result<()> {
//!     let api = uta::init(&UtaConfig::simulator("/etc/machine-id"))?;
//!     let ctx = api.new_context();
//!     ctx.open()?;
//!     let key = ctx.derive_key(0, &[1; 8], 32)?;
//!     let uuid = ctx.get_device_uuid()?;
//!     println!("{} {}", hex::encode(key), uuid);
//!     ctx.close()
//! }
//! ```

use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use tracing::info;

pub mod anchor;
mod config;
mod context;
mod derive;
mod error;
mod identity;
mod random;
mod version;

pub use anchor::{Backend, BackendKind, Session, Simulator, TrustAnchor};
pub use config::UtaConfig;
pub use context::Context;
pub use derive::{DerivationValue, KeySlot, DV_LEN, LEN_KEY_MAX};
pub use error::{Result, ReturnCode, UtaError};
pub use identity::{DeviceUuid, DEVICE_ID_LABEL, UUID_LEN};
pub use version::{UtaVersion, Version};

static SELECTED: OnceLock<UtaApi> = OnceLock::new();

/// Handle to the backend selected for this process
#[derive(Debug)]
pub struct UtaApi {
    backend: Arc<Backend>,
}

impl UtaApi {
    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Storage one [`Context`] occupies
    pub fn context_size(&self) -> usize {
        Context::size()
    }

    pub fn len_key_max(&self) -> usize {
        LEN_KEY_MAX
    }

    pub fn get_version(&self) -> UtaVersion {
        UtaVersion::new(self.backend())
    }

    /// A closed context on the selected backend
    pub fn new_context(&self) -> Context {
        Context::with_anchor(self.backend.clone())
    }
}

/// Select the backend for this process.
///
/// The first successful call wins. Later calls asking for the same backend
/// kind get the existing handle (their other settings are ignored); asking
/// for a different kind is an error.
pub fn init(config: &UtaConfig) -> Result<&'static UtaApi> {
    let api = match SELECTED.get() {
        Some(api) => api,
        None => {
            let backend = Arc::new(Backend::from_config(config)?);
            SELECTED.get_or_init(|| {
                info!("trust anchor backend: {}", backend.kind());
                UtaApi { backend }
            })
        }
    };
    if api.backend() != config.backend {
        return Err(anyhow!(
            "backend already set to {}, cannot switch to {}",
            api.backend(),
            config.backend
        )
        .into());
    }
    Ok(api)
}

/// [`init`] with configuration taken from the `UTA_*` environment variables
pub fn init_from_env() -> Result<&'static UtaApi> {
    init(&UtaConfig::from_env()?)
}

/// The backend selected by [`init`], if any
pub fn selected() -> Option<&'static UtaApi> {
    SELECTED.get()
}
