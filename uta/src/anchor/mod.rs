// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Trust anchor backends
//!
//! A [`TrustAnchor`] knows how to reach one kind of root of trust and opens
//! [`Session`]s on it. A session owns every resource of one open context and
//! gives them all back in [`Session::close`] (or on drop).

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::config::UtaConfig;
use crate::derive::KeySlot;
use crate::identity::UUID_LEN;

mod device;
#[cfg(feature = "esapi")]
mod esapi;
mod simulator;

pub use device::DeviceAnchor;
#[cfg(feature = "esapi")]
pub use esapi::EsapiAnchor;
pub use simulator::Simulator;

/// Backend tag, reported in the version descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum BackendKind {
    /// Software simulator with constant keys
    Simulator = 0,
    /// TPM 2.0 reached through the character device
    TpmDevice = 1,
    /// TPM 2.0 reached through the TCG software stack
    TpmEsapi = 2,
}

impl BackendKind {
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Simulator => "simulator",
            BackendKind::TpmDevice => "tpm-device",
            BackendKind::TpmEsapi => "tpm-esapi",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simulator" | "sim" => Ok(BackendKind::Simulator),
            "tpm-device" | "tpm-ibm" => Ok(BackendKind::TpmDevice),
            "tpm-esapi" | "tpm-tcg" => Ok(BackendKind::TpmEsapi),
            other => bail!("unknown backend: {other}"),
        }
    }
}

/// A root of trust that sessions can be opened on
pub trait TrustAnchor: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Acquire transport and session. On error nothing stays allocated.
    fn connect(&self) -> Result<Box<dyn Session>>;
}

/// Primitives of one open trust anchor session
pub trait Session: Send {
    /// Full HMAC-SHA256 of `message` under the master key of `slot`
    fn hmac(&mut self, slot: KeySlot, message: &[u8]) -> Result<Vec<u8>>;

    /// Up to `max` random bytes
    fn random(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Unformatted device identity bytes
    fn identity(&mut self) -> Result<[u8; UUID_LEN]>;

    /// Run the built-in self test and return its result code (0 = passed)
    fn self_test(&mut self) -> Result<u32>;

    /// Tear down the session. Every resource is released even when a step
    /// fails; the first failure is returned.
    fn close(self: Box<Self>) -> Result<()>;
}

/// The backend compiled into and selected for this process
#[derive(Debug)]
pub enum Backend {
    Simulator(Simulator),
    TpmDevice(DeviceAnchor),
    #[cfg(feature = "esapi")]
    TpmEsapi(EsapiAnchor),
}

impl Backend {
    pub fn from_config(config: &UtaConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config.backend {
            BackendKind::Simulator => {
                Backend::Simulator(Simulator::new(&config.machine_id_path))
            }
            BackendKind::TpmDevice => Backend::TpmDevice(DeviceAnchor::new(config)),
            #[cfg(feature = "esapi")]
            BackendKind::TpmEsapi => Backend::TpmEsapi(EsapiAnchor::new(config)),
            #[cfg(not(feature = "esapi"))]
            BackendKind::TpmEsapi => {
                bail!("tpm-esapi backend not compiled in (feature \"esapi\")")
            }
        })
    }

    fn inner(&self) -> &dyn TrustAnchor {
        match self {
            Backend::Simulator(anchor) => anchor,
            Backend::TpmDevice(anchor) => anchor,
            #[cfg(feature = "esapi")]
            Backend::TpmEsapi(anchor) => anchor,
        }
    }
}

impl TrustAnchor for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn connect(&self) -> Result<Box<dyn Session>> {
        self.inner().connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_tags() {
        assert_eq!(BackendKind::Simulator.tag(), 0);
        assert_eq!(BackendKind::TpmDevice.tag(), 1);
        assert_eq!(BackendKind::TpmEsapi.tag(), 2);
    }

    #[test]
    fn test_backend_names() {
        for kind in [
            BackendKind::Simulator,
            BackendKind::TpmDevice,
            BackendKind::TpmEsapi,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!("tpm-tcg".parse::<BackendKind>().unwrap(), BackendKind::TpmEsapi);
        assert!("tpm3".parse::<BackendKind>().is_err());
    }

    #[cfg(not(feature = "esapi"))]
    #[test]
    fn test_esapi_requires_feature() {
        let config = UtaConfig {
            backend: BackendKind::TpmEsapi,
            ..Default::default()
        };
        assert!(Backend::from_config(&config).is_err());
    }
}
