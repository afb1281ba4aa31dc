// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::anchor::BackendKind;

/// Semantic version with major, minor, and patch components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Version of this library build
    pub fn current() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or_default()
    }

    /// Parse "major.minor[.patch]", dropping any prerelease (`-...`) or
    /// build metadata (`+...`) suffix and any components past the third.
    pub fn parse(version: &str) -> Option<Self> {
        let version = version.trim();
        let version = version
            .split_once(['-', '+'])
            .map(|(v, _)| v)
            .unwrap_or(version);
        if version.is_empty() {
            return None;
        }

        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version descriptor: which backend is compiled in, and at what version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtaVersion {
    pub uta_type: BackendKind,
    pub version: Version,
}

impl UtaVersion {
    pub fn new(uta_type: BackendKind) -> Self {
        Self {
            uta_type,
            version: Version::current(),
        }
    }
}

impl fmt::Display for UtaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.uta_type.tag(), self.version)
    }
}
