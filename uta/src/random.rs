// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, bail, Result};
use tracing::debug;
use zeroize::Zeroizing;

use crate::anchor::Session;

/// Gather exactly `len` bytes from a backend that may return short chunks.
///
/// Bytes are handed out only once all of them are collected; on failure the
/// partial buffer is wiped.
pub(crate) fn collect(session: &mut dyn Session, len: usize) -> Result<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::new());
    out.try_reserve_exact(len)
        .map_err(|err| anyhow!("cannot buffer {len} random bytes: {err}"))?;
    let mut requests = 0usize;
    while out.len() < len {
        let remaining = len - out.len();
        let chunk = Zeroizing::new(session.random(remaining)?);
        requests += 1;
        if chunk.is_empty() {
            bail!("trust anchor returned no random bytes ({remaining} outstanding)");
        }
        let take = chunk.len().min(remaining);
        out.extend_from_slice(&chunk[..take]);
    }
    debug!("collected {len} random bytes in {requests} requests");
    Ok(std::mem::take(&mut *out))
}
