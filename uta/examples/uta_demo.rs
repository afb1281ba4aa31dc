// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Runs every trust anchor operation once on the backend configured through
//! `UTA_CONFIG` / `UTA_BACKEND` / `UTA_TPM_DEVICE` / `UTA_MACHINE_ID`.
//!
//! ```sh
//! UTA_BACKEND=simulator RUST_LOG=debug cargo run -p uta --example uta_demo
//! ```

use anyhow::{Context as _, Result};
use tracing::info;

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let api = uta::init_from_env().context("failed to select backend")?;
    info!("version: {}", api.get_version());
    info!("context size: {} bytes", api.context_size());

    let ctx = api.new_context();
    ctx.open().context("failed to open context")?;

    ctx.self_test().context("self test")?;
    info!("self test passed");

    let uuid = ctx.get_device_uuid().context("device uuid")?;
    info!("device uuid: {uuid}");

    for slot in 0..2u8 {
        let key = ctx
            .derive_key(slot, &[1u8; uta::DV_LEN], api.len_key_max())
            .with_context(|| format!("derive key in slot {slot}"))?;
        info!("slot {slot} key: {}", hex::encode(key));
    }

    let random = ctx.get_random(32).context("random bytes")?;
    info!("random: {}", hex::encode(random));

    ctx.close().context("failed to close context")?;
    Ok(())
}
