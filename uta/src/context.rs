// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-session state
//!
//! A [`Context`] is Closed until [`Context::open`] succeeds and Closed again
//! after [`Context::close`]. While open it owns exactly one backend session,
//! guarded by one mutex: every operation holds the lock for its whole
//! duration, so at most one trust anchor transaction is in flight per
//! context. Opening an open context is rejected; closing a closed one is a
//! no-op. Neither is meaningful usage and callers must not rely on either.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::anchor::{BackendKind, Session, TrustAnchor};
use crate::derive::DeriveRequest;
use crate::identity::DeviceUuid;
use crate::{random, Result, UtaError};

type SessionSlot = Option<Box<dyn Session>>;

pub struct Context {
    anchor: Arc<dyn TrustAnchor>,
    session: Mutex<SessionSlot>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.anchor.kind())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Context {
    /// Storage a context occupies
    pub const fn size() -> usize {
        std::mem::size_of::<Context>()
    }

    /// A closed context on an arbitrary trust anchor.
    ///
    /// This does not consult or pin the process-wide backend selection.
    pub fn with_anchor(anchor: Arc<dyn TrustAnchor>) -> Self {
        Self {
            anchor,
            session: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.anchor.kind()
    }

    pub fn is_open(&self) -> bool {
        match self.session.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.get_ref().is_some(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionSlot>> {
        self.session
            .lock()
            .map_err(|_| anyhow!("context lock poisoned").into())
    }

    /// Run `f` on the open session with the lock held
    fn with_session<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut dyn Session) -> anyhow::Result<T>,
    ) -> Result<T> {
        let mut slot = self.lock()?;
        let session = slot
            .as_deref_mut()
            .ok_or_else(|| anyhow!("{op}: context is not open"))?;
        f(session).map_err(|err| {
            warn!("{op} failed: {err:#}");
            UtaError::TrustAnchor(err)
        })
    }

    /// Establish the backend session.
    ///
    /// On failure everything acquired so far is released and the context
    /// stays closed.
    pub fn open(&self) -> Result<()> {
        let mut slot = self.lock()?;
        if slot.is_some() {
            return Err(anyhow!("context is already open").into());
        }
        let session = self.anchor.connect().map_err(|err| {
            warn!("failed to open {} session: {err:#}", self.kind());
            UtaError::TrustAnchor(err)
        })?;
        *slot = Some(session);
        info!("{} context opened", self.kind());
        Ok(())
    }

    /// Tear down the backend session.
    ///
    /// The context is closed afterwards even when a teardown step fails; the
    /// first failure is returned.
    pub fn close(&self) -> Result<()> {
        let mut slot = self.session.lock().unwrap_or_else(|poisoned| {
            warn!("closing context after a panic");
            poisoned.into_inner()
        });
        let result = slot.take().map(|session| session.close());
        drop(slot);
        self.session.clear_poison();
        match result {
            None => {
                debug!("close on a closed context");
                Ok(())
            }
            Some(Ok(())) => {
                info!("{} context closed", self.kind());
                Ok(())
            }
            Some(Err(err)) => {
                warn!("{} context closed with errors: {err:#}", self.kind());
                Err(err.into())
            }
        }
    }

    /// First `len_key` bytes of HMAC-SHA256(master_key[key_slot], dv)
    pub fn derive_key(&self, key_slot: u8, dv: &[u8], len_key: usize) -> Result<Vec<u8>> {
        let request = DeriveRequest::new(key_slot, dv, len_key)?;
        self.with_session("derive_key", |session| {
            let digest = session.hmac(request.slot, request.dv.as_bytes())?;
            request.truncate(digest)
        })
    }

    /// Exactly `len` random bytes, or nothing at all
    pub fn get_random(&self, len: usize) -> Result<Vec<u8>> {
        self.with_session("get_random", |session| random::collect(session, len))
    }

    /// Fill `buf` with random bytes. On failure `buf` is zeroed.
    pub fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        match self.get_random(buf.len()) {
            Ok(mut bytes) => {
                buf.copy_from_slice(&bytes);
                bytes.zeroize();
                Ok(())
            }
            Err(err) => {
                buf.zeroize();
                Err(err)
            }
        }
    }

    pub fn get_device_uuid(&self) -> Result<DeviceUuid> {
        self.with_session("get_device_uuid", |session| {
            session.identity().map(DeviceUuid::from_raw)
        })
    }

    /// Run the trust anchor's self test. Any nonzero result is an error.
    pub fn self_test(&self) -> Result<()> {
        let code = self.with_session("self_test", |session| session.self_test())?;
        if code != 0 {
            warn!("self test failed with 0x{code:x}");
            return Err(anyhow!("self test failed with 0x{code:x}").into());
        }
        debug!("self test passed");
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let slot = match self.session.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(session) = slot.take() {
            debug!("closing context on drop");
            if let Err(err) = session.close() {
                warn!("failed to close dropped context: {err:#}");
            }
        }
    }
}
