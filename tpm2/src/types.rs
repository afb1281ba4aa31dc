// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data structures

use anyhow::{bail, Result};

use super::constants::*;
use super::marshal::*;

/// TPM2B_DIGEST - Digest with size prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_MAX_BUFFER - Input data for HMAC/hash commands
#[derive(Debug, Clone)]
pub struct Tpm2bMaxBuffer {
    pub buffer: Vec<u8>,
}

impl Tpm2bMaxBuffer {
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_DIGEST_BUFFER {
            bail!(
                "buffer of {} bytes exceeds TPM2B_MAX_BUFFER ({} bytes)",
                data.len(),
                MAX_DIGEST_BUFFER
            );
        }
        Ok(Self {
            buffer: data.to_vec(),
        })
    }
}

impl Marshal for Tpm2bMaxBuffer {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bMaxBuffer {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_NAME - Object name (nameAlg || H(publicArea))
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bName {
    pub name: Vec<u8>,
}

impl Unmarshal for Tpm2bName {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            name: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_AUTH - Authorization value
#[derive(Debug, Clone, Default)]
pub struct Tpm2bAuth {
    pub buffer: Vec<u8>,
}

impl Marshal for Tpm2bAuth {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

/// TPM2B_SENSITIVE_DATA - Sensitive data
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveData {
    pub buffer: Vec<u8>,
}

impl Marshal for Tpm2bSensitiveData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

/// TPM2B_SENSITIVE_CREATE - Sensitive data for object creation
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Tpm2bAuth,
    pub data: Tpm2bSensitiveData,
}

impl Tpm2bSensitiveCreate {
    /// No authorization value and no caller-provided key material
    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let mut inner = CommandBuffer::new();
        self.user_auth.marshal(&mut inner);
        self.data.marshal(&mut inner);
        buf.put_tpm2b(inner.as_bytes());
    }
}

/// TPML_PCR_SELECTION - only the empty list is ever sent (creationPCR)
#[derive(Debug, Clone, Default)]
pub struct TpmlPcrSelection;

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(0);
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

/// TPMS_KEYEDHASH_PARMS - Keyed hash scheme (TPMT_KEYEDHASH_SCHEME)
#[derive(Debug, Clone, Copy)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmsKeyedHashParms {
    pub fn hmac(hash: TpmAlgId) -> Self {
        Self {
            scheme: TpmAlgId::Hmac,
            hash_alg: Some(hash),
        }
    }
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

/// TPMT_PUBLIC - Public area template for keyed-hash objects
#[derive(Debug, Clone)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmsKeyedHashParms,
    pub unique: Tpm2bDigest,
}

impl TpmtPublic {
    /// HMAC-SHA256 signing key derived from the hierarchy seed.
    ///
    /// The TPM derives the same key for the same template and seed, so
    /// this template must never change once identities are issued.
    pub fn hmac_key() -> Self {
        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_no_da()
                .with_sign_encrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmsKeyedHashParms::hmac(TpmAlgId::Sha256),
            unique: Tpm2bDigest::empty(),
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone)]
pub struct Tpm2bPublic {
    pub public_area: Vec<u8>, // Raw marshalled TPMT_PUBLIC
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.to_bytes(),
        }
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            public_area: buf.get_tpm2b()?,
        })
    }
}

/// TPMT_TK_CREATION - Creation ticket
#[derive(Debug, Clone)]
pub struct TpmtTkCreation {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

impl Unmarshal for TpmtTkCreation {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        let hierarchy = buf.get_u32()?;
        let digest = Tpm2bDigest::unmarshal(buf)?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPM2B_CREATION_DATA - Creation data
#[derive(Debug, Clone)]
pub struct Tpm2bCreationData {
    pub data: Vec<u8>,
}

impl Unmarshal for Tpm2bCreationData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            data: buf.get_tpm2b()?,
        })
    }
}

/// A loaded object together with the name used in authorization digests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmObject {
    pub handle: u32,
    pub name: Vec<u8>,
}
