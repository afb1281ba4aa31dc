// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    CreatePrimary = 0x00000131,
    SelfTest = 0x00000143,
    Hmac = 0x00000155,
    FlushContext = 0x00000165,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetRandom = 0x0000017B,
    GetTestResult = 0x0000017C,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 Response Codes (TPM_RC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmRc {
    Success = 0x00000000,
    // Format 0 errors
    Initialize = 0x00000100,
    Failure = 0x00000101,
    NeedsTest = 0x00000153,
    // Format 1 errors (parameter errors)
    Value = 0x00000184,
    Handle = 0x0000008B,
    // Auth errors
    AuthFail = 0x0000098E,
    // Warnings
    Testing = 0x0000090A,
    Retry = 0x00000922,
    ObjectMemory = 0x00000902,
    SessionMemory = 0x00000903,
}

impl TpmRc {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x00000000 => TpmRc::Success,
            0x00000100 => TpmRc::Initialize,
            0x00000101 => TpmRc::Failure,
            0x00000153 => TpmRc::NeedsTest,
            0x00000184 => TpmRc::Value,
            0x0000008B => TpmRc::Handle,
            0x0000098E => TpmRc::AuthFail,
            0x0000090A => TpmRc::Testing,
            0x00000922 => TpmRc::Retry,
            0x00000902 => TpmRc::ObjectMemory,
            0x00000903 => TpmRc::SessionMemory,
            _ => TpmRc::Failure, // Unknown error
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, TpmRc::Success)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Aes = 0x0006,
    Cfb = 0x0043,
    KeyedHash = 0x0008,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0005 => Some(TpmAlgId::Hmac),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0006 => Some(TpmAlgId::Aes),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0008 => Some(TpmAlgId::KeyedHash),
            _ => None,
        }
    }
}

/// TPM 2.0 Handle Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    /// Handle type encoded in the most significant octet of a handle
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const NULL: u32 = 0x40000007;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PW: u32 = 0x40000009; // Password authorization
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const NO_DA: u32 = 1 << 10;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }

    pub fn with_sign_encrypt(mut self) -> Self {
        self.0 |= Self::SIGN_ENCRYPT;
        self
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}

/// Largest TPM2B_MAX_BUFFER payload accepted by reference TPMs
pub const MAX_DIGEST_BUFFER: usize = 1024;
