//! The sealed-key store: TPM objects holding a secret behind a PCR (and
//! optionally PIN) policy.
//!
//! [`SealedKeyStore`] is implemented by
//! - [`tools::Tpm2Tools`], driving the tpm2-tools binaries,
//! - `esapi::EsapiStore` (feature `tpm2`), talking to libtss2-esys directly,
//! - [`soft::SoftTpm`], an in-process model used to exercise policies in tests.

use crate::key::SecretKey;
use crate::pin::Pin;
use pcr::{PcrError, PcrSelection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[cfg(feature = "tpm2")]
pub mod esapi;
pub mod pcr;
pub mod soft;
pub mod tools;

/// Largest payload a TPM keyed-hash object can carry.
pub const MAX_SEALED_SIZE: usize = 128;

/// Why the TPM refused to release a sealed key.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("platform measurements differ from the ones the key was sealed against")]
    PlatformChanged,
    #[error("wrong PIN")]
    WrongPin,
    #[error("the sealed key is PIN protected but no PIN was given")]
    PinRequired,
    #[error("the TPM is in dictionary-attack lockout")]
    Lockout,
}

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("no free persistent handle left for {0}")]
    NoFreeHandle(SealPath),
    #[error("{0:#010x} is not an owner persistent handle")]
    InvalidHandle(u32),
    #[error("invalid persistent handle `{0}`")]
    InvalidHandleString(String),
    #[error("no sealed object at {0}")]
    NotFound(SealedObject),
    #[error(transparent)]
    Auth(#[from] AuthFailure),
    #[error("secret of {0} bytes exceeds the 128 byte sealing limit")]
    SecretTooLarge(usize),
    #[error("{tool} failed: {diagnostic} (exit code {status})")]
    Tool {
        tool: String,
        status: i32,
        diagnostic: String,
    },
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "tpm2")]
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[cfg(feature = "tpm2")]
    #[error("TPM context lock poisoned")]
    ContextPoisoned,
    #[cfg(feature = "tpm2")]
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

impl TpmError {
    pub fn auth_failure(&self) -> Option<AuthFailure> {
        match self {
            TpmError::Auth(failure) => Some(*failure),
            _ => None,
        }
    }
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// Hierarchical name of a sealed object, e.g. `/HS/SRK/luks_disk_backup`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SealPath(String);

impl SealPath {
    pub fn new(prefix: &str, name: &str) -> Self {
        Self(format!("{}{}", prefix, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SealPath {
    fn from(path: &str) -> Self {
        Self(path.to_owned())
    }
}

impl From<String> for SealPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

impl fmt::Display for SealPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner persistent handle in `0x8101_0000..=0x8101_ffff`, the range sealed
/// disk keys are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersistentHandle(u32);

impl PersistentHandle {
    pub const FIRST: u32 = 0x8101_0000;
    pub const LAST: u32 = 0x8101_ffff;

    pub fn new(raw: u32) -> Result<Self> {
        match raw {
            Self::FIRST..=Self::LAST => Ok(Self(raw)),
            _ => Err(TpmError::InvalidHandle(raw)),
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Every handle in the range, starting at the slot `path` hashes to and
    /// wrapping around.
    pub fn candidates(path: &SealPath) -> impl Iterator<Item = Self> {
        let digest = Sha256::digest(path.as_str().as_bytes());
        let start = u16::from_be_bytes([digest[0], digest[1]]);
        (0..=u16::MAX).map(move |offset| Self(Self::FIRST | u32::from(start.wrapping_add(offset))))
    }

    /// First candidate for `path` that is not in `taken`.
    pub fn first_free(path: &SealPath, taken: &BTreeSet<u32>) -> Result<Self> {
        Self::candidates(path)
            .find(|handle| !taken.contains(&handle.0))
            .ok_or_else(|| TpmError::NoFreeHandle(path.clone()))
    }
}

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl FromStr for PersistentHandle {
    type Err = TpmError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        let raw = u32::from_str_radix(digits, 16)
            .map_err(|_| TpmError::InvalidHandleString(s.to_owned()))?;
        Self::new(raw)
    }
}

impl TryFrom<String> for PersistentHandle {
    type Error = TpmError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PersistentHandle> for String {
    fn from(handle: PersistentHandle) -> Self {
        handle.to_string()
    }
}

/// A sealed object: the path it was created for and the handle it was made
/// persistent at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedObject {
    pub path: SealPath,
    pub handle: PersistentHandle,
}

impl SealedObject {
    pub fn new(path: SealPath, handle: PersistentHandle) -> Self {
        Self { path, handle }
    }
}

impl fmt::Display for SealedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.handle)
    }
}

/// PCR values must match their seal-time state, and if `pin` is set the
/// caller must also present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealingPolicy {
    pub pcrs: PcrSelection,
    pub pin: Option<Pin>,
}

impl SealingPolicy {
    pub fn new(pcrs: PcrSelection, pin: Option<Pin>) -> Self {
        Self { pcrs, pin }
    }

    pub fn requires_pin(&self) -> bool {
        self.pin.is_some()
    }
}

pub trait SealedKeyStore {
    /// Creates a sealed object for `path` at a free persistent handle and
    /// returns where it went.
    fn seal(
        &mut self,
        path: &SealPath,
        secret: &SecretKey,
        policy: &SealingPolicy,
    ) -> Result<SealedObject>;

    /// Evaluates the policy against the live PCRs (and `pin`) and returns the
    /// secret on success.
    fn unseal(
        &mut self,
        object: &SealedObject,
        pcrs: &PcrSelection,
        pin: Option<&Pin>,
    ) -> Result<SecretKey>;

    fn exists(&mut self, object: &SealedObject) -> Result<bool>;

    fn remove(&mut self, object: &SealedObject) -> Result<()>;
}

impl<T: SealedKeyStore + ?Sized> SealedKeyStore for Box<T> {
    fn seal(
        &mut self,
        path: &SealPath,
        secret: &SecretKey,
        policy: &SealingPolicy,
    ) -> Result<SealedObject> {
        (**self).seal(path, secret, policy)
    }

    fn unseal(
        &mut self,
        object: &SealedObject,
        pcrs: &PcrSelection,
        pin: Option<&Pin>,
    ) -> Result<SecretKey> {
        (**self).unseal(object, pcrs, pin)
    }

    fn exists(&mut self, object: &SealedObject) -> Result<bool> {
        (**self).exists(object)
    }

    fn remove(&mut self, object: &SealedObject) -> Result<()> {
        (**self).remove(object)
    }
}
