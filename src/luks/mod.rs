use crate::key::SecretKey;
use crate::pin::{ask_existing_pin, PinError, PinPrompt};
use crate::tpm::pcr::PcrSelection;
use crate::tpm::{
    PersistentHandle, SealPath, SealedKeyStore, SealedObject, SealingPolicy, TpmError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod cryptsetup;

/// LUKS2 token type written by this tool.
pub const TOKEN_TYPE: &str = "tpm-disk";

#[derive(Error, Debug)]
pub enum LuksError {
    #[error("{} carries no tpm-disk token; passphrase unlock is not offered", .0.display())]
    TokenMissing(PathBuf),
    #[error("the key does not open any keyslot of {}", .0.display())]
    NoMatchingKeyslot(PathBuf),
    #[error("sealed key unavailable: {0}")]
    Unseal(#[from] TpmError),
    #[error(transparent)]
    Pin(#[from] PinError),
    #[error("cryptsetup {action} failed: {diagnostic} (exit code {status})")]
    Command {
        action: &'static str,
        status: i32,
        diagnostic: String,
    },
    #[error("unreadable LUKS2 metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = LuksError> = core::result::Result<T, E>;

/// The LUKS2 token linking a keyslot to the TPM object holding its passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKeyToken {
    #[serde(rename = "type")]
    pub kind: String,
    pub keyslots: Vec<String>,
    #[serde(rename = "tpm-disk-seal-path")]
    pub seal_path: String,
    #[serde(rename = "tpm-disk-handle")]
    pub handle: PersistentHandle,
    #[serde(rename = "tpm-disk-pcrs")]
    pub pcrs: PcrSelection,
    #[serde(rename = "tpm-disk-pin")]
    pub pin: bool,
}

impl SealedKeyToken {
    pub fn new(sealed: &SealedObject, policy: &SealingPolicy) -> Self {
        Self {
            kind: TOKEN_TYPE.to_owned(),
            keyslots: Vec::new(),
            seal_path: sealed.path.to_string(),
            handle: sealed.handle,
            pcrs: policy.pcrs.clone(),
            pin: policy.requires_pin(),
        }
    }

    pub fn with_keyslot(mut self, keyslot: impl Into<String>) -> Self {
        self.keyslots = vec![keyslot.into()];
        self
    }

    pub fn keyslot(&self) -> Option<&str> {
        self.keyslots.first().map(String::as_str)
    }

    pub fn seal_path(&self) -> SealPath {
        SealPath::from(self.seal_path.as_str())
    }

    pub fn sealed_object(&self) -> SealedObject {
        SealedObject::new(self.seal_path(), self.handle)
    }
}

/// Outcome of closing a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Closed,
    NotActive,
}

pub trait CryptoContainer {
    /// Formats `image` as LUKS2 with `secret` as the first keyslot passphrase.
    fn format(&mut self, image: &Path, secret: &SecretKey) -> Result<()>;

    /// Stores `token`, bound to whichever keyslot `secret` opens.
    fn add_token(&mut self, image: &Path, token: &SealedKeyToken, secret: &SecretKey) -> Result<()>;

    /// Unlocks through the embedded token only and returns the mapped device.
    fn open(
        &mut self,
        image: &Path,
        mapper: &str,
        store: &mut dyn SealedKeyStore,
        pins: &mut dyn PinPrompt,
    ) -> Result<PathBuf>;

    fn open_with_key(&mut self, image: &Path, mapper: &str, secret: &SecretKey) -> Result<PathBuf>;

    fn close(&mut self, mapper: &str) -> Result<Closed>;

    fn is_active(&mut self, mapper: &str) -> Result<bool>;

    /// Device node a mapping appears under.
    fn device(&self, mapper: &str) -> PathBuf;
}

impl<T: CryptoContainer + ?Sized> CryptoContainer for Box<T> {
    fn format(&mut self, image: &Path, secret: &SecretKey) -> Result<()> {
        (**self).format(image, secret)
    }

    fn add_token(&mut self, image: &Path, token: &SealedKeyToken, secret: &SecretKey) -> Result<()> {
        (**self).add_token(image, token, secret)
    }

    fn open(
        &mut self,
        image: &Path,
        mapper: &str,
        store: &mut dyn SealedKeyStore,
        pins: &mut dyn PinPrompt,
    ) -> Result<PathBuf> {
        (**self).open(image, mapper, store, pins)
    }

    fn open_with_key(&mut self, image: &Path, mapper: &str, secret: &SecretKey) -> Result<PathBuf> {
        (**self).open_with_key(image, mapper, secret)
    }

    fn close(&mut self, mapper: &str) -> Result<Closed> {
        (**self).close(mapper)
    }

    fn is_active(&mut self, mapper: &str) -> Result<bool> {
        (**self).is_active(mapper)
    }

    fn device(&self, mapper: &str) -> PathBuf {
        (**self).device(mapper)
    }
}

/// Releases the key a token refers to, asking for the PIN first when the
/// token says the policy includes one.
pub fn unseal_token_key(
    token: &SealedKeyToken,
    store: &mut dyn SealedKeyStore,
    pins: &mut dyn PinPrompt,
) -> Result<SecretKey> {
    let sealed = token.sealed_object();
    let pin = match token.pin {
        true => Some(ask_existing_pin(pins, sealed.path.as_str())?),
        false => None,
    };
    log::debug!("unsealing {} against {}", sealed, token.pcrs);
    Ok(store.unseal(&sealed, &token.pcrs, pin.as_ref())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::{Pin, ScriptedPins};
    use crate::tpm::soft::SoftTpm;
    use crate::tpm::AuthFailure;
    use eyre::Result;

    #[test]
    fn token_json_shape() -> Result<()> {
        let policy = SealingPolicy::new(PcrSelection::default(), Some(Pin::new("1")));
        let sealed = SealedObject::new(
            SealPath::from("/HS/SRK/luks_disk_a"),
            PersistentHandle::new(0x8101_0007)?,
        );
        let token = SealedKeyToken::new(&sealed, &policy).with_keyslot("0");
        let json = serde_json::to_value(&token)?;
        assert_eq!(json["type"], "tpm-disk");
        assert_eq!(json["keyslots"], serde_json::json!(["0"]));
        assert_eq!(json["tpm-disk-seal-path"], "/HS/SRK/luks_disk_a");
        assert_eq!(json["tpm-disk-handle"], "0x81010007");
        assert_eq!(json["tpm-disk-pcrs"], "sha256:0,1,2,3,4,5,6,7");
        assert_eq!(json["tpm-disk-pin"], true);

        let back: SealedKeyToken = serde_json::from_value(json)?;
        assert_eq!(back, token);
        Ok(())
    }

    #[test]
    fn token_without_pin_never_prompts() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let path = SealPath::from("/HS/SRK/luks_disk_a");
        let policy = SealingPolicy::new(PcrSelection::default(), None);
        let key = SecretKey::generate(64);
        let sealed = tpm.seal(&path, &key, &policy)?;

        let mut pins = ScriptedPins::default();
        let token = SealedKeyToken::new(&sealed, &policy).with_keyslot("0");
        assert_eq!(unseal_token_key(&token, &mut tpm, &mut pins)?, key);
        assert!(pins.prompts().is_empty());
        Ok(())
    }

    #[test]
    fn token_with_pin_prompts_once() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let path = SealPath::from("/HS/SRK/luks_disk_a");
        let policy = SealingPolicy::new(PcrSelection::default(), Some(Pin::new("77")));
        let sealed = tpm.seal(&path, &SecretKey::generate(64), &policy)?;
        let token = SealedKeyToken::new(&sealed, &policy).with_keyslot("0");

        let mut pins = ScriptedPins::new(["78"]);
        let err = unseal_token_key(&token, &mut tpm, &mut pins).unwrap_err();
        match err {
            LuksError::Unseal(err) => assert_eq!(err.auth_failure(), Some(AuthFailure::WrongPin)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(pins.prompts().len(), 1);
        Ok(())
    }
}
