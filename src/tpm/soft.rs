//! A software model of the parts of a TPM the disk lifecycle depends on:
//! PCR banks, policy-gated sealed objects and PIN authorization with a
//! dictionary-attack counter.
//!
//! Every bank is modelled with SHA-256 regardless of its nominal algorithm.
//! Nothing here is secret; it exists so policy behaviour can be tested
//! without hardware.

use super::pcr::{PcrBank, PcrSelection, PCR_COUNT};
use super::{
    AuthFailure, PersistentHandle, Result, SealPath, SealedKeyStore, SealedObject, SealingPolicy,
    TpmError, MAX_SEALED_SIZE,
};
use crate::key::SecretKey;
use crate::pin::Pin;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const DEFAULT_MAX_AUTH_FAIL: u32 = 32;

type PcrValue = [u8; 32];

#[derive(Debug)]
struct SoftObject {
    path: SealPath,
    pcrs: PcrSelection,
    policy_digest: PcrValue,
    auth: Option<PcrValue>,
    secret: SecretKey,
}

#[derive(Debug)]
pub struct SoftTpm {
    banks: HashMap<PcrBank, [PcrValue; PCR_COUNT as usize]>,
    objects: BTreeMap<PersistentHandle, SoftObject>,
    failed_auth: u32,
    max_auth_fail: u32,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self {
            banks: HashMap::new(),
            objects: BTreeMap::new(),
            failed_auth: 0,
            max_auth_fail: DEFAULT_MAX_AUTH_FAIL,
        }
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_auth_fail(mut self, tries: u32) -> Self {
        self.max_auth_fail = tries;
        self
    }

    fn bank(&mut self, bank: PcrBank) -> &mut [PcrValue; PCR_COUNT as usize] {
        self.banks
            .entry(bank)
            .or_insert([[0u8; 32]; PCR_COUNT as usize])
    }

    pub fn pcr(&mut self, bank: PcrBank, index: u8) -> PcrValue {
        self.bank(bank)[usize::from(index % PCR_COUNT)]
    }

    /// `PCR[index] = H(PCR[index] || H(measurement))`
    pub fn extend(&mut self, bank: PcrBank, index: u8, measurement: &[u8]) {
        let event = Sha256::digest(measurement);
        let slot = &mut self.bank(bank)[usize::from(index % PCR_COUNT)];
        let mut hasher = Sha256::new();
        hasher.update(*slot);
        hasher.update(event);
        slot.copy_from_slice(&hasher.finalize());
    }

    /// Overwrites a register, as if the platform had booted into a state with
    /// that measurement.
    pub fn set_pcr(&mut self, bank: PcrBank, index: u8, value: PcrValue) {
        self.bank(bank)[usize::from(index % PCR_COUNT)] = value;
    }

    /// Power cycle: all registers back to zero, lockout counter cleared.
    pub fn reset(&mut self) {
        self.banks.clear();
        self.failed_auth = 0;
    }

    pub fn sealed_paths(&self) -> impl Iterator<Item = &SealPath> {
        self.objects.values().map(|object| &object.path)
    }

    /// Every object sealed for `path`, in handle order.
    pub fn objects_for<'a>(
        &'a self,
        path: &'a SealPath,
    ) -> impl Iterator<Item = SealedObject> + 'a {
        self.objects
            .iter()
            .filter(move |(_, object)| object.path == *path)
            .map(|(handle, object)| SealedObject::new(object.path.clone(), *handle))
    }

    /// Occupies `handle` with an object nobody can unseal, as another tool
    /// sharing the TPM would.
    pub fn occupy(&mut self, handle: PersistentHandle) {
        self.objects.insert(
            handle,
            SoftObject {
                path: SealPath::from("/foreign"),
                pcrs: PcrSelection::default(),
                policy_digest: [0xff; 32],
                auth: None,
                secret: SecretKey::from_bytes(Vec::new()),
            },
        );
    }

    fn live(&self, object: &SealedObject) -> Option<&SoftObject> {
        self.objects
            .get(&object.handle)
            .filter(|found| found.path == object.path)
    }

    pub fn failed_auth_count(&self) -> u32 {
        self.failed_auth
    }

    fn policy_digest(&mut self, selection: &PcrSelection) -> PcrValue {
        let bank = selection.bank();
        let mut hasher = Sha256::new();
        hasher.update(bank.as_str().as_bytes());
        for slot in selection.slots() {
            hasher.update([slot]);
            hasher.update(self.pcr(bank, slot));
        }
        hasher.finalize().into()
    }
}

fn auth_digest(pin: &Pin) -> PcrValue {
    Sha256::digest(pin.as_bytes()).into()
}

impl SealedKeyStore for SoftTpm {
    fn seal(
        &mut self,
        path: &SealPath,
        secret: &SecretKey,
        policy: &SealingPolicy,
    ) -> Result<SealedObject> {
        if secret.len() > MAX_SEALED_SIZE {
            return Err(TpmError::SecretTooLarge(secret.len()));
        }
        let taken: BTreeSet<u32> = self.objects.keys().map(|handle| handle.raw()).collect();
        let handle = PersistentHandle::first_free(path, &taken)?;
        let policy_digest = self.policy_digest(&policy.pcrs);
        self.objects.insert(
            handle,
            SoftObject {
                path: path.clone(),
                pcrs: policy.pcrs.clone(),
                policy_digest,
                auth: policy.pin.as_ref().map(auth_digest),
                secret: secret.clone(),
            },
        );
        let object = SealedObject::new(path.clone(), handle);
        log::info!("Sealed {} byte secret at {}", secret.len(), object);
        Ok(object)
    }

    fn unseal(
        &mut self,
        sealed: &SealedObject,
        pcrs: &PcrSelection,
        pin: Option<&Pin>,
    ) -> Result<SecretKey> {
        let current = self.policy_digest(pcrs);
        let object = self
            .live(sealed)
            .ok_or_else(|| TpmError::NotFound(sealed.clone()))?;

        if object.pcrs != *pcrs || object.policy_digest != current {
            return Err(AuthFailure::PlatformChanged.into());
        }

        if let Some(expected) = object.auth {
            if self.failed_auth >= self.max_auth_fail {
                return Err(AuthFailure::Lockout.into());
            }
            let secret = object.secret.clone();
            return match pin {
                None => Err(AuthFailure::PinRequired.into()),
                Some(pin) if auth_digest(pin) == expected => Ok(secret),
                Some(_) => {
                    self.failed_auth += 1;
                    Err(AuthFailure::WrongPin.into())
                }
            };
        }

        Ok(object.secret.clone())
    }

    fn exists(&mut self, object: &SealedObject) -> Result<bool> {
        Ok(self.live(object).is_some())
    }

    fn remove(&mut self, object: &SealedObject) -> Result<()> {
        if self.live(object).is_none() {
            return Err(TpmError::NotFound(object.clone()));
        }
        self.objects.remove(&object.handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn path() -> SealPath {
        SealPath::from("/HS/SRK/luks_disk_test")
    }

    #[test]
    fn seal_unseal() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let secret = SecretKey::from_bytes(b"Howdy".to_vec());
        let policy = SealingPolicy::new(PcrSelection::default(), None);

        let object = tpm.seal(&path(), &secret, &policy)?;
        let unsealed = tpm.unseal(&object, &policy.pcrs, None)?;
        assert_eq!(secret, unsealed);

        // Unsealing does not consume the object.
        assert!(tpm.unseal(&object, &policy.pcrs, None).is_ok());
        Ok(())
    }

    #[test]
    fn occupied_handle_is_skipped() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let policy = SealingPolicy::new(PcrSelection::default(), None);
        let preferred = PersistentHandle::candidates(&path())
            .next()
            .ok_or_else(|| eyre::eyre!("empty handle range"))?;
        tpm.occupy(preferred);

        let object = tpm.seal(&path(), &SecretKey::generate(64), &policy)?;
        assert_ne!(object.handle, preferred);
        assert!(tpm.unseal(&object, &policy.pcrs, None).is_ok());

        // The foreign object is not ours even though the path matches.
        let squatter = SealedObject::new(path(), preferred);
        assert!(!tpm.exists(&squatter)?);
        assert!(matches!(
            tpm.unseal(&squatter, &policy.pcrs, None),
            Err(TpmError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn extended_pcr_blocks_unseal() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let policy = SealingPolicy::new(PcrSelection::default(), None);
        let object = tpm.seal(&path(), &SecretKey::generate(64), &policy)?;

        tpm.extend(PcrBank::Sha256, 4, b"new bootloader");
        let err = tpm.unseal(&object, &policy.pcrs, None).unwrap_err();
        assert_eq!(err.auth_failure(), Some(AuthFailure::PlatformChanged));
        Ok(())
    }

    #[test]
    fn registers_outside_the_selection_do_not_matter() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let policy = SealingPolicy::new(PcrSelection::default(), None);
        let object = tpm.seal(&path(), &SecretKey::generate(64), &policy)?;

        tpm.extend(PcrBank::Sha256, 8, b"kernel command line");
        tpm.extend(PcrBank::Sha1, 0, b"other bank");
        assert!(tpm.unseal(&object, &policy.pcrs, None).is_ok());
        Ok(())
    }

    #[test]
    fn pin_is_checked_after_pcrs() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let pin = Pin::new("2468");
        let policy = SealingPolicy::new(PcrSelection::default(), Some(pin.clone()));
        let object = tpm.seal(&path(), &SecretKey::generate(64), &policy)?;

        let missing = tpm.unseal(&object, &policy.pcrs, None).unwrap_err();
        assert_eq!(missing.auth_failure(), Some(AuthFailure::PinRequired));

        let wrong = tpm
            .unseal(&object, &policy.pcrs, Some(&Pin::new("1357")))
            .unwrap_err();
        assert_eq!(wrong.auth_failure(), Some(AuthFailure::WrongPin));
        assert_eq!(tpm.failed_auth_count(), 1);

        assert!(tpm.unseal(&object, &policy.pcrs, Some(&pin)).is_ok());

        tpm.extend(PcrBank::Sha256, 0, b"firmware update");
        let changed = tpm.unseal(&object, &policy.pcrs, Some(&pin)).unwrap_err();
        assert_eq!(changed.auth_failure(), Some(AuthFailure::PlatformChanged));
        Ok(())
    }

    #[test]
    fn lockout_after_too_many_wrong_pins() -> Result<()> {
        let mut tpm = SoftTpm::new().with_max_auth_fail(2);
        let pin = Pin::new("2468");
        let policy = SealingPolicy::new(PcrSelection::default(), Some(pin.clone()));
        let object = tpm.seal(&path(), &SecretKey::generate(64), &policy)?;

        for _ in 0..2 {
            let _ = tpm.unseal(&object, &policy.pcrs, Some(&Pin::new("0000")));
        }
        let locked = tpm.unseal(&object, &policy.pcrs, Some(&pin)).unwrap_err();
        assert_eq!(locked.auth_failure(), Some(AuthFailure::Lockout));

        tpm.reset();
        assert!(tpm.unseal(&object, &policy.pcrs, Some(&pin)).is_ok());
        Ok(())
    }

    #[test]
    fn remove_missing_object() -> Result<()> {
        let mut tpm = SoftTpm::new();
        let object = SealedObject::new(path(), PersistentHandle::new(PersistentHandle::FIRST)?);
        assert!(matches!(tpm.remove(&object), Err(TpmError::NotFound(_))));
        Ok(())
    }
}
