use super::pcr::PcrSelection;
use super::{
    AuthFailure, PersistentHandle, Result, SealPath, SealedKeyStore, SealedObject, SealingPolicy,
    TpmError, MAX_SEALED_SIZE,
};
use crate::key::SecretKey;
use crate::pin::Pin;
use ambassador::{delegatable_trait, Delegate};
use once_cell::sync::OnceCell;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tss_esapi::attributes::{ObjectAttributes, SessionAttributes};
use tss_esapi::constants::response_code::Tss2ResponseCodeKind;
use tss_esapi::constants::{CapabilityType, SessionType};
use tss_esapi::handles::{KeyHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    Auth, CapabilityData, CreateKeyResult, CreatePrimaryKeyResult, Digest, EccPoint,
    KeyedHashScheme, PcrSelectionList, Public, PublicEccParametersBuilder,
    PublicKeyedHashParameters, SensitiveData, SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;

pub type Context = MutexGuard<'static, tss_esapi::Context>;
pub trait TContext: DerefMut<Target = tss_esapi::Context> {}
impl TContext for Context {}

pub struct Ctx<C: TContext, S: ContextState> {
    ctx: C,
    state: S,
}

#[delegatable_trait]
trait FlushSession {
    fn flush_session(&mut self, session: AuthSession) -> Result<()>;
}

impl FlushSession for Context {
    fn flush_session(&mut self, session: AuthSession) -> Result<()> {
        let handle = match session {
            AuthSession::HmacSession(session) => match session {
                HmacSession::HmacSession { session_handle, .. } => Some(session_handle.into()),
            },
            AuthSession::PolicySession(session) => match session {
                PolicySession::PolicySession { session_handle, .. } => Some(session_handle.into()),
            },
            _ => None,
        };
        if let Some(handle) = handle {
            self.flush_context(handle)?;
        }
        Ok(())
    }
}

impl<C: TContext, S: ContextState> Ctx<C, S> {
    fn persistent_exists(&mut self, handle: PersistentTpmHandle) -> bool {
        self.ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))
            .is_ok()
    }

    fn evict_persistent(&mut self, handle: PersistentTpmHandle) -> Result<()> {
        let retrieved = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))?;
        // EvictControl needs an owner authorization session
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, retrieved, Persistent::Persistent(handle))
            })?;
        Ok(())
    }

    /// Persistent handles in the range sealed disk keys use.
    fn persistent_handles(&mut self) -> Result<BTreeSet<u32>> {
        let mut taken = BTreeSet::new();
        let mut property = PersistentHandle::FIRST;
        loop {
            let (capabilities, more) = self.ctx.get_capability(
                CapabilityType::Handles,
                property,
                MAX_HANDLES_PER_CALL,
            )?;
            let mut last = None;
            if let CapabilityData::Handles(handles) = capabilities {
                for handle in handles.into_inner() {
                    let raw = u32::from(handle);
                    taken.insert(raw);
                    last = Some(raw);
                }
            }
            match last {
                Some(raw) if more && raw < PersistentHandle::LAST => property = raw + 1,
                _ => break,
            }
        }
        Ok(taken)
    }

    fn flush_transient(&mut self) -> Result<()> {
        let (capabilities, _) = self.ctx.get_capability(
            CapabilityType::Handles,
            TRANSIENT_FIRST,
            MAX_HANDLES_PER_CALL,
        )?;
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                let handle = self
                    .ctx
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))?;
                self.ctx.flush_context(handle).ok();
            }
        }
        Ok(())
    }

    fn make_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(TpmError::AuthSessionCreate)?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.ctx
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
        Ok(session)
    }

    /// PolicyPCR over the live register values, then PolicyAuthValue if the
    /// PIN is part of the policy.
    fn apply_policy(
        &mut self,
        session: AuthSession,
        pcr_selection_list: PcrSelectionList,
        with_pin: bool,
    ) -> Result<()> {
        let policy_session: PolicySession = session.try_into()?;
        // An empty digest makes the TPM use the current PCR values
        self.ctx
            .policy_pcr(policy_session, Digest::default(), pcr_selection_list)?;
        if with_pin {
            self.ctx.policy_auth_value(policy_session)?;
        }
        Ok(())
    }
}

pub struct Initial;
pub type InitialContext = Ctx<Context, Initial>;
pub struct PrimaryKey;
#[derive(Delegate)]
#[delegate(FlushSession, target = "ctx")]
pub struct PkCtx {
    ctx: Context,
    pub key: KeyHandle,
}
impl Deref for PkCtx {
    type Target = tss_esapi::Context;
    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}
impl DerefMut for PkCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}
impl Drop for PkCtx {
    fn drop(&mut self) {
        self.ctx.flush_context(self.key.into()).ok();
    }
}
impl TContext for PkCtx {}
pub type PrimaryKeyContext = Ctx<PkCtx, PrimaryKey>;
pub struct SealPolicy {
    policy_digest: Digest,
}
pub type SealPolicyContext = Ctx<PkCtx, SealPolicy>;
pub struct PolicyAuthed;
#[derive(Delegate)]
#[delegate(FlushSession, target = "ctx")]
pub struct PolicyAuthedCtx {
    ctx: Context,
    pub session: AuthSession,
}
impl Deref for PolicyAuthedCtx {
    type Target = tss_esapi::Context;
    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}
impl DerefMut for PolicyAuthedCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}
impl Drop for PolicyAuthedCtx {
    fn drop(&mut self) {
        self.ctx.flush_session(self.session).ok();
    }
}
impl TContext for PolicyAuthedCtx {}
pub type PolicyAuthedContext = Ctx<PolicyAuthedCtx, PolicyAuthed>;

pub trait ContextState {}
impl ContextState for Initial {}
impl ContextState for PrimaryKey {}
impl ContextState for SealPolicy {}
impl ContextState for PolicyAuthed {}

impl InitialContext {
    pub fn policy_auth(
        mut self,
        pcr_selection_list: PcrSelectionList,
        with_pin: bool,
    ) -> Result<PolicyAuthedContext> {
        let session = self.make_session(SessionType::Policy)?;
        self.apply_policy(session, pcr_selection_list, with_pin)?;
        Ok(PolicyAuthedContext {
            ctx: PolicyAuthedCtx {
                ctx: self.ctx,
                session,
            },
            state: PolicyAuthed,
        })
    }

    pub fn create_primary(mut self) -> Result<PrimaryKeyContext> {
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_sign_encrypt(false)
            .with_restricted(true)
            .build()?;

        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_ecc_parameters(
                PublicEccParametersBuilder::new_restricted_decryption_key(
                    SymmetricDefinitionObject::AES_128_CFB,
                    EccCurve::NistP256,
                )
                .build()?,
            )
            .with_ecc_unique_identifier(EccPoint::default())
            .build()?;

        let CreatePrimaryKeyResult {
            key_handle: key, ..
        } = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
        })?;

        Ok(PrimaryKeyContext {
            ctx: PkCtx { ctx: self.ctx, key },
            state: PrimaryKey,
        })
    }

    pub fn remove(mut self, handle: PersistentTpmHandle) -> Result<()> {
        self.evict_persistent(handle)
    }
}

impl PrimaryKeyContext {
    pub fn with_policy(mut self, policy: &SealingPolicy) -> Result<SealPolicyContext> {
        let session = self.make_session(SessionType::Trial)?;
        let pcr_selection_list = PcrSelectionList::try_from(&policy.pcrs)?;

        self.apply_policy(session, pcr_selection_list, policy.requires_pin())?;
        let policy_digest = self.ctx.policy_get_digest(session.try_into()?)?;
        self.ctx.flush_session(session)?;

        Ok(SealPolicyContext {
            ctx: self.ctx,
            state: SealPolicy { policy_digest },
        })
    }
}

impl SealPolicyContext {
    pub fn seal(
        &mut self,
        data: SensitiveData,
        auth: Option<Auth>,
        handle: PersistentTpmHandle,
    ) -> Result<&mut Self> {
        let key = self.ctx.key;

        // No user_with_auth: the object only opens through its policy
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()?;

        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(self.state.policy_digest.clone())
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?;

        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                let CreateKeyResult {
                    out_private,
                    out_public,
                    ..
                } = ctx.create(key, public, auth, Some(data), None, None)?;
                let transient = ctx.load(key, out_private, out_public)?.into();
                let mut persistent =
                    ctx.evict_control(Provision::Owner, transient, Persistent::Persistent(handle))?;
                ctx.flush_context(transient)?;
                ctx.tr_close(&mut persistent)?;
                Ok::<(), TpmError>(())
            })?;
        Ok(self)
    }
}

impl PolicyAuthedContext {
    pub fn unseal(mut self, handle: PersistentTpmHandle, pin: Option<Auth>) -> Result<SensitiveData> {
        let object_handle = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle.into()))?;
        if let Some(pin) = pin {
            self.ctx.tr_set_auth(object_handle, pin)?;
        }
        let session = self.ctx.session;
        let data = self
            .ctx
            .execute_with_session(Some(session), |ctx| ctx.unseal(object_handle))
            .map_err(classify)?;
        Ok(data)
    }
}

/// Maps TPM response codes that mean "policy not satisfied" onto [`AuthFailure`].
fn classify(err: tss_esapi::Error) -> TpmError {
    if let tss_esapi::Error::Tss2Error(rc) = err {
        match rc.kind() {
            Some(Tss2ResponseCodeKind::PolicyFail) | Some(Tss2ResponseCodeKind::PcrChanged) => {
                return AuthFailure::PlatformChanged.into()
            }
            Some(Tss2ResponseCodeKind::AuthFail) | Some(Tss2ResponseCodeKind::BadAuth) => {
                return AuthFailure::WrongPin.into()
            }
            Some(Tss2ResponseCodeKind::Lockout) => return AuthFailure::Lockout.into(),
            _ => {}
        }
    }
    err.into()
}

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const MAX_HANDLES_PER_CALL: u32 = 80;

static CONTEXT: OnceCell<Mutex<tss_esapi::Context>> = OnceCell::new();

pub fn get_context(tcti: &str) -> Result<InitialContext> {
    let context = CONTEXT.get_or_try_init(|| {
        let conf = TctiNameConf::from_str(tcti)?;
        log::debug!("TCTI config {:?}", conf);
        Ok::<_, TpmError>(Mutex::new(tss_esapi::Context::new(conf)?))
    })?;
    let ctx = context.lock().map_err(|_| TpmError::ContextPoisoned)?;
    let mut ctx = Ctx {
        ctx,
        state: Initial {},
    };
    ctx.flush_transient()?;
    Ok(ctx)
}

fn persistent_handle(handle: PersistentHandle) -> Result<PersistentTpmHandle> {
    Ok(PersistentTpmHandle::new(handle.raw())?)
}

fn auth(pin: &Pin) -> Result<Auth> {
    Ok(Auth::try_from(pin.as_bytes().to_vec())?)
}

/// Sealed-key store backed by libtss2-esys.
#[derive(Debug, Clone)]
pub struct EsapiStore {
    tcti: String,
}

impl EsapiStore {
    pub fn new(tcti: impl Into<String>) -> Self {
        Self { tcti: tcti.into() }
    }
}

impl SealedKeyStore for EsapiStore {
    fn seal(
        &mut self,
        path: &SealPath,
        secret: &SecretKey,
        policy: &SealingPolicy,
    ) -> Result<SealedObject> {
        if secret.len() > MAX_SEALED_SIZE {
            return Err(TpmError::SecretTooLarge(secret.len()));
        }
        let mut ctx = get_context(&self.tcti)?;
        let handle = PersistentHandle::first_free(path, &ctx.persistent_handles()?)?;

        let data = SensitiveData::try_from(secret.as_bytes().to_vec())?;
        let auth = policy.pin.as_ref().map(auth).transpose()?;
        ctx.create_primary()?
            .with_policy(policy)?
            .seal(data, auth, persistent_handle(handle)?)?;

        let sealed = SealedObject::new(path.clone(), handle);
        log::info!("Sealed random key at {}", sealed);
        Ok(sealed)
    }

    fn unseal(
        &mut self,
        sealed: &SealedObject,
        pcrs: &PcrSelection,
        pin: Option<&Pin>,
    ) -> Result<SecretKey> {
        let handle = persistent_handle(sealed.handle)?;
        let mut ctx = get_context(&self.tcti)?;
        if !ctx.persistent_exists(handle) {
            return Err(TpmError::NotFound(sealed.clone()));
        }
        let pin = pin.map(auth).transpose()?;
        let data = ctx
            .policy_auth(PcrSelectionList::try_from(pcrs)?, pin.is_some())?
            .unseal(handle, pin)?;
        Ok(SecretKey::from_bytes(data.value().to_vec()))
    }

    fn exists(&mut self, sealed: &SealedObject) -> Result<bool> {
        let handle = persistent_handle(sealed.handle)?;
        Ok(get_context(&self.tcti)?.persistent_exists(handle))
    }

    fn remove(&mut self, sealed: &SealedObject) -> Result<()> {
        let handle = persistent_handle(sealed.handle)?;
        let mut ctx = get_context(&self.tcti)?;
        if !ctx.persistent_exists(handle) {
            return Err(TpmError::NotFound(sealed.clone()));
        }
        ctx.remove(handle)?;
        log::info!("Evicted sealed object {}", sealed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::pcr::PcrSelection;
    use eyre::Result;

    // Needs a TPM or simulator reachable through $TCTI
    #[test]
    #[ignore]
    fn seal_unseal() -> Result<()> {
        let tcti = std::env::var("TCTI").unwrap_or_else(|_| "device:/dev/tpmrm0".to_owned());
        let mut store = EsapiStore::new(tcti);
        let path = SealPath::from("/HS/SRK/luks_disk_esapi_test");
        let data = SecretKey::from_bytes("Howdy".as_bytes().to_vec());
        let pin = Pin::new("1234");
        let policy = SealingPolicy::new(PcrSelection::default(), Some(pin.clone()));

        let sealed = store.seal(&path, &data, &policy)?;
        assert!(store.exists(&sealed)?);

        let unsealed = store.unseal(&sealed, &policy.pcrs, Some(&pin))?;
        assert_eq!(data, unsealed);

        let wrong = store
            .unseal(&sealed, &policy.pcrs, Some(&Pin::new("4321")))
            .unwrap_err();
        assert_eq!(wrong.auth_failure(), Some(AuthFailure::WrongPin));

        store.remove(&sealed)?;
        assert!(!store.exists(&sealed)?);
        Ok(())
    }
}
