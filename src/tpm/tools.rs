//! Sealed-key store driving the tpm2-tools command line utilities.
//!
//! Each operation works inside a private temporary directory that holds the
//! primary key and session contexts, so nothing outlives the call. Sealed
//! objects are made persistent at the first handle `tpm2_getcap` does not
//! report as taken, searching from [`PersistentHandle::candidates`].

use super::pcr::PcrSelection;
use super::{
    AuthFailure, PersistentHandle, Result, SealPath, SealedKeyStore, SealedObject, SealingPolicy,
    TpmError, MAX_SEALED_SIZE,
};
use crate::key::SecretKey;
use crate::pin::Pin;
use crate::process::{Invocation, Output};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zeroize::Zeroizing;

const TCTI_ENV_VAR: &str = "TPM2TOOLS_TCTI";

#[derive(Debug, Clone)]
pub struct Tpm2Tools {
    dir: Option<PathBuf>,
    tcti: String,
}

impl Tpm2Tools {
    /// `dir` is where the `tpm2_*` binaries live; `None` searches `PATH`.
    pub fn new(dir: Option<PathBuf>, tcti: impl Into<String>) -> Self {
        Self {
            dir,
            tcti: tcti.into(),
        }
    }

    fn tool<'a>(&self, name: &str) -> Invocation<'a> {
        let program = match &self.dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        Invocation::new(program).env(TCTI_ENV_VAR, &self.tcti)
    }

    fn run(&self, name: &str, invocation: Invocation<'_>) -> Result<Output> {
        let out = invocation.run()?;
        if out.success() {
            return Ok(out);
        }
        Err(TpmError::Tool {
            tool: name.to_owned(),
            status: out.status,
            diagnostic: out.diagnostic(),
        })
    }

    fn workdir(&self) -> Result<TempDir> {
        Ok(tempfile::Builder::new().prefix("tpm-disk-").tempdir()?)
    }

    /// Persistent handles currently in use, whoever owns them.
    fn persistent_handles(&self) -> Result<BTreeSet<u32>> {
        let out = self.run(
            "tpm2_getcap",
            self.tool("tpm2_getcap").arg("handles-persistent"),
        )?;
        Ok(parse_handle_list(&out.stdout_lossy()))
    }

    fn create_primary(&self, context: &Path) -> Result<()> {
        self.run(
            "tpm2_createprimary",
            self.tool("tpm2_createprimary")
                .args(["-C", "o", "-g", "sha256", "-G", "ecc", "-c"])
                .arg(context),
        )?;
        Ok(())
    }

    /// Extends `session` with the PCR condition, plus PolicyAuthValue when a
    /// PIN is part of the policy. With `digest_out` the resulting policy
    /// digest is written there.
    fn apply_policy(
        &self,
        session: &Session<'_>,
        pcrs: &PcrSelection,
        with_pin: bool,
        digest_out: Option<&Path>,
    ) -> Result<()> {
        let mut policy_pcr = self
            .tool("tpm2_policypcr")
            .arg("-S")
            .arg(&session.context)
            .arg("-l")
            .arg(pcrs.to_string());
        if let Some(out) = digest_out {
            policy_pcr = policy_pcr.arg("-L").arg(out);
        }
        self.run("tpm2_policypcr", policy_pcr)?;

        if with_pin {
            let mut auth_value = self
                .tool("tpm2_policyauthvalue")
                .arg("-S")
                .arg(&session.context);
            if let Some(out) = digest_out {
                auth_value = auth_value.arg("-L").arg(out);
            }
            self.run("tpm2_policyauthvalue", auth_value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum SessionKind {
    Trial,
    Policy,
}

/// Session context file; the session is flushed when this goes out of scope.
struct Session<'a> {
    tools: &'a Tpm2Tools,
    context: PathBuf,
}

impl<'a> Session<'a> {
    fn start(tools: &'a Tpm2Tools, dir: &Path, kind: SessionKind) -> Result<Self> {
        let context = dir.join("session.ctx");
        let mut start = tools.tool("tpm2_startauthsession");
        if matches!(kind, SessionKind::Policy) {
            start = start.arg("--policy-session");
        }
        tools.run("tpm2_startauthsession", start.arg("-S").arg(&context))?;
        Ok(Self { tools, context })
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        let flush = self
            .tools
            .tool("tpm2_flushcontext")
            .arg(&self.context)
            .run();
        if let Err(err) = flush {
            log::warn!("failed to flush TPM session: {}", err);
        }
    }
}

/// Reads the `- 0x81000001` lines `tpm2_getcap handles-*` prints.
fn parse_handle_list(listing: &str) -> BTreeSet<u32> {
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix('-'))
        .filter_map(|item| {
            let item = item.trim();
            let digits = item.strip_prefix("0x").unwrap_or(item);
            u32::from_str_radix(digits, 16).ok()
        })
        .collect()
}

fn pin_auth(pin: &Pin) -> Zeroizing<String> {
    Zeroizing::new(format!("hex:{}", hex::encode(pin.as_bytes())))
}

/// Maps tpm2_unseal diagnostics to the policy failure they report.
pub(crate) fn classify_unseal_failure(diagnostic: &str) -> Option<AuthFailure> {
    let lower = diagnostic.to_ascii_lowercase();
    if lower.contains("lockout") || lower.contains("0x921") {
        return Some(AuthFailure::Lockout);
    }
    if lower.contains("policy_fail")
        || lower.contains("policy check failed")
        || lower.contains("0x99d")
        || lower.contains("pcr_changed")
    {
        return Some(AuthFailure::PlatformChanged);
    }
    if lower.contains("auth_fail")
        || lower.contains("bad_auth")
        || lower.contains("authorization hmac check failed")
        || lower.contains("0x98e")
        || lower.contains("0x9a2")
    {
        return Some(AuthFailure::WrongPin);
    }
    None
}

impl SealedKeyStore for Tpm2Tools {
    fn seal(
        &mut self,
        path: &SealPath,
        secret: &SecretKey,
        policy: &SealingPolicy,
    ) -> Result<SealedObject> {
        if secret.len() > MAX_SEALED_SIZE {
            return Err(TpmError::SecretTooLarge(secret.len()));
        }
        let handle = PersistentHandle::first_free(path, &self.persistent_handles()?)?;

        let work = self.workdir()?;
        let primary = work.path().join("primary.ctx");
        let digest = work.path().join("policy.digest");
        let public = work.path().join("seal.pub");
        let private = work.path().join("seal.priv");
        let object = work.path().join("seal.ctx");

        self.create_primary(&primary)?;
        {
            let session = Session::start(self, work.path(), SessionKind::Trial)?;
            self.apply_policy(&session, &policy.pcrs, policy.requires_pin(), Some(&digest))?;
        }

        let mut create = self
            .tool("tpm2_create")
            .arg("-C")
            .arg(&primary)
            .args(["-g", "sha256", "-a", "fixedtpm|fixedparent", "-L"])
            .arg(&digest)
            .arg("-u")
            .arg(&public)
            .arg("-r")
            .arg(&private)
            .args(["-i", "-"])
            .stdin(secret.as_bytes());
        if let Some(pin) = &policy.pin {
            create = create.arg("-p").secret_arg(pin_auth(pin).as_str());
        }
        self.run("tpm2_create", create)?;

        self.run(
            "tpm2_load",
            self.tool("tpm2_load")
                .arg("-C")
                .arg(&primary)
                .arg("-u")
                .arg(&public)
                .arg("-r")
                .arg(&private)
                .arg("-c")
                .arg(&object),
        )?;
        self.run(
            "tpm2_evictcontrol",
            self.tool("tpm2_evictcontrol")
                .args(["-C", "o", "-c"])
                .arg(&object)
                .arg(handle.to_string()),
        )?;

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
        let work = self.workdir()?;
        let session = Session::start(self, work.path(), SessionKind::Policy)?;
        self.apply_policy(&session, pcrs, pin.is_some(), None)?;

        let mut auth = Zeroizing::new(format!("session:{}", session.context.display()));
        if let Some(pin) = pin {
            auth.push('+');
            auth.push_str(&pin_auth(pin));
        }
        let out = self
            .tool("tpm2_unseal")
            .arg("-c")
            .arg(sealed.handle.to_string())
            .arg("-p")
            .secret_arg(auth.as_str())
            .run()?;

        if out.success() {
            return Ok(SecretKey::from_bytes(out.stdout));
        }
        let diagnostic = out.diagnostic();
        if let Some(failure) = classify_unseal_failure(&diagnostic) {
            return Err(failure.into());
        }
        Err(TpmError::Tool {
            tool: "tpm2_unseal".to_owned(),
            status: out.status,
            diagnostic,
        })
    }

    fn exists(&mut self, sealed: &SealedObject) -> Result<bool> {
        let out = self
            .tool("tpm2_readpublic")
            .arg("-c")
            .arg(sealed.handle.to_string())
            .run()?;
        Ok(out.success())
    }

    fn remove(&mut self, sealed: &SealedObject) -> Result<()> {
        if !self.exists(sealed)? {
            return Err(TpmError::NotFound(sealed.clone()));
        }
        self.run(
            "tpm2_evictcontrol",
            self.tool("tpm2_evictcontrol")
                .args(["-C", "o", "-c"])
                .arg(sealed.handle.to_string()),
        )?;
        log::info!("Evicted sealed object {}", sealed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_policy_failure() {
        let diagnostic = "WARNING:esys:src/tss2-esys/api/Esys_Unseal.c:295:Esys_Unseal_Finish() \
            Received TPM Error\nERROR: Esys_Unseal(0x99D) - tpm:session(1):a policy check failed";
        assert_eq!(
            classify_unseal_failure(diagnostic),
            Some(AuthFailure::PlatformChanged)
        );
    }

    #[test]
    fn classify_wrong_pin() {
        let diagnostic = "ERROR: Esys_Unseal(0x98E) - tpm:session(1):the authorization HMAC check failed and DA counter incremented";
        assert_eq!(
            classify_unseal_failure(diagnostic),
            Some(AuthFailure::WrongPin)
        );
    }

    #[test]
    fn classify_lockout() {
        let diagnostic = "ERROR: Esys_Unseal(0x921) - tpm:warn(2.0): authorizations for objects subject to DA protection are not allowed at this time because the TPM is in DA lockout mode";
        assert_eq!(classify_unseal_failure(diagnostic), Some(AuthFailure::Lockout));
    }

    #[test]
    fn unrelated_failure_is_not_an_auth_failure() {
        assert_eq!(
            classify_unseal_failure("ERROR: Esys_TR_FromTPMPublic(0x18B) - tpm:handle(1):the handle is not correct for the use"),
            None
        );
    }

    #[test]
    fn getcap_handle_listing() {
        let listing = "- 0x81000001\n- 0x810183a4\n  - 0x810183A5\n";
        assert_eq!(
            parse_handle_list(listing),
            BTreeSet::from([0x8100_0001, 0x8101_83a4, 0x8101_83a5])
        );
        assert!(parse_handle_list("").is_empty());
    }
}
