//! [`CryptoContainer`] backed by the `cryptsetup` binary.
//!
//! All key material goes over stdin (`--key-file -`), never through argv.

use super::{
    unseal_token_key, Closed, CryptoContainer, LuksError, Result, SealedKeyToken, TOKEN_TYPE,
};
use crate::key::SecretKey;
use crate::pin::PinPrompt;
use crate::process::{Invocation, Output};
use crate::tpm::SealedKeyStore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAPPER_DIR: &str = "/dev/mapper";

#[derive(Debug, Clone)]
pub struct Cryptsetup {
    binary: PathBuf,
    mapper_dir: PathBuf,
}

/// The part of `luksDump --dump-json-metadata` we read.
#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    tokens: BTreeMap<String, serde_json::Value>,
}

impl Cryptsetup {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            mapper_dir: PathBuf::from(DEFAULT_MAPPER_DIR),
        }
    }

    pub fn with_mapper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mapper_dir = dir.into();
        self
    }

    fn command<'a>(&self) -> Invocation<'a> {
        Invocation::new(&self.binary)
    }

    fn check(action: &'static str, out: Output) -> Result<Output> {
        if out.success() {
            return Ok(out);
        }
        Err(LuksError::Command {
            action,
            status: out.status,
            diagnostic: out.diagnostic(),
        })
    }

    /// Keyslot that `secret` unlocks.
    fn keyslot_for(&self, image: &Path, secret: &SecretKey) -> Result<u32> {
        let out = self
            .command()
            .args(["open", "--test-passphrase", "--verbose", "--key-file", "-"])
            .arg(image)
            .stdin(secret.as_bytes())
            .run()?;
        if !out.success() {
            return Err(LuksError::NoMatchingKeyslot(image.to_owned()));
        }
        let text = format!("{}\n{}", out.stdout_lossy(), out.stderr);
        parse_unlocked_keyslot(&text).ok_or_else(|| LuksError::NoMatchingKeyslot(image.to_owned()))
    }

    fn read_token(&self, image: &Path) -> Result<Option<SealedKeyToken>> {
        let out = Self::check(
            "luksDump",
            self.command()
                .args(["luksDump", "--dump-json-metadata"])
                .arg(image)
                .run()?,
        )?;
        find_token(&out.stdout)
    }

    fn activate(
        &self,
        image: &Path,
        mapper: &str,
        keyslot: Option<&str>,
        secret: &SecretKey,
    ) -> Result<PathBuf> {
        let mut open = self.command().args(["open", "--type", "luks2", "--batch-mode"]);
        if let Some(slot) = keyslot {
            open = open.args(["--key-slot", slot]);
        }
        let out = open
            .args(["--key-file", "-"])
            .arg(image)
            .arg(mapper)
            .stdin(secret.as_bytes())
            .run()?;
        Self::check("open", out)?;
        log::info!("Activated {} as {}", image.display(), mapper);
        Ok(self.device(mapper))
    }
}

/// Finds `Key slot N unlocked.` in verbose cryptsetup output.
fn parse_unlocked_keyslot(text: &str) -> Option<u32> {
    text.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Key slot ")?;
        let (slot, tail) = rest.split_once(' ')?;
        if !tail.starts_with("unlocked") {
            return None;
        }
        slot.parse().ok()
    })
}

fn find_token(metadata: &[u8]) -> Result<Option<SealedKeyToken>> {
    let metadata: Metadata = serde_json::from_slice(metadata)?;
    for (id, token) in metadata.tokens {
        if token.get("type").and_then(|t| t.as_str()) != Some(TOKEN_TYPE) {
            continue;
        }
        log::debug!("using token {}", id);
        return Ok(Some(serde_json::from_value(token)?));
    }
    Ok(None)
}

fn close_outcome(out: &Output) -> Option<Closed> {
    if out.success() {
        return Some(Closed::Closed);
    }
    let lower = out.diagnostic().to_ascii_lowercase();
    if lower.contains("doesn't exist")
        || lower.contains("does not exist")
        || lower.contains("not active")
    {
        return Some(Closed::NotActive);
    }
    None
}

impl CryptoContainer for Cryptsetup {
    fn format(&mut self, image: &Path, secret: &SecretKey) -> Result<()> {
        let out = self
            .command()
            .args(["luksFormat", "--type", "luks2", "--batch-mode", "--key-file", "-"])
            .arg(image)
            .stdin(secret.as_bytes())
            .run()?;
        Self::check("luksFormat", out)?;
        log::info!("Formatted {} as LUKS2", image.display());
        Ok(())
    }

    fn add_token(&mut self, image: &Path, token: &SealedKeyToken, secret: &SecretKey) -> Result<()> {
        let slot = self.keyslot_for(image, secret)?;
        let token = token.clone().with_keyslot(slot.to_string());
        let json = serde_json::to_vec(&token)?;
        let out = self
            .command()
            .args(["token", "import"])
            .arg(image)
            .stdin(&json)
            .run()?;
        Self::check("token import", out)?;
        log::info!("Bound {} token to keyslot {} of {}", TOKEN_TYPE, slot, image.display());
        Ok(())
    }

    fn open(
        &mut self,
        image: &Path,
        mapper: &str,
        store: &mut dyn SealedKeyStore,
        pins: &mut dyn PinPrompt,
    ) -> Result<PathBuf> {
        let token = self
            .read_token(image)?
            .ok_or_else(|| LuksError::TokenMissing(image.to_owned()))?;
        let secret = unseal_token_key(&token, store, pins)?;
        self.activate(image, mapper, token.keyslot(), &secret)
    }

    fn open_with_key(&mut self, image: &Path, mapper: &str, secret: &SecretKey) -> Result<PathBuf> {
        self.activate(image, mapper, None, secret)
    }

    fn close(&mut self, mapper: &str) -> Result<Closed> {
        let out = self.command().args(["close", mapper]).run()?;
        match close_outcome(&out) {
            Some(outcome) => Ok(outcome),
            None => Err(LuksError::Command {
                action: "close",
                status: out.status,
                diagnostic: out.diagnostic(),
            }),
        }
    }

    fn is_active(&mut self, mapper: &str) -> Result<bool> {
        if self.device(mapper).exists() {
            return Ok(true);
        }
        let out = self.command().args(["status", mapper]).run()?;
        Ok(out.success())
    }

    fn device(&self, mapper: &str) -> PathBuf {
        self.mapper_dir.join(mapper)
    }
}
