//! Runtime configuration.
//!
//! Read from the YAML file named by `$TPM_DISK_CONFIG`, else `./tpm-disk.yaml`
//! when present, else built-in defaults. Every field is optional.

use crate::tpm::pcr::PcrSelection;
use crate::tpm::MAX_SEALED_SIZE;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "TPM_DISK_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "tpm-disk.yaml";
pub const TCTI_ENV_VAR: &str = "TCTI";

/// Smallest image LUKS2 metadata plus a filesystem fit in.
pub const MIN_DISK_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid disk size `{0}`, expected e.g. 100M or 2G")]
    DiskSize(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

/// Image size in bytes, written as a number with an optional K/M/G/T suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DiskSize(u64);

impl DiskSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl Default for DiskSize {
    fn default() -> Self {
        Self(100 * 1024 * 1024)
    }
}

impl FromStr for DiskSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let invalid = || ConfigError::DiskSize(s.to_owned());
        let (digits, shift) = match trimmed.char_indices().last() {
            Some((i, c)) if c.is_ascii_alphabetic() => {
                let shift = match c.to_ascii_uppercase() {
                    'K' => 10,
                    'M' => 20,
                    'G' => 30,
                    'T' => 40,
                    _ => return Err(invalid()),
                };
                (&trimmed[..i], shift)
            }
            _ => (trimmed, 0),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        value
            .checked_mul(1u64 << shift)
            .map(Self)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for DiskSize {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DiskSize> for String {
    fn from(size: DiskSize) -> Self {
        size.to_string()
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (suffix, shift) in [("T", 40), ("G", 30), ("M", 20), ("K", 10)] {
            let unit = 1u64 << shift;
            if self.0 >= unit && self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// tpm2-tools subprocesses.
    #[default]
    Tools,
    /// libtss2-esys through tss-esapi; needs the `tpm2` feature.
    Esapi,
}

/// Locations of the external programs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Binaries {
    pub cryptsetup: PathBuf,
    pub mount: PathBuf,
    pub umount: PathBuf,
    /// `mkfs.` so that the filesystem name completes it.
    pub mkfs_prefix: String,
    /// Directory holding the `tpm2_*` tools; searched on `PATH` when unset.
    pub tpm2_tools_dir: Option<PathBuf>,
    pub mapper_dir: PathBuf,
    pub mounts_table: PathBuf,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            cryptsetup: PathBuf::from("cryptsetup"),
            mount: PathBuf::from("mount"),
            umount: PathBuf::from("umount"),
            mkfs_prefix: "mkfs.".to_owned(),
            tpm2_tools_dir: None,
            mapper_dir: PathBuf::from("/dev/mapper"),
            mounts_table: PathBuf::from("/proc/mounts"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `<name>.img` and `<name>/`.
    pub base_dir: PathBuf,
    pub disk_size: DiskSize,
    /// Random key length in bytes.
    pub key_size: usize,
    pub seal_path_prefix: String,
    pub pcrs: PcrSelection,
    pub mapper_prefix: String,
    pub filesystem: String,
    pub backend: Backend,
    pub tcti: String,
    /// Undo completed create steps when a later one fails.
    pub rollback_on_failure: bool,
    pub binaries: Binaries,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            disk_size: DiskSize::default(),
            key_size: 64,
            seal_path_prefix: "/HS/SRK/luks_disk_".to_owned(),
            pcrs: PcrSelection::default(),
            mapper_prefix: "tpmcrypt_".to_owned(),
            filesystem: "ext4".to_owned(),
            backend: Backend::default(),
            tcti: "device:/dev/tpmrm0".to_owned(),
            rollback_on_failure: false,
            binaries: Binaries::default(),
        }
    }
}

impl Config {
    /// Loads from the environment-selected file, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::resolve(
            env::var_os(CONFIG_ENV_VAR).map(PathBuf::from),
            Path::new("."),
            env::var(TCTI_ENV_VAR).ok(),
        )
    }

    /// `explicit` if given, else [`DEFAULT_CONFIG_FILE`] in `dir` if present,
    /// else defaults. `tcti` wins over whatever the file says.
    pub fn resolve(explicit: Option<PathBuf>, dir: &Path, tcti: Option<String>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path),
            None => {
                let local = dir.join(DEFAULT_CONFIG_FILE);
                local.exists().then_some(local)
            }
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        if let Some(tcti) = tcti {
            config.tcti = tcti;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        log::debug!("configuration from {}", path.display());
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_size == 0 || self.key_size > MAX_SEALED_SIZE {
            return Err(ConfigError::Invalid(format!(
                "key_size must be between 1 and {} bytes",
                MAX_SEALED_SIZE
            )));
        }
        if self.disk_size.bytes() < MIN_DISK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "disk_size {} is below the {} minimum",
                self.disk_size,
                DiskSize::from_bytes(MIN_DISK_SIZE)
            )));
        }
        if self.filesystem.is_empty() || self.filesystem.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "unusable filesystem `{}`",
                self.filesystem
            )));
        }
        if self.mapper_prefix.contains('/') {
            return Err(ConfigError::Invalid(
                "mapper_prefix must not contain `/`".to_owned(),
            ));
        }
        Ok(())
    }
}
