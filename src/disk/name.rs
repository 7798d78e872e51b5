use super::error::DiskError;
use crate::config::Config;
use crate::tpm::SealPath;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const MAX_NAME_LEN: usize = 64;
pub const IMAGE_EXTENSION: &str = "img";

/// A disk name that is safe to use as a file name, a device-mapper name and a
/// seal path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskName(String);

impl DiskName {
    pub fn new(name: &str) -> Result<Self, DiskError> {
        let invalid = |reason: &str| DiskError::InvalidName {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };
        if name.is_empty() {
            return Err(invalid("it is empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(invalid("it is longer than 64 characters"));
        }
        if name.starts_with('.') {
            return Err(invalid("it starts with `.`"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("only ASCII letters, digits, `-`, `_` and `.` are allowed"));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DiskName {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for DiskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything derived from a disk name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPaths {
    pub image: PathBuf,
    pub mount_point: PathBuf,
    pub mapper: String,
    pub seal_path: SealPath,
}

impl DiskPaths {
    pub fn new(config: &Config, name: &DiskName) -> Self {
        Self {
            image: config
                .base_dir
                .join(format!("{}.{}", name, IMAGE_EXTENSION)),
            mount_point: config.base_dir.join(name.as_str()),
            mapper: format!("{}{}", config.mapper_prefix, name),
            seal_path: SealPath::new(&config.seal_path_prefix, name.as_str()),
        }
    }
}
