//! Disk lifecycle: create, open, close and list loopback images whose LUKS2
//! key is sealed in the TPM.
//!
//! A disk `<name>` is the image `<base_dir>/<name>.img`, the mount point
//! `<base_dir>/<name>/`, the device-mapper name `<mapper_prefix><name>` and
//! the sealed object `<seal_path_prefix><name>`. [`DiskManager`] drives the
//! sealed-key store, the crypto container and the mounter through their
//! traits, so each can be swapped out independently.

use crate::config::Config;
use crate::luks::{Closed, CryptoContainer};
use crate::mount::{Mounter, Unmounted};
use crate::pin::PinPrompt;
use crate::tpm::{SealedKeyStore, SealedObject};
use std::fs;
use std::path::{Path, PathBuf};

mod create;
pub mod error;
pub mod name;

pub use error::{DiskError, ErrorCategory, Result, Step, StepError};
pub use name::{DiskName, DiskPaths};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReport {
    pub name: DiskName,
    pub image: PathBuf,
    pub sealed: SealedObject,
    pub pin_protected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Unlocked and mounted.
    Opened,
    /// The mapping was already active; only the mount was missing.
    Remounted,
    AlreadyOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReport {
    pub name: DiskName,
    pub mount_point: PathBuf,
    pub device: PathBuf,
    pub outcome: OpenOutcome,
}

/// Conditions `close` tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftFailure {
    NotMounted,
    NotActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub name: DiskName,
    pub soft_failures: Vec<SoftFailure>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.soft_failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Absent,
    Closed,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStatus {
    pub name: String,
    pub image: PathBuf,
    pub state: DiskState,
}

pub struct DiskManager<S, C, M, P> {
    config: Config,
    store: S,
    container: C,
    mounter: M,
    pins: P,
}

impl<S, C, M, P> DiskManager<S, C, M, P>
where
    S: SealedKeyStore,
    C: CryptoContainer,
    M: Mounter,
    P: PinPrompt,
{
    pub fn new(config: Config, store: S, container: C, mounter: M, pins: P) -> Self {
        Self {
            config,
            store,
            container,
            mounter,
            pins,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn container(&self) -> &C {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut C {
        &mut self.container
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    pub fn mounter_mut(&mut self) -> &mut M {
        &mut self.mounter
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    pub fn paths(&self, name: &DiskName) -> DiskPaths {
        DiskPaths::new(&self.config, name)
    }

    /// Unlocks the disk through its token and mounts it at `<base_dir>/<name>/`.
    pub fn open(&mut self, name: &str) -> Result<OpenReport> {
        let name = DiskName::new(name)?;
        let paths = self.paths(&name);
        if !paths.image.is_file() {
            return Err(DiskError::NotFound(name.to_string()));
        }
        fs::create_dir_all(&paths.mount_point)?;

        let active = self
            .container
            .is_active(&paths.mapper)
            .map_err(|err| DiskError::external(Step::QueryState, &[], err))?;
        let device = self.container.device(&paths.mapper);

        let outcome = if active {
            let mounted = self
                .mounter
                .is_mounted(&paths.mount_point)
                .map_err(|err| DiskError::external(Step::QueryState, &[], err))?;
            if mounted {
                log::info!("{} is already open at {}", name, paths.mount_point.display());
                return Ok(OpenReport {
                    name,
                    mount_point: paths.mount_point,
                    device,
                    outcome: OpenOutcome::AlreadyOpen,
                });
            }
            self.mounter
                .mount(&device, &paths.mount_point)
                .map_err(|err| DiskError::external(Step::Mount, &[], err))?;
            OpenOutcome::Remounted
        } else {
            if !dir_is_empty(&paths.mount_point)? {
                return Err(DiskError::MountPointBusy(paths.mount_point));
            }
            let mapped = self
                .container
                .open(&paths.image, &paths.mapper, &mut self.store, &mut self.pins)
                .map_err(|err| DiskError::external(Step::Unlock, &[], err))?;
            if let Err(err) = self.mounter.mount(&mapped, &paths.mount_point) {
                if let Err(close_err) = self.container.close(&paths.mapper) {
                    log::warn!("{} stays mapped after failed mount: {}", paths.mapper, close_err);
                }
                return Err(DiskError::external(Step::Mount, &[Step::Unlock], err));
            }
            OpenOutcome::Opened
        };

        if let Err(err) = self.mounter.hand_over(&paths.mount_point) {
            log::warn!("{}", err);
        }
        log::info!("{} mounted at {}", name, paths.mount_point.display());
        Ok(OpenReport {
            name,
            mount_point: paths.mount_point,
            device,
            outcome,
        })
    }

    /// Unmounts and closes. Repeating it on a closed disk succeeds with soft
    /// failures in the report.
    pub fn close(&mut self, name: &str) -> Result<CloseReport> {
        let name = DiskName::new(name)?;
        let paths = self.paths(&name);
        let mut soft_failures = Vec::new();

        let unmounted = if paths.mount_point.is_dir() {
            self.mounter
                .unmount(&paths.mount_point)
                .map_err(|err| DiskError::external(Step::Unmount, &[], err))?
        } else {
            Unmounted::NotMounted
        };
        if unmounted == Unmounted::NotMounted {
            log::warn!("{} was not mounted", paths.mount_point.display());
            soft_failures.push(SoftFailure::NotMounted);
        }

        let completed: &[Step] = match unmounted {
            Unmounted::Unmounted => &[Step::Unmount],
            Unmounted::NotMounted => &[],
        };
        let closed = self
            .container
            .close(&paths.mapper)
            .map_err(|err| DiskError::external(Step::Close, completed, err))?;
        if closed == Closed::NotActive {
            log::warn!("{} was not active", paths.mapper);
            soft_failures.push(SoftFailure::NotActive);
        }

        Ok(CloseReport {
            name,
            soft_failures,
        })
    }

    /// Every `*.img` in the base directory, sorted by name. Images whose
    /// stem is not a valid disk name are listed as closed under that stem.
    pub fn list(&mut self) -> Result<Vec<DiskStatus>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(&self.config.base_dir)? {
            let path = entry?.path();
            let is_image =
                path.extension().and_then(|e| e.to_str()) == Some(name::IMAGE_EXTENSION);
            if !is_image || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                images.push((stem.to_string_lossy().into_owned(), path));
            }
        }
        images.sort();

        let mut disks = Vec::with_capacity(images.len());
        for (stem, image) in images {
            let state = match DiskName::new(&stem) {
                Ok(name) => {
                    let mapper = self.paths(&name).mapper;
                    self.mapped_state(&mapper)?
                }
                Err(err) => {
                    log::warn!("{} cannot be managed: {}", image.display(), err);
                    DiskState::Closed
                }
            };
            disks.push(DiskStatus {
                name: stem,
                image,
                state,
            });
        }
        Ok(disks)
    }

    pub fn status(&mut self, name: &str) -> Result<DiskState> {
        let name = DiskName::new(name)?;
        let paths = self.paths(&name);
        if !paths.image.is_file() {
            return Ok(DiskState::Absent);
        }
        self.mapped_state(&paths.mapper)
    }

    fn mapped_state(&mut self, mapper: &str) -> Result<DiskState> {
        let active = self
            .container
            .is_active(mapper)
            .map_err(|err| DiskError::external(Step::QueryState, &[], err))?;
        Ok(match active {
            true => DiskState::Open,
            false => DiskState::Closed,
        })
    }
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir)?.next().is_none())
}
