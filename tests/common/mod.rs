#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tpm_disk::config::{Config, DiskSize};
use tpm_disk::disk::DiskManager;
use tpm_disk::key::SecretKey;
use tpm_disk::luks::{
    unseal_token_key, Closed, CryptoContainer, LuksError, Result as LuksResult, SealedKeyToken,
};
use tpm_disk::mount::{MountError, Mounter, Result as MountResult, Unmounted};
use tpm_disk::pin::{PinPrompt, ScriptedPins};
use tpm_disk::tpm::soft::SoftTpm;
use tpm_disk::tpm::SealedKeyStore;

const HEADER: &[u8] = b"FAKE-LUKS2";

#[derive(Debug)]
struct Volume {
    secret: SecretKey,
    token: Option<SealedKeyToken>,
}

/// Crypto container keeping LUKS state in memory. Activating a mapping writes
/// a "device node" file under `mapper_dir` naming the image it maps.
#[derive(Debug)]
pub struct FakeContainer {
    mapper_dir: PathBuf,
    volumes: HashMap<PathBuf, Volume>,
    active: HashMap<String, PathBuf>,
    pub fail_format: bool,
    pub fail_add_token: bool,
}

impl FakeContainer {
    pub fn new(mapper_dir: impl Into<PathBuf>) -> Self {
        Self {
            mapper_dir: mapper_dir.into(),
            volumes: HashMap::new(),
            active: HashMap::new(),
            fail_format: false,
            fail_add_token: false,
        }
    }

    pub fn has_token(&self, image: &Path) -> bool {
        self.volumes
            .get(image)
            .map_or(false, |volume| volume.token.is_some())
    }

    pub fn is_formatted(&self, image: &Path) -> bool {
        self.volumes.contains_key(image)
    }

    pub fn active_mappers(&self) -> HashSet<String> {
        self.active.keys().cloned().collect()
    }

    fn failure(action: &'static str) -> LuksError {
        LuksError::Command {
            action,
            status: 1,
            diagnostic: "injected failure".to_owned(),
        }
    }

    fn activate(&mut self, image: &Path, mapper: &str) -> LuksResult<PathBuf> {
        if self.active.contains_key(mapper) {
            return Err(LuksError::Command {
                action: "open",
                status: 5,
                diagnostic: format!("Device {} already exists.", mapper),
            });
        }
        fs::create_dir_all(&self.mapper_dir)?;
        let device = self.device(mapper);
        fs::write(&device, image.to_string_lossy().as_bytes())?;
        self.active.insert(mapper.to_owned(), image.to_owned());
        Ok(device)
    }
}

impl CryptoContainer for FakeContainer {
    fn format(&mut self, image: &Path, secret: &SecretKey) -> LuksResult<()> {
        if self.fail_format {
            return Err(Self::failure("luksFormat"));
        }
        fs::write(image, HEADER)?;
        self.volumes.insert(
            image.to_owned(),
            Volume {
                secret: secret.clone(),
                token: None,
            },
        );
        Ok(())
    }

    fn add_token(&mut self, image: &Path, token: &SealedKeyToken, secret: &SecretKey) -> LuksResult<()> {
        if self.fail_add_token {
            return Err(Self::failure("token import"));
        }
        let volume = self
            .volumes
            .get_mut(image)
            .filter(|volume| volume.secret == *secret)
            .ok_or_else(|| LuksError::NoMatchingKeyslot(image.to_owned()))?;
        volume.token = Some(token.clone().with_keyslot("0"));
        Ok(())
    }

    fn open(
        &mut self,
        image: &Path,
        mapper: &str,
        store: &mut dyn SealedKeyStore,
        pins: &mut dyn PinPrompt,
    ) -> LuksResult<PathBuf> {
        let token = self
            .volumes
            .get(image)
            .and_then(|volume| volume.token.clone())
            .ok_or_else(|| LuksError::TokenMissing(image.to_owned()))?;
        let secret = unseal_token_key(&token, store, pins)?;
        self.open_with_key(image, mapper, &secret)
    }

    fn open_with_key(&mut self, image: &Path, mapper: &str, secret: &SecretKey) -> LuksResult<PathBuf> {
        match self.volumes.get(image) {
            Some(volume) if volume.secret == *secret => self.activate(image, mapper),
            _ => Err(LuksError::NoMatchingKeyslot(image.to_owned())),
        }
    }

    fn close(&mut self, mapper: &str) -> LuksResult<Closed> {
        match self.active.remove(mapper) {
            Some(_) => {
                fs::remove_file(self.device(mapper))?;
                Ok(Closed::Closed)
            }
            None => Ok(Closed::NotActive),
        }
    }

    fn is_active(&mut self, mapper: &str) -> LuksResult<bool> {
        Ok(self.active.contains_key(mapper))
    }

    fn device(&self, mapper: &str) -> PathBuf {
        self.mapper_dir.join(mapper)
    }
}

/// Mounter whose "filesystems" are directories under `volumes_dir`, one per
/// image. Mounting moves the files into the mount point and unmounting moves
/// them back, so content survives a close/open cycle.
#[derive(Debug)]
pub struct FakeMounter {
    volumes_dir: PathBuf,
    mounted: HashMap<PathBuf, PathBuf>,
    pub fail_mount: bool,
    pub fail_mkfs: bool,
    pub handed_over: Vec<PathBuf>,
}

impl FakeMounter {
    pub fn new(volumes_dir: impl Into<PathBuf>) -> Self {
        Self {
            volumes_dir: volumes_dir.into(),
            mounted: HashMap::new(),
            fail_mount: false,
            fail_mkfs: false,
            handed_over: Vec::new(),
        }
    }

    fn backing_dir(&self, device: &Path) -> MountResult<PathBuf> {
        let image = fs::read_to_string(device)?;
        let stem = Path::new(&image)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.volumes_dir.join(stem))
    }

    pub fn mount_count(&self) -> usize {
        self.mounted.len()
    }
}

fn move_entries(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        fs::rename(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

impl Mounter for FakeMounter {
    fn make_filesystem(&mut self, device: &Path) -> MountResult<()> {
        if self.fail_mkfs {
            return Err(MountError::Command {
                tool: "mkfs.ext4".to_owned(),
                status: 1,
                diagnostic: "injected failure".to_owned(),
            });
        }
        let backing = self.backing_dir(device)?;
        if backing.exists() {
            fs::remove_dir_all(&backing)?;
        }
        fs::create_dir_all(&backing)?;
        Ok(())
    }

    fn mount(&mut self, device: &Path, target: &Path) -> MountResult<()> {
        if self.fail_mount {
            return Err(MountError::Command {
                tool: "mount".to_owned(),
                status: 32,
                diagnostic: "injected failure".to_owned(),
            });
        }
        let backing = self.backing_dir(device)?;
        move_entries(&backing, target)?;
        self.mounted.insert(target.to_owned(), backing);
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> MountResult<Unmounted> {
        match self.mounted.remove(target) {
            Some(backing) => {
                move_entries(target, &backing)?;
                Ok(Unmounted::Unmounted)
            }
            None => Ok(Unmounted::NotMounted),
        }
    }

    fn is_mounted(&mut self, target: &Path) -> MountResult<bool> {
        Ok(self.mounted.contains_key(target))
    }

    fn hand_over(&mut self, target: &Path) -> MountResult<()> {
        self.handed_over.push(target.to_owned());
        Ok(())
    }
}

pub type TestManager = DiskManager<SoftTpm, FakeContainer, FakeMounter, ScriptedPins>;

pub struct Fixture {
    pub dir: TempDir,
    pub disks: TestManager,
}

impl Fixture {
    pub fn new() -> eyre::Result<Self> {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> eyre::Result<Self> {
        let dir = tempfile::tempdir()?;
        let base_dir = dir.path().join("disks");
        let mut config = Config {
            base_dir,
            disk_size: DiskSize::from_bytes(32 * 1024 * 1024),
            ..Config::default()
        };
        adjust(&mut config);

        let disks = DiskManager::new(
            config,
            SoftTpm::new(),
            FakeContainer::new(dir.path().join("mapper")),
            FakeMounter::new(dir.path().join("volumes")),
            ScriptedPins::default(),
        );
        Ok(Self { dir, disks })
    }

    pub fn base_dir(&self) -> PathBuf {
        self.disks.config().base_dir.clone()
    }

    pub fn image(&self, name: &str) -> PathBuf {
        self.base_dir().join(format!("{}.img", name))
    }

    pub fn mount_point(&self, name: &str) -> PathBuf {
        self.base_dir().join(name)
    }
}
