//! Filesystem initialisation and mounting of opened disks.

use crate::process::{Invocation, Output};
use nix::unistd::{chown, getgid, getuid, Gid, Uid};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MOUNTS_TABLE: &str = "/proc/mounts";

#[derive(Error, Debug)]
pub enum MountError {
    #[error("{tool} failed: {diagnostic} (exit code {status})")]
    Command {
        tool: String,
        status: i32,
        diagnostic: String,
    },
    #[error("failed to hand {} to uid {uid}: {source}", .path.display())]
    HandOver {
        path: PathBuf,
        uid: u32,
        source: nix::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = MountError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmounted {
    Unmounted,
    NotMounted,
}

pub trait Mounter {
    fn make_filesystem(&mut self, device: &Path) -> Result<()>;

    fn mount(&mut self, device: &Path, target: &Path) -> Result<()>;

    fn unmount(&mut self, target: &Path) -> Result<Unmounted>;

    fn is_mounted(&mut self, target: &Path) -> Result<bool>;

    /// Gives the mounted filesystem's root to the user who invoked the tool.
    fn hand_over(&mut self, target: &Path) -> Result<()>;
}

impl<T: Mounter + ?Sized> Mounter for Box<T> {
    fn make_filesystem(&mut self, device: &Path) -> Result<()> {
        (**self).make_filesystem(device)
    }

    fn mount(&mut self, device: &Path, target: &Path) -> Result<()> {
        (**self).mount(device, target)
    }

    fn unmount(&mut self, target: &Path) -> Result<Unmounted> {
        (**self).unmount(target)
    }

    fn is_mounted(&mut self, target: &Path) -> Result<bool> {
        (**self).is_mounted(target)
    }

    fn hand_over(&mut self, target: &Path) -> Result<()> {
        (**self).hand_over(target)
    }
}

/// Mounts with the util-linux binaries and formats with `mkfs.<filesystem>`.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    pub filesystem: String,
    pub mount: PathBuf,
    pub umount: PathBuf,
    pub mkfs_prefix: String,
    pub mounts_table: PathBuf,
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self {
            filesystem: "ext4".to_owned(),
            mount: PathBuf::from("mount"),
            umount: PathBuf::from("umount"),
            mkfs_prefix: "mkfs.".to_owned(),
            mounts_table: PathBuf::from(DEFAULT_MOUNTS_TABLE),
        }
    }
}

impl SystemMounter {
    fn check(tool: &Path, out: Output) -> Result<Output> {
        if out.success() {
            return Ok(out);
        }
        Err(MountError::Command {
            tool: tool.display().to_string(),
            status: out.status,
            diagnostic: out.diagnostic(),
        })
    }
}

impl Mounter for SystemMounter {
    fn make_filesystem(&mut self, device: &Path) -> Result<()> {
        let mkfs = PathBuf::from(format!("{}{}", self.mkfs_prefix, self.filesystem));
        let out = Invocation::new(&mkfs).arg("-q").arg(device).run()?;
        Self::check(&mkfs, out)?;
        log::info!("Created {} filesystem on {}", self.filesystem, device.display());
        Ok(())
    }

    fn mount(&mut self, device: &Path, target: &Path) -> Result<()> {
        let out = Invocation::new(&self.mount).arg(device).arg(target).run()?;
        Self::check(&self.mount, out)?;
        log::info!("Mounted {} at {}", device.display(), target.display());
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<Unmounted> {
        if !self.is_mounted(target)? {
            return Ok(Unmounted::NotMounted);
        }
        let out = Invocation::new(&self.umount).arg(target).run()?;
        Self::check(&self.umount, out)?;
        Ok(Unmounted::Unmounted)
    }

    fn is_mounted(&mut self, target: &Path) -> Result<bool> {
        let table = fs::read_to_string(&self.mounts_table)?;
        let target = fs::canonicalize(target).unwrap_or_else(|_| target.to_owned());
        let mounted = mount_points(&table).any(|point| point == target);
        Ok(mounted)
    }

    fn hand_over(&mut self, target: &Path) -> Result<()> {
        let (uid, gid) = invoking_owner();
        chown(target, Some(uid), Some(gid)).map_err(|source| MountError::HandOver {
            path: target.to_owned(),
            uid: uid.as_raw(),
            source,
        })?;
        log::debug!("{} now owned by {}:{}", target.display(), uid, gid);
        Ok(())
    }
}

/// `SUDO_UID`/`SUDO_GID` when run through sudo, otherwise the real ids.
pub fn invoking_owner() -> (Uid, Gid) {
    owner_from(
        std::env::var("SUDO_UID").ok().as_deref(),
        std::env::var("SUDO_GID").ok().as_deref(),
        getuid(),
        getgid(),
    )
}

fn owner_from(sudo_uid: Option<&str>, sudo_gid: Option<&str>, uid: Uid, gid: Gid) -> (Uid, Gid) {
    let uid = sudo_uid
        .and_then(|v| v.parse().ok())
        .map(Uid::from_raw)
        .unwrap_or(uid);
    let gid = sudo_gid
        .and_then(|v| v.parse().ok())
        .map(Gid::from_raw)
        .unwrap_or(gid);
    (uid, gid)
}

/// Mount point column of a mounts table.
fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        fields.next().map(|point| PathBuf::from(unescape_mount_field(point)))
    })
}

/// Undoes the octal escapes (`\040` for space etc.) the kernel applies.
fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(char::from(value)),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}
