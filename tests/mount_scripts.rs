//! Runs [`SystemMounter`] against shell scripts standing in for mkfs, mount
//! and umount. The fake mount keeps its own mounts table.

use eyre::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;
use tpm_disk::mount::{MountError, Mounter, SystemMounter, Unmounted};

const TOOLS: &[&str] = &["mkfs.ext4", "mount", "umount"];

const SCRIPT: &str = r#"#!/bin/sh
state="@STATE@"
tool="$(basename "$0")"
echo "$tool $*" >> "$state/calls"

case "$tool" in
mkfs.*)
    if [ -f "$state/fail_mkfs" ]; then
        echo "mkfs: $2 is apparently in use by the system" >&2
        exit 1
    fi
    ;;
mount)
    echo "$1 $2 ext4 rw,relatime 0 0" >> "$state/mounts"
    ;;
umount)
    grep -v " $1 " "$state/mounts" > "$state/mounts.new"
    mv "$state/mounts.new" "$state/mounts"
    ;;
esac
"#;

struct FakeTools {
    _dir: TempDir,
    root: PathBuf,
}

impl FakeTools {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = fs::canonicalize(dir.path())?;
        let state = root.join("state");
        let bin = root.join("bin");
        fs::create_dir(&state)?;
        fs::create_dir(&bin)?;
        fs::create_dir(root.join("target"))?;
        fs::write(state.join("mounts"), "proc /proc proc rw 0 0\n")?;
        let script = SCRIPT.replace("@STATE@", &state.to_string_lossy());
        for tool in TOOLS {
            let path = bin.join(tool);
            fs::write(&path, &script)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(Self { _dir: dir, root })
    }

    fn mounter(&self) -> SystemMounter {
        let bin = self.root.join("bin");
        SystemMounter {
            filesystem: "ext4".to_owned(),
            mount: bin.join("mount"),
            umount: bin.join("umount"),
            mkfs_prefix: format!("{}/mkfs.", bin.display()),
            mounts_table: self.root.join("state").join("mounts"),
        }
    }

    fn device(&self) -> PathBuf {
        self.root.join("tpmcrypt_vault")
    }

    fn target(&self) -> PathBuf {
        self.root.join("target")
    }

    fn calls(&self) -> Result<Vec<String>> {
        Ok(fs::read_to_string(self.root.join("state").join("calls"))?
            .lines()
            .map(str::to_owned)
            .collect())
    }
}

#[test]
fn argument_shapes() -> Result<()> {
    let fake = FakeTools::new()?;
    let mut mounter = fake.mounter();
    let device = fake.device();
    let target = fake.target();

    mounter.make_filesystem(&device)?;
    mounter.mount(&device, &target)?;
    assert!(mounter.is_mounted(&target)?);
    assert_eq!(mounter.unmount(&target)?, Unmounted::Unmounted);
    assert!(!mounter.is_mounted(&target)?);

    assert_eq!(
        fake.calls()?,
        [
            format!("mkfs.ext4 -q {}", device.display()),
            format!("mount {} {}", device.display(), target.display()),
            format!("umount {}", target.display()),
        ]
    );
    Ok(())
}

#[test]
fn unmounting_twice_is_soft() -> Result<()> {
    let fake = FakeTools::new()?;
    let mut mounter = fake.mounter();
    mounter.mount(&fake.device(), &fake.target())?;

    assert_eq!(mounter.unmount(&fake.target())?, Unmounted::Unmounted);
    assert_eq!(mounter.unmount(&fake.target())?, Unmounted::NotMounted);
    // The second call never reaches umount.
    let umounts = fake
        .calls()?
        .iter()
        .filter(|call| call.starts_with("umount"))
        .count();
    assert_eq!(umounts, 1);
    Ok(())
}

#[test]
fn failing_mkfs_reports_its_diagnostic() -> Result<()> {
    let fake = FakeTools::new()?;
    fs::write(fake.root.join("state").join("fail_mkfs"), "")?;
    let mut mounter = fake.mounter();

    let err = mounter.make_filesystem(&fake.device()).unwrap_err();
    match err {
        MountError::Command {
            tool,
            status,
            diagnostic,
        } => {
            assert!(tool.ends_with("mkfs.ext4"));
            assert_eq!(status, 1);
            assert!(diagnostic.contains("apparently in use"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}
