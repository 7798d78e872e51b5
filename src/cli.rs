use crate::config::{Backend, Config};
use crate::disk::{DiskManager, DiskState, OpenOutcome, SoftFailure};
use crate::luks::cryptsetup::Cryptsetup;
use crate::luks::CryptoContainer;
use crate::mount::{Mounter, SystemMounter};
use crate::pin::TerminalPrompt;
use crate::tpm::tools::Tpm2Tools;
use crate::tpm::SealedKeyStore;
use clap::{Parser, Subcommand};
use eyre::Result;

type SystemDiskManager = DiskManager<
    Box<dyn SealedKeyStore>,
    Box<dyn CryptoContainer>,
    Box<dyn Mounter>,
    TerminalPrompt,
>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an image, seal a random key in the TPM and format it as LUKS2
    Create {
        /// Disk name, e.g. `backup`
        #[arg(value_name = "name")]
        name: String,
    },
    /// Unlock a disk through the TPM and mount it at ./<name>
    Open {
        #[arg(value_name = "name")]
        name: String,
    },
    /// Unmount and lock a disk
    Close {
        #[arg(value_name = "name")]
        name: String,
    },
    /// Show every disk and whether it is open
    List,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<()> {
        let config = Config::load()?;
        log::debug!("{:?}", config);
        let mut disks = system_disk_manager(config)?;

        match &self.command {
            Commands::Create { name } => {
                let report = disks.create(name)?;
                println!();
                println!(
                    "Done! Disk {} is protected by the TPM{}.",
                    report.name,
                    if report.pin_protected { " and a PIN" } else { "" }
                );
                println!("   tpm-disk open {}", report.name);
                println!("   tpm-disk close {}", report.name);
                println!();
            }
            Commands::Open { name } => {
                let report = disks.open(name)?;
                match report.outcome {
                    OpenOutcome::AlreadyOpen => {
                        println!("Already open at {}", report.mount_point.display())
                    }
                    OpenOutcome::Opened | OpenOutcome::Remounted => {
                        println!("Mounted at {}", report.mount_point.display())
                    }
                }
            }
            Commands::Close { name } => {
                let report = disks.close(name)?;
                for soft in &report.soft_failures {
                    match soft {
                        SoftFailure::NotMounted => println!("{} was not mounted", report.name),
                        SoftFailure::NotActive => println!("{} was not unlocked", report.name),
                    }
                }
                println!("{} closed", report.name);
            }
            Commands::List => {
                for disk in disks.list()? {
                    let state = match disk.state {
                        DiskState::Open => "OPEN",
                        DiskState::Closed | DiskState::Absent => "CLOSED",
                    };
                    let image = disk
                        .image
                        .file_name()
                        .map(|f| f.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    println!("{:<6}  {:<20}  {}", state, disk.name, image);
                }
            }
        };
        Ok(())
    }
}

fn sealed_key_store(config: &Config) -> Result<Box<dyn SealedKeyStore>> {
    match config.backend {
        Backend::Tools => Ok(Box::new(Tpm2Tools::new(
            config.binaries.tpm2_tools_dir.clone(),
            config.tcti.clone(),
        ))),
        #[cfg(feature = "tpm2")]
        Backend::Esapi => Ok(Box::new(crate::tpm::esapi::EsapiStore::new(
            config.tcti.clone(),
        ))),
        #[cfg(not(feature = "tpm2"))]
        Backend::Esapi => Err(eyre::eyre!(
            "the esapi backend needs a build with the `tpm2` feature"
        )),
    }
}

fn system_disk_manager(config: Config) -> Result<SystemDiskManager> {
    let store = sealed_key_store(&config)?;
    let container: Box<dyn CryptoContainer> = Box::new(
        Cryptsetup::new(&config.binaries.cryptsetup).with_mapper_dir(&config.binaries.mapper_dir),
    );
    let mounter: Box<dyn Mounter> = Box::new(SystemMounter {
        filesystem: config.filesystem.clone(),
        mount: config.binaries.mount.clone(),
        umount: config.binaries.umount.clone(),
        mkfs_prefix: config.binaries.mkfs_prefix.clone(),
        mounts_table: config.binaries.mounts_table.clone(),
    });
    Ok(DiskManager::new(
        config,
        store,
        container,
        mounter,
        TerminalPrompt,
    ))
}
