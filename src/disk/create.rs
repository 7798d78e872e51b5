//! `create` as a journal of steps. Each completed step that left something
//! behind records how to undo it, so a failure can either be reported with
//! the list of finished steps or rolled back in reverse order.

use super::{CreateReport, DiskError, DiskManager, DiskName, Result, Step, StepError};
use crate::key::SecretKey;
use crate::luks::{CryptoContainer, SealedKeyToken};
use crate::mount::Mounter;
use crate::pin::{ask_new_pin, PinError, PinPrompt};
use crate::tpm::{SealedKeyStore, SealedObject, SealingPolicy};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    RemoveImage(PathBuf),
    RemoveSeal(SealedObject),
}

#[derive(Debug, Default)]
struct Journal {
    completed: Vec<Step>,
    undo: Vec<Undo>,
}

impl Journal {
    fn done(&mut self, step: Step) {
        log::debug!("create: {} done", step);
        self.completed.push(step);
    }

    fn done_with_undo(&mut self, step: Step, undo: Undo) {
        self.done(step);
        self.undo.push(undo);
    }
}

/// Allocates a sparse image readable and writable by the owner only.
fn allocate_image(path: &Path, size: u64) -> io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.set_len(size)?;
    Ok(file)
}

impl<S, C, M, P> DiskManager<S, C, M, P>
where
    S: SealedKeyStore,
    C: CryptoContainer,
    M: Mounter,
    P: PinPrompt,
{
    /// Allocates the image, seals a fresh random key in the TPM and formats
    /// the image as LUKS2 with a token pointing at the sealed key.
    pub fn create(&mut self, name: &str) -> Result<CreateReport> {
        let name = DiskName::new(name)?;
        let paths = self.paths(&name);
        if paths.image.exists() {
            return Err(DiskError::AlreadyExists(name.to_string()));
        }
        fs::create_dir_all(&self.config.base_dir)?;

        let mut journal = Journal::default();

        log::info!(
            "Allocating {} image {}",
            self.config.disk_size,
            paths.image.display()
        );
        match allocate_image(&paths.image, self.config.disk_size.bytes()) {
            Ok(_) => journal.done_with_undo(
                Step::AllocateImage,
                Undo::RemoveImage(paths.image.clone()),
            ),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DiskError::AlreadyExists(name.to_string()))
            }
            Err(err) => return Err(self.abort(journal, Step::AllocateImage, err)),
        }

        let key = SecretKey::generate(self.config.key_size);
        journal.done(Step::GenerateKey);

        let pin = match ask_new_pin(&mut self.pins) {
            Ok(pin) => pin,
            Err(err) => {
                // Nothing but the empty image exists yet; never leave it behind.
                self.rollback(journal);
                return Err(match err {
                    PinError::Mismatch => DiskError::PinMismatch,
                    PinError::Io(err) => DiskError::PinEntry(err),
                });
            }
        };
        journal.done(Step::AskPin);

        let policy = SealingPolicy::new(self.config.pcrs.clone(), pin);
        journal.done(Step::BuildPolicy);

        log::info!(
            "Sealing key at {} ({}{})",
            paths.seal_path,
            policy.pcrs,
            if policy.requires_pin() { " + PIN" } else { "" }
        );
        let sealed = match self.store.seal(&paths.seal_path, &key, &policy) {
            Ok(sealed) => sealed,
            Err(err) => return Err(self.abort(journal, Step::Seal, err)),
        };
        journal.done_with_undo(Step::Seal, Undo::RemoveSeal(sealed.clone()));

        log::info!("Formatting {} as LUKS2", paths.image.display());
        if let Err(err) = self.container.format(&paths.image, &key) {
            return Err(self.abort(journal, Step::Format, err));
        }
        journal.done(Step::Format);

        let token = SealedKeyToken::new(&sealed, &policy);
        if let Err(err) = self.container.add_token(&paths.image, &token, &key) {
            return Err(self.abort(journal, Step::AddToken, err));
        }
        journal.done(Step::AddToken);

        if let Err(err) = self.init_filesystem(&paths.image, &paths.mapper, &key) {
            return Err(self.abort(journal, Step::InitFilesystem, err));
        }
        journal.done(Step::InitFilesystem);

        Ok(CreateReport {
            name,
            image: paths.image,
            sealed,
            pin_protected: policy.requires_pin(),
        })
    }

    /// Opens the fresh container with the key itself, puts a filesystem on
    /// it and closes it again whatever mkfs did.
    fn init_filesystem(
        &mut self,
        image: &Path,
        mapper: &str,
        key: &SecretKey,
    ) -> Result<(), StepError> {
        let device = self.container.open_with_key(image, mapper, key)?;
        let made = self.mounter.make_filesystem(&device);
        let closed = self.container.close(mapper);
        made?;
        closed?;
        Ok(())
    }

    fn abort(&mut self, journal: Journal, step: Step, err: impl Into<StepError>) -> DiskError {
        let err = DiskError::external(step, &journal.completed, err);
        if self.config.rollback_on_failure {
            self.rollback(journal);
        } else if !journal.undo.is_empty() {
            log::warn!(
                "{} failed; completed steps were left in place: {}",
                step,
                journal
                    .completed
                    .iter()
                    .map(Step::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        err
    }

    fn rollback(&mut self, journal: Journal) {
        for undo in journal.undo.into_iter().rev() {
            let result = match &undo {
                Undo::RemoveSeal(sealed) => self.store.remove(sealed).map_err(StepError::from),
                Undo::RemoveImage(path) => fs::remove_file(path).map_err(StepError::from),
            };
            match result {
                Ok(()) => log::info!("Rolled back: {:?}", undo),
                Err(err) => log::warn!("Rollback of {:?} failed: {}", undo, err),
            }
        }
    }
}
