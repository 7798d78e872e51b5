use crate::luks::LuksError;
use crate::mount::MountError;
use crate::pin::PinError;
use crate::tpm::{AuthFailure, TpmError};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A unit of work inside a lifecycle operation, named in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AllocateImage,
    GenerateKey,
    AskPin,
    BuildPolicy,
    Seal,
    Format,
    AddToken,
    InitFilesystem,
    QueryState,
    Unlock,
    Mount,
    Unmount,
    Close,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::AllocateImage => "allocate image",
            Step::GenerateKey => "generate key",
            Step::AskPin => "ask PIN",
            Step::BuildPolicy => "build policy",
            Step::Seal => "seal key",
            Step::Format => "format LUKS2",
            Step::AddToken => "add token",
            Step::InitFilesystem => "initialise filesystem",
            Step::QueryState => "query state",
            Step::Unlock => "unlock",
            Step::Mount => "mount",
            Step::Unmount => "unmount",
            Step::Close => "close",
        })
    }
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Luks(#[from] LuksError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Precondition,
    UserInput,
    External,
    Authentication,
    Other,
}

impl ErrorCategory {
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorCategory::Other => 1,
            ErrorCategory::Precondition => 2,
            ErrorCategory::UserInput => 3,
            ErrorCategory::External => 4,
            ErrorCategory::Authentication => 5,
        }
    }
}

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("precondition failed: disk `{0}` already exists")]
    AlreadyExists(String),
    #[error("precondition failed: disk `{0}` does not exist")]
    NotFound(String),
    #[error("precondition failed: `{name}` is not a valid disk name: {reason}")]
    InvalidName { name: String, reason: String },
    #[error(
        "precondition failed: {} is not empty while the disk is closed; move its contents away first",
        .0.display()
    )]
    MountPointBusy(PathBuf),
    #[error("invalid input: PIN entries do not match")]
    PinMismatch,
    #[error("failed to read PIN: {0}")]
    PinEntry(#[source] io::Error),
    #[error("external call failed: {step}: {source}{}", completed_note(.completed))]
    External {
        step: Step,
        completed: Vec<Step>,
        source: StepError,
    },
    #[error("authentication failed: {0}")]
    Authentication(AuthFailure),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn completed_note(completed: &[Step]) -> String {
    if completed.is_empty() {
        return String::new();
    }
    let steps: Vec<String> = completed.iter().map(Step::to_string).collect();
    format!(" (completed: {})", steps.join(", "))
}

pub type Result<T, E = DiskError> = core::result::Result<T, E>;

impl DiskError {
    /// Wraps a backend failure, lifting authentication failures and PIN
    /// entry problems out of the generic external category.
    pub fn external(step: Step, completed: &[Step], source: impl Into<StepError>) -> Self {
        match source.into() {
            StepError::Tpm(TpmError::Auth(failure))
            | StepError::Luks(LuksError::Unseal(TpmError::Auth(failure))) => {
                DiskError::Authentication(failure)
            }
            StepError::Luks(LuksError::Pin(PinError::Io(err))) => DiskError::PinEntry(err),
            StepError::Luks(LuksError::Pin(PinError::Mismatch)) => DiskError::PinMismatch,
            source => DiskError::External {
                step,
                completed: completed.to_vec(),
                source,
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DiskError::AlreadyExists(_)
            | DiskError::NotFound(_)
            | DiskError::InvalidName { .. }
            | DiskError::MountPointBusy(_) => ErrorCategory::Precondition,
            DiskError::PinMismatch => ErrorCategory::UserInput,
            DiskError::External { .. } => ErrorCategory::External,
            DiskError::Authentication(_) => ErrorCategory::Authentication,
            DiskError::PinEntry(_) | DiskError::Io(_) => ErrorCategory::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseal_auth_failures_become_authentication_errors() {
        let err = DiskError::external(
            Step::Unlock,
            &[],
            LuksError::Unseal(AuthFailure::PlatformChanged.into()),
        );
        assert!(matches!(
            err,
            DiskError::Authentication(AuthFailure::PlatformChanged)
        ));
        assert_eq!(err.category().exit_code(), 5);
    }

    #[test]
    fn external_error_lists_completed_steps() {
        let err = DiskError::external(
            Step::Format,
            &[Step::AllocateImage, Step::GenerateKey, Step::Seal],
            LuksError::Command {
                action: "luksFormat",
                status: 1,
                diagnostic: "device busy".to_owned(),
            },
        );
        assert_eq!(err.category(), ErrorCategory::External);
        assert_eq!(
            err.to_string(),
            "external call failed: format LUKS2: cryptsetup luksFormat failed: device busy \
             (exit code 1) (completed: allocate image, generate key, seal key)"
        );
    }

    #[test]
    fn categories_have_distinct_exit_codes() {
        let codes: Vec<u8> = [
            ErrorCategory::Precondition,
            ErrorCategory::UserInput,
            ErrorCategory::External,
            ErrorCategory::Authentication,
            ErrorCategory::Other,
        ]
        .iter()
        .map(ErrorCategory::exit_code)
        .collect();
        assert_eq!(codes, [2, 3, 4, 5, 1]);
    }
}
