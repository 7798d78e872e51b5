//! # tpm-disk
//!
//! Loopback disk images encrypted with LUKS2 whose key never leaves the TPM
//! unprotected: it is sealed against PCRs 0-7 (and optionally a PIN) and the
//! image carries a token naming the sealed object.
//!
//! ```bash
//! sudo tpm-disk create backup
//! sudo tpm-disk open backup
//! sudo tpm-disk close backup
//! tpm-disk list
//! ```

pub mod cli;
pub mod config;
pub mod disk;
pub mod key;
pub mod luks;
pub mod mount;
pub mod pin;
pub mod process;
pub mod tpm;
