//! `Config::load` reads the process environment, so it gets a test binary of
//! its own.

use eyre::Result;
use std::env;
use std::fs;
use std::path::PathBuf;
use tpm_disk::config::{Config, ConfigError, CONFIG_ENV_VAR, TCTI_ENV_VAR};

#[test]
fn environment_selects_file_and_tcti() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("disks.yaml");
    fs::write(
        &file,
        "base_dir: /srv/disks\nmapper_prefix: vault_\ntcti: device:/dev/tpm0\n",
    )?;

    env::set_var(CONFIG_ENV_VAR, &file);
    env::remove_var(TCTI_ENV_VAR);
    let config = Config::load()?;
    assert_eq!(config.base_dir, PathBuf::from("/srv/disks"));
    assert_eq!(config.mapper_prefix, "vault_");
    assert_eq!(config.tcti, "device:/dev/tpm0");

    env::set_var(TCTI_ENV_VAR, "mssim:host=localhost,port=2321");
    assert_eq!(Config::load()?.tcti, "mssim:host=localhost,port=2321");

    env::set_var(CONFIG_ENV_VAR, dir.path().join("missing.yaml"));
    assert!(matches!(Config::load(), Err(ConfigError::Read { .. })));

    env::remove_var(CONFIG_ENV_VAR);
    env::remove_var(TCTI_ENV_VAR);
    Ok(())
}
