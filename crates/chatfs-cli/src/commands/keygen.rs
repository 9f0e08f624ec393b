//! Keygen command - materialize the master key file on first run.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chatfs_core::MasterKey;
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::config::AppConfig;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Overwrite an existing key file
    #[arg(long)]
    pub force: bool,
}

#[instrument(level = "info", name = "cmd::keygen", skip_all)]
pub fn execute(config: &AppConfig, args: &Args) -> Result<()> {
    let key_path = config.master_key_file();

    if key_path.exists() && !args.force {
        anyhow::bail!(
            "master key file already exists at {}; pass --force to overwrite (this makes every previously \
             uploaded file unreadable)",
            key_path.display()
        );
    }

    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let key = MasterKey::generate();
    write_key_file(&key_path, &key)?;

    println!("Generated master key at {}", key_path.display());
    Ok(())
}

fn write_key_file(path: &PathBuf, key: &MasterKey) -> Result<()> {
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(key.as_bytes());
    fs::write(path, encoded).with_context(|| format!("failed to write {}", path.display()))?;
    restrict_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &PathBuf) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms).with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &PathBuf) -> Result<()> {
    Ok(())
}
