use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform data directory for the server (e.g. `~/.local/share/pruda` on
/// Linux), created on first use.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "pruda", "pruda")
        .context("cannot determine a home directory for the data dir")?;
    let dir = dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir).context("create data dir")?;
    Ok(dir)
}
