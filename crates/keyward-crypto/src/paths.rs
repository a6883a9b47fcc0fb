//! Where the agent keeps its files, and who may read them.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Overrides the state directory when set.
pub const STATE_DIR_ENV: &str = "KEYWARD_STATE_DIR";

/// `$KEYWARD_STATE_DIR`, else `$HOME/.local/state/keyward`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME").context("cannot locate state dir: HOME is not set")?;
    Ok(Path::new(&home).join(".local").join("state").join("keyward"))
}

/// Create `dir` and its parents if needed, then restrict it to the owner.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    restrict(dir, 0o700)
}

/// Write `contents` to `path`, readable by the owner only.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    restrict(path, 0o600)
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
