//! Utility functions for directory management and file handling
//!
//! Directories follow the XDG Base Directory specification:
//!
//! - Config: `~/.config/torgw/` - `config.json`
//! - State: `~/.local/state/torgw/` - Audit log
//!
//! When torgw runs as root these resolve under `/root`; pass `--config` to
//! use a system-wide file such as `/etc/torgw/config.json`.
//!
//! # Example
//!
//! ```
//! use torgw::utils::{ensure_dirs, get_state_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(state) = get_state_dir() {
//!     println!("audit log lives in {}", state.display());
//! }
//! ```

use directories::ProjectDirs;
use std::io;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "torgw", "torgw")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// `config.json` inside the config directory.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

pub fn ensure_dirs() -> io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    builder.mode(0o700); // User read/write/execute only
    builder.recursive(true);

    if let Some(dir) = get_config_dir() {
        builder.create(dir)?;
    }
    if let Some(dir) = get_state_dir() {
        builder.create(dir)?;
    }
    Ok(())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Permission bits of an existing file, if any.
pub async fn existing_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

/// Writes `contents` to `path` so readers see either the old or the new file.
///
/// 1. Creates a temporary file in the target directory with `mode` set
///    before any data is written.
/// 2. Syncs it to disk.
/// 3. Atomically renames it over `path`.
///
/// The temporary file is removed if any step fails.
pub async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let path = path.to_path_buf();
    let contents = contents.to_vec();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &contents, mode))
        .await
        .map_err(io::Error::other)?
}

fn write_atomic_blocking(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".torgw-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))?;
    temp.write_all(contents).map_err(|e| {
        if e.kind() == io::ErrorKind::StorageFull {
            io::Error::new(
                io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e
        }
    })?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
