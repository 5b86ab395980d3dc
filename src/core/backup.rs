//! Timestamped, checksummed backups of the managed configuration document
//!
//! Before every edit the current document is copied to
//! `<path>.bak.<YYYYmmddHHMMSSmmm>` next to the original, with the SHA-256 of
//! the copy in `<backup>.sha256`. A same-millisecond collision gets a `-N`
//! suffix. Only names of exactly that shape count as backups, ordered by
//! `(stamp, N)`; other `<path>.bak.*` files belong to the operator and are
//! never touched. Only the newest `retention` backups are kept.
//!
//! Restore refuses a backup whose checksum is missing or wrong, and
//! [`BackupStore::restore_latest`] falls back to older backups until one
//! verifies.

use crate::core::error::BackupError;
use crate::utils::{existing_mode, sha256_hex, write_atomic};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default number of backups kept per document
pub const DEFAULT_RETENTION: usize = 5;

const CHECKSUM_SUFFIX: &str = ".sha256";
const MAX_SAME_STAMP: u32 = 999;
const STAMP_LEN: usize = 17;

#[derive(Debug, Clone, Copy)]
pub struct BackupStore {
    retention: usize,
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl BackupStore {
    /// A `retention` of zero is treated as one: the backup just taken is never
    /// pruned.
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Copies `document` to a fresh backup.
    ///
    /// Returns `Ok(None)` when the document does not exist yet: there is
    /// nothing to lose, and the edit will create it.
    ///
    /// # Errors
    ///
    /// Any failure to read the document or write the backup or its checksum.
    pub async fn create(&self, document: &Path) -> Result<Option<PathBuf>, BackupError> {
        let contents = match tokio::fs::read(document).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{} does not exist yet, nothing to back up", document.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let path = unique_backup_path(document).await?;
        let mode = existing_mode(document).await.unwrap_or(0o600);
        write_atomic(&path, &contents, mode).await?;
        write_atomic(&checksum_path(&path), sha256_hex(&contents).as_bytes(), 0o600).await?;
        info!("Backed up {} to {}", document.display(), path.display());

        self.prune(document, &path).await;
        Ok(Some(path))
    }

    /// Removes backups beyond the retention limit, oldest first. `fresh` is
    /// never removed.
    async fn prune(&self, document: &Path, fresh: &Path) {
        let backups = match list_backups(document).await {
            Ok(backups) => backups,
            Err(e) => {
                warn!("Failed to list backups for cleanup: {e}");
                return;
            }
        };

        for old in backups.into_iter().skip(self.retention) {
            if old.as_path() == fresh {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(&old).await {
                warn!("Failed to remove old backup {}: {e}", old.display());
                continue;
            }
            let _ = tokio::fs::remove_file(checksum_path(&old)).await;
            info!("Removed old backup: {}", old.display());
        }
    }

    /// Restores `backup` over `document` after verifying its checksum.
    ///
    /// # Errors
    ///
    /// - `BackupError::ChecksumMissing` if no `.sha256` file accompanies the backup
    /// - `BackupError::ChecksumMismatch` if the backup was altered
    /// - `BackupError::Io` on read/write failure
    pub async fn restore(&self, backup: &Path, document: &Path) -> Result<(), BackupError> {
        let contents = tokio::fs::read(backup).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackupError::NotFound(backup.to_path_buf())
            } else {
                BackupError::Io(e)
            }
        })?;

        let sum_path = checksum_path(backup);
        let expected = match tokio::fs::read_to_string(&sum_path).await {
            Ok(sum) => sum.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::ChecksumMissing(sum_path));
            }
            Err(e) => return Err(e.into()),
        };
        let actual = sha256_hex(&contents);
        if expected != actual {
            return Err(BackupError::ChecksumMismatch { expected, actual });
        }

        let mode = match existing_mode(document).await {
            Some(mode) => mode,
            None => existing_mode(backup).await.unwrap_or(0o644),
        };
        write_atomic(document, &contents, mode).await?;
        info!("Restored {} from {}", document.display(), backup.display());
        Ok(())
    }

    /// Restores the newest backup that verifies, trying older ones on failure.
    ///
    /// Returns the backup that was restored.
    pub async fn restore_latest(&self, document: &Path) -> Result<PathBuf, BackupError> {
        let backups = list_backups(document).await?;
        if backups.is_empty() {
            return Err(BackupError::NotFound(document.to_path_buf()));
        }

        info!(
            "Found {} backup(s), attempting cascade restore",
            backups.len()
        );

        let mut last_error = None;
        for (i, backup) in backups.iter().enumerate() {
            match self.restore(backup, document).await {
                Ok(()) => {
                    if i > 0 {
                        warn!("Restored from backup #{} after newer ones failed", i + 1);
                    }
                    return Ok(backup.clone());
                }
                Err(e) => {
                    warn!("Backup {} unusable: {e}", backup.display());
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackupError::NotFound(document.to_path_buf())))
    }
}

/// `<backup>.sha256`
pub fn checksum_path(backup: &Path) -> PathBuf {
    let mut name = backup.as_os_str().to_os_string();
    name.push(CHECKSUM_SUFFIX);
    PathBuf::from(name)
}

fn backup_prefix(document: &Path) -> Option<String> {
    document
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| format!("{n}.bak."))
}

/// Parses the `<stamp>[-N]` part of a backup file name into its sort key.
fn backup_key(name: &str, prefix: &str) -> Option<(u64, u32)> {
    let rest = name.strip_prefix(prefix)?;
    let (stamp, n) = match rest.split_once('-') {
        Some((stamp, n)) => (stamp, Some(n)),
        None => (rest, None),
    };
    if stamp.len() != STAMP_LEN || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n = match n {
        Some(n) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => n.parse().ok()?,
        Some(_) => return None,
        None => 0,
    };
    Some((stamp.parse().ok()?, n))
}

/// Backups of `document`, newest first.
pub async fn list_backups(document: &Path) -> Result<Vec<PathBuf>, BackupError> {
    let Some(prefix) = backup_prefix(document) else {
        return Ok(Vec::new());
    };
    let dir = match document.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut backups = Vec::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(key) = backup_key(name, &prefix) {
            backups.push((key, entry.path()));
        }
    }

    backups.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(backups.into_iter().map(|(_, path)| path).collect())
}

async fn unique_backup_path(document: &Path) -> Result<PathBuf, BackupError> {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f").to_string();
    let mut base = document.as_os_str().to_os_string();
    base.push(format!(".bak.{stamp}"));
    let base = PathBuf::from(base);

    if !tokio::fs::try_exists(&base).await? {
        return Ok(base);
    }
    // Same millisecond as an earlier backup
    for n in 1..=MAX_SAME_STAMP {
        let mut name = base.as_os_str().to_os_string();
        name.push(format!("-{n}"));
        let candidate = PathBuf::from(name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(BackupError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("too many backups named {}", base.display()),
    )))
}
