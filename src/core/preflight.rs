//! Checks run before a reconcile mutates anything
//!
//! A run needs write access to the managed document and a way to run the
//! firewall binaries as root. Both are checked up front so a missing
//! permission fails the run before the backup, not halfway through it.

use crate::core::error::{Error, Result};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use nix::unistd::{AccessFlags, access};
use std::path::Path;
use tracing::{debug, warn};

pub trait PrivilegeCheck: Send + Sync {
    /// Fails with [`Error::PermissionDenied`] when the run cannot proceed.
    fn check(&self, document: &Path) -> Result<()>;
}

/// Checks against the running system.
#[derive(Debug, Clone, Default)]
pub struct SystemPrivileges {
    interface: Option<String>,
}

impl SystemPrivileges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also warn when `interface` does not exist. Rules for a missing
    /// interface are accepted by iptables and start matching once it appears,
    /// so this never fails the check.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

impl PrivilegeCheck for SystemPrivileges {
    fn check(&self, document: &Path) -> Result<()> {
        check_writable(document)?;

        let method = crate::elevation::resolve_method()
            .map_err(|e| Error::PermissionDenied(format!("cannot run firewall commands: {e}")))?;
        debug!("Firewall commands will run via {method}");

        if let Some(interface) = &self.interface {
            warn_if_missing(interface);
        }
        Ok(())
    }
}

/// The document's directory must be writable: backups, checksums and the
/// atomic rewrite all create files next to it. An existing document must be
/// writable too.
fn check_writable(document: &Path) -> Result<()> {
    let dir = match document.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    require_write(dir)?;
    if document.exists() {
        require_write(document)?;
    }
    Ok(())
}

fn require_write(path: &Path) -> Result<()> {
    access(path, AccessFlags::W_OK).map_err(|errno| {
        Error::PermissionDenied(format!("cannot write {}: {}", path.display(), errno.desc()))
    })
}

fn warn_if_missing(interface: &str) {
    match NetworkInterface::show() {
        Ok(interfaces) => {
            if !interfaces.iter().any(|i| i.name == interface) {
                warn!("Interface {interface} not found, redirect rules will not match until it appears");
            }
        }
        Err(e) => debug!("Could not list network interfaces: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::setup_no_elevation;

    #[test]
    fn test_writable_document_passes() {
        setup_no_elevation();
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, "").unwrap();

        assert!(SystemPrivileges::new().check(&doc).is_ok());
    }

    #[test]
    fn test_missing_document_checks_parent() {
        setup_no_elevation();
        let dir = tempfile::tempdir().unwrap();
        assert!(
            SystemPrivileges::new()
                .check(&dir.path().join("torrc"))
                .is_ok()
        );
    }

    #[test]
    fn test_missing_directory_is_denied() {
        setup_no_elevation();
        let err = SystemPrivileges::new()
            .check(Path::new("/nonexistent/torgw/torrc"))
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(err.kind(), crate::core::error::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_read_only_directory_is_denied() {
        use std::os::unix::fs::PermissionsExt;

        setup_no_elevation();
        if crate::elevation::is_root() {
            // root bypasses permission bits
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, "").unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();

        let result = SystemPrivileges::new().check(&doc);
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = result.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::PermissionDenied);
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }

    #[test]
    fn test_read_only_document_is_denied() {
        use std::os::unix::fs::PermissionsExt;

        setup_no_elevation();
        if crate::elevation::is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("torrc");
        std::fs::write(&doc, "").unwrap();
        std::fs::set_permissions(&doc, std::fs::Permissions::from_mode(0o444)).unwrap();

        let err = SystemPrivileges::new().check(&doc).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_missing_interface_only_warns() {
        setup_no_elevation();
        let dir = tempfile::tempdir().unwrap();
        let check = SystemPrivileges::new().with_interface("torgwnope0");
        assert!(check.check(dir.path()).is_ok());
    }
}
