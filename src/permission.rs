//! Access resolution for target paths.
//!
//! Decides, per call, which [`FileOperations`] backend may touch a path.
//! Grants can be revoked at any time by the platform, so nothing is cached.
//!
//! Precedence:
//! 1. Privileged mode requested and the helper is available and granted
//! 2. A configured per-path override, if it can currently be honoured
//! 3. The process can write the path (or its nearest existing ancestor)
//! 4. A document-tree grant covers the path
//! 5. Nothing

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::fileops::{AccessKind, DirectFileOps, DocumentFileOps, FileOperations, ShellChannel, ShellFileOps};
use crate::paths;

/// The resolved access for one path at one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub path: PathBuf,
    pub kind: AccessKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no access to {}", path.display())]
pub struct PermissionDenied {
    pub path: PathBuf,
}

/// Whether the current process may write `path`, judged on the nearest
/// ancestor that exists.
pub fn is_writable(path: &Path) -> bool {
    let Some(existing) = paths::nearest_existing(path) else {
        return false;
    };
    writable_now(existing)
}

#[cfg(unix)]
fn writable_now(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn writable_now(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| !m.permissions().readonly())
}

/// Picks the access backend for a path.
#[derive(Clone, Default)]
pub struct PermissionResolver {
    shell: Option<Arc<dyn ShellChannel>>,
    documents: Arc<DocumentFileOps>,
    overrides: Vec<(PathBuf, AccessKind)>,
}

impl PermissionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, channel: Arc<dyn ShellChannel>) -> Self {
        self.shell = Some(channel);
        self
    }

    pub fn with_documents(mut self, documents: DocumentFileOps) -> Self {
        self.documents = Arc::new(documents);
        self
    }

    /// Force `kind` for `path` and everything below it.
    pub fn with_override(mut self, path: impl Into<PathBuf>, kind: AccessKind) -> Self {
        self.overrides.push((path.into(), kind));
        self
    }

    fn shell_ready(&self) -> bool {
        self.shell
            .as_ref()
            .is_some_and(|s| s.is_available() && s.is_granted())
    }

    fn override_for(&self, path: &Path) -> Option<AccessKind> {
        self.overrides
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.components().count())
            .map(|(_, kind)| *kind)
    }

    fn grantable(&self, kind: AccessKind, path: &Path) -> bool {
        match kind {
            AccessKind::Direct => is_writable(path),
            AccessKind::Document => self.documents.covers(path),
            AccessKind::Shell => self.shell_ready(),
            AccessKind::None => true,
        }
    }

    /// Which access kind applies to `path` right now.
    pub fn check_permission(&self, path: &Path, privileged: bool) -> AccessKind {
        let kind = self.resolve(path, privileged);
        debug!("Access for {} (privileged={}): {}", path.display(), privileged, kind);
        kind
    }

    fn resolve(&self, path: &Path, privileged: bool) -> AccessKind {
        if privileged && self.shell_ready() {
            return AccessKind::Shell;
        }
        if let Some(kind) = self.override_for(path) {
            return if self.grantable(kind, path) { kind } else { AccessKind::None };
        }
        if is_writable(path) {
            return AccessKind::Direct;
        }
        if self.documents.covers(path) {
            return AccessKind::Document;
        }
        AccessKind::None
    }

    pub fn grant(&self, path: &Path, privileged: bool) -> AccessGrant {
        AccessGrant {
            path: path.to_path_buf(),
            kind: self.check_permission(path, privileged),
        }
    }

    /// The backend for `path`, or a refusal before any backend is touched.
    pub fn strategy_for(&self, path: &Path, privileged: bool) -> Result<Arc<dyn FileOperations>, PermissionDenied> {
        match self.check_permission(path, privileged) {
            AccessKind::Direct => Ok(Arc::new(DirectFileOps)),
            AccessKind::Document => Ok(self.documents.clone()),
            AccessKind::Shell => match &self.shell {
                Some(channel) => Ok(Arc::new(ShellFileOps::new(channel.clone()))),
                None => Err(PermissionDenied { path: path.to_path_buf() }),
            },
            AccessKind::None => Err(PermissionDenied { path: path.to_path_buf() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileops::{DocumentGrant, DocumentProvider, FsDocumentProvider, LoopbackChannel};
    use tempfile::tempdir;

    const GRANTED: &str = "/storage/emulated/0/Android/data";

    fn documents(mirror: &Path) -> DocumentFileOps {
        let provider: Arc<dyn DocumentProvider> = Arc::new(FsDocumentProvider::new(mirror));
        DocumentFileOps::new(vec![DocumentGrant::new(GRANTED, provider)])
    }

    #[test]
    fn test_writable_path_is_direct() {
        let dir = tempdir().unwrap();
        let resolver = PermissionResolver::new();
        assert_eq!(resolver.check_permission(dir.path(), false), AccessKind::Direct);
        // Not-yet-created children inherit the nearest ancestor's access
        assert_eq!(
            resolver.check_permission(&dir.path().join("a/b/c"), false),
            AccessKind::Direct
        );
        let ops = resolver.strategy_for(dir.path(), false).unwrap();
        assert_eq!(ops.kind(), AccessKind::Direct);
    }

    #[test]
    fn test_privileged_prefers_granted_shell() {
        let dir = tempdir().unwrap();
        let resolver = PermissionResolver::new().with_shell(Arc::new(LoopbackChannel::new(true)));
        assert_eq!(resolver.check_permission(dir.path(), true), AccessKind::Shell);
        assert_eq!(resolver.check_permission(dir.path(), false), AccessKind::Direct);

        let ops = resolver.strategy_for(dir.path(), true).unwrap();
        assert_eq!(ops.kind(), AccessKind::Shell);
    }

    #[test]
    fn test_ungranted_shell_falls_through() {
        let dir = tempdir().unwrap();
        let resolver = PermissionResolver::new().with_shell(Arc::new(LoopbackChannel::new(false)));
        assert_eq!(resolver.check_permission(dir.path(), true), AccessKind::Direct);
    }

    #[test]
    fn test_override_only_if_grantable() {
        let mirror = tempdir().unwrap();
        let game = Path::new(GRANTED).join("com.game");
        let resolver = PermissionResolver::new()
            .with_documents(documents(mirror.path()))
            .with_override(&game, AccessKind::Document)
            .with_override(game.join("locked"), AccessKind::Shell);

        assert_eq!(resolver.check_permission(&game.join("files"), false), AccessKind::Document);
        // Longest prefix wins, but no shell is configured
        assert_eq!(resolver.check_permission(&game.join("locked/x"), false), AccessKind::None);
        assert_eq!(
            resolver.strategy_for(&game.join("locked/x"), false).map(|_| ()),
            Err(PermissionDenied { path: game.join("locked/x") })
        );
    }

    #[test]
    fn test_document_grant_when_not_writable() {
        let mirror = tempdir().unwrap();
        let resolver = PermissionResolver::new().with_documents(documents(mirror.path()));
        let target = Path::new(GRANTED).join("com.game/files");
        let expected = if is_writable(&target) {
            // Running as root or with a writable /storage: direct wins
            AccessKind::Direct
        } else {
            AccessKind::Document
        };
        assert_eq!(resolver.check_permission(&target, false), expected);
    }

    #[test]
    fn test_revocation_is_seen_immediately() {
        let dir = tempdir().unwrap();
        let channel = Arc::new(LoopbackChannel::new(true));
        let resolver = PermissionResolver::new().with_shell(channel.clone());
        assert_eq!(resolver.check_permission(dir.path(), true), AccessKind::Shell);

        channel.set_granted(false);
        assert_eq!(resolver.check_permission(dir.path(), true), AccessKind::Direct);
    }

    #[test]
    fn test_override_without_backing_grant_is_none() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("game");
        let resolver = PermissionResolver::new().with_override(&target, AccessKind::Document);
        assert_eq!(resolver.check_permission(&target, false), AccessKind::None);
    }
}
