//! File mutation backends.
//!
//! Game directories on Android can be reachable in three ways: plain
//! filesystem calls, a document-tree grant from the storage framework, or a
//! privileged helper process. Each is a [`FileOperations`] backend with the
//! same signatures, so callers never branch on how a directory is reached.
//! [`crate::permission::PermissionResolver`] picks the backend per path.
//!
//! All mutations return `bool`; failures are logged, not propagated.

pub mod direct;
pub mod document;
pub mod shell;

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use direct::DirectFileOps;
pub use document::{DocumentFileOps, DocumentGrant, DocumentProvider, FsDocumentProvider};
pub use shell::{LoopbackChannel, ProcessShellChannel, ShellChannel, ShellFileOps, ShellService};

/// How a path can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Direct,
    Document,
    Shell,
    None,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccessKind::Direct => "DIRECT",
            AccessKind::Document => "DOCUMENT",
            AccessKind::Shell => "SHELL",
            AccessKind::None => "NONE",
        };
        f.write_str(name)
    }
}

/// Capability contract shared by every access backend.
pub trait FileOperations: Send + Sync {
    /// Which access kind this backend implements.
    fn kind(&self) -> AccessKind;

    /// Create `path` and any missing parents.
    fn create_directory(&self, path: &Path) -> bool;

    /// Copy a file, creating missing parent directories of `dest` and
    /// replacing an existing file there.
    fn copy_file(&self, src: &Path, dest: &Path) -> bool;

    /// Move or rename a file or directory, replacing an existing `dest`.
    fn move_or_rename(&self, src: &Path, dest: &Path) -> bool;

    /// Delete a file or a directory tree. Deleting a missing path succeeds.
    fn delete_file(&self, path: &Path) -> bool;

    /// Write `content` to `dir/name`, creating `dir` if needed.
    fn write_text(&self, dir: &Path, name: &str, content: &str) -> bool;

    /// Open a file for reading. `None` if it is missing or unreadable.
    fn open_read_stream(&self, path: &Path) -> Option<Box<dyn Read + Send>>;

    fn exists(&self, path: &Path) -> bool;

    /// Read a whole file as UTF-8 text.
    fn read_text(&self, path: &Path) -> Option<String> {
        let mut stream = self.open_read_stream(path)?;
        let mut text = String::new();
        match stream.read_to_string(&mut text) {
            Ok(_) => Some(text),
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Log a failed operation and collapse the result to `bool`.
pub(crate) fn report(kind: AccessKind, op: &str, result: anyhow::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("[{}] {} failed: {:#}", kind, op, e);
            false
        }
    }
}
