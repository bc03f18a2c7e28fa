//! Direct filesystem backend.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use super::{report, AccessKind, FileOperations};
use crate::paths;

/// Plain `std::fs` access for paths the process can write itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFileOps;

impl DirectFileOps {
    pub(crate) fn try_copy(src: &Path, dest: &Path) -> Result<()> {
        if !src.is_file() {
            anyhow::bail!("Source is not a file: {}", src.display());
        }
        if paths::same_file(src, dest) {
            return Ok(());
        }
        paths::ensure_parent_dirs(dest)
            .with_context(|| format!("Failed to create parent of {}", dest.display()))?;
        if dest.is_file() {
            fs::remove_file(dest).with_context(|| format!("Failed to replace {}", dest.display()))?;
        }
        // Reflink (CoW) when the filesystem supports it, plain copy otherwise
        reflink_copy::reflink_or_copy(src, dest)
            .with_context(|| format!("Failed to copy {} -> {}", src.display(), dest.display()))?;
        Ok(())
    }

    pub(crate) fn try_move(src: &Path, dest: &Path) -> Result<()> {
        if !src.exists() {
            anyhow::bail!("Source does not exist: {}", src.display());
        }
        if paths::same_file(src, dest) {
            return Ok(());
        }
        paths::ensure_parent_dirs(dest)
            .with_context(|| format!("Failed to create parent of {}", dest.display()))?;
        if dest.exists() {
            Self::try_delete(dest)?;
        }
        if fs::rename(src, dest).is_ok() {
            return Ok(());
        }
        // Cross-device: copy then delete
        if src.is_dir() {
            for entry in walkdir::WalkDir::new(src) {
                let entry = entry.context("Failed to walk source directory")?;
                let rel = entry.path().strip_prefix(src)?;
                let target = dest.join(rel);
                if entry.file_type().is_dir() {
                    fs::create_dir_all(&target)?;
                } else {
                    Self::try_copy(entry.path(), &target)?;
                }
            }
        } else {
            Self::try_copy(src, dest)?;
        }
        Self::try_delete(src)
    }

    pub(crate) fn try_delete(path: &Path) -> Result<()> {
        match fs::symlink_metadata(path) {
            Err(_) => Ok(()),
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove directory {}", path.display())),
            Ok(_) => fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    pub(crate) fn try_write_text(dir: &Path, name: &str, content: &str) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let target = dir.join(name);
        fs::write(&target, content).with_context(|| format!("Failed to write {}", target.display()))
    }
}

impl FileOperations for DirectFileOps {
    fn kind(&self) -> AccessKind {
        AccessKind::Direct
    }

    fn create_directory(&self, path: &Path) -> bool {
        let result = fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()));
        report(self.kind(), "create_directory", result)
    }

    fn copy_file(&self, src: &Path, dest: &Path) -> bool {
        report(self.kind(), "copy_file", Self::try_copy(src, dest))
    }

    fn move_or_rename(&self, src: &Path, dest: &Path) -> bool {
        report(self.kind(), "move_or_rename", Self::try_move(src, dest))
    }

    fn delete_file(&self, path: &Path) -> bool {
        report(self.kind(), "delete_file", Self::try_delete(path))
    }

    fn write_text(&self, dir: &Path, name: &str, content: &str) -> bool {
        report(self.kind(), "write_text", Self::try_write_text(dir, name, content))
    }

    fn open_read_stream(&self, path: &Path) -> Option<Box<dyn Read + Send>> {
        if !path.is_file() {
            return None;
        }
        File::open(path).ok().map(|f| Box::new(f) as Box<dyn Read + Send>)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileops::contract;
    use tempfile::tempdir;

    #[test]
    fn test_direct_contract() {
        let dir = tempdir().unwrap();
        contract::exercise(&DirectFileOps, dir.path());
    }

    #[test]
    fn test_move_directory_replaces_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::create_dir_all(src.join("inner")).unwrap();
        fs::write(src.join("inner/a.txt"), b"a").unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.txt"), b"old").unwrap();

        assert!(DirectFileOps.move_or_rename(&src, &dest));
        assert!(!src.exists());
        assert!(dest.join("inner/a.txt").exists());
        assert!(!dest.join("stale.txt").exists());
    }

    #[test]
    fn test_copy_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dest = dir.path().join("b.txt");
        fs::write(&src, b"new").unwrap();
        fs::write(&dest, b"old content").unwrap();

        assert!(DirectFileOps.copy_file(&src, &dest));
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }
}
