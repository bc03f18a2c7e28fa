//! Document-tree backend.
//!
//! On Android, directories such as `Android/data` are only reachable through
//! a persisted tree grant from the storage access framework. Documents are
//! addressed by opaque ids and looked up one path segment at a time, so
//! resolving a path costs one `find_child` per segment.
//!
//! [`DocumentProvider`] is the seam to the platform. [`FsDocumentProvider`]
//! implements it over a plain directory so the backend can run (and be
//! tested) off-device.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use super::{report, AccessKind, FileOperations};

/// Opaque document identifier handed out by a provider.
pub type DocumentId = String;

/// Minimal document-tree API: the operations the storage framework offers
/// on a granted tree.
pub trait DocumentProvider: Send + Sync {
    /// Id of the granted tree's root directory.
    fn root(&self) -> DocumentId;
    fn find_child(&self, parent: &str, name: &str) -> Option<DocumentId>;
    fn is_directory(&self, doc: &str) -> bool;
    fn create_directory(&self, parent: &str, name: &str) -> Result<DocumentId>;
    fn create_file(&self, parent: &str, name: &str) -> Result<DocumentId>;
    fn open_read(&self, doc: &str) -> Result<Box<dyn Read + Send>>;
    /// Open for writing, truncating existing content.
    fn open_write(&self, doc: &str) -> Result<Box<dyn Write + Send>>;
    /// Delete a document, recursively for directories.
    fn delete(&self, doc: &str) -> Result<()>;
    /// Rename within the same parent.
    fn rename(&self, doc: &str, new_name: &str) -> Result<DocumentId>;
    /// Move under another directory of the same tree, keeping the name.
    fn move_to(&self, doc: &str, new_parent: &str) -> Result<DocumentId>;
}

/// A tree grant: the storage path it covers and the provider serving it.
#[derive(Clone)]
pub struct DocumentGrant {
    pub root: PathBuf,
    pub provider: Arc<dyn DocumentProvider>,
}

impl DocumentGrant {
    pub fn new(root: impl Into<PathBuf>, provider: Arc<dyn DocumentProvider>) -> Self {
        Self {
            root: root.into(),
            provider,
        }
    }

    pub fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Path segments below the grant root.
    fn segments(&self, path: &Path) -> Result<Vec<String>> {
        let rel = path
            .strip_prefix(&self.root)
            .map_err(|_| anyhow!("{} is outside grant {}", path.display(), self.root.display()))?;
        rel.components()
            .map(|c| match c {
                Component::Normal(name) => Ok(name.to_string_lossy().into_owned()),
                other => Err(anyhow!("Unsupported path component {:?} in {}", other, path.display())),
            })
            .collect()
    }

    fn resolve_segments(&self, segments: &[String]) -> Option<DocumentId> {
        let mut current = self.provider.root();
        for name in segments {
            current = self.provider.find_child(&current, name)?;
        }
        Some(current)
    }

    /// Walk `segments`, creating missing directories.
    fn ensure_dir(&self, segments: &[String]) -> Result<DocumentId> {
        let mut current = self.provider.root();
        for name in segments {
            current = match self.provider.find_child(&current, name) {
                Some(child) if self.provider.is_directory(&child) => child,
                Some(_) => bail!("'{}' exists and is not a directory", name),
                None => self.provider.create_directory(&current, name)?,
            };
        }
        Ok(current)
    }

    /// Existing file `name` in `parent`, or a new one.
    fn file_in(&self, parent: &str, name: &str) -> Result<DocumentId> {
        match self.provider.find_child(parent, name) {
            Some(doc) if self.provider.is_directory(&doc) => bail!("'{}' is a directory", name),
            Some(doc) => Ok(doc),
            None => self.provider.create_file(parent, name),
        }
    }
}

/// File operations through one or more document-tree grants.
#[derive(Clone, Default)]
pub struct DocumentFileOps {
    grants: Vec<DocumentGrant>,
}

impl DocumentFileOps {
    pub fn new(grants: Vec<DocumentGrant>) -> Self {
        Self { grants }
    }

    pub fn add_grant(&mut self, grant: DocumentGrant) {
        self.grants.push(grant);
    }

    /// True if some grant covers `path`.
    pub fn covers(&self, path: &Path) -> bool {
        self.grant_for(path).is_some()
    }

    /// The most specific grant covering `path`.
    fn grant_for(&self, path: &Path) -> Option<&DocumentGrant> {
        self.grants
            .iter()
            .filter(|g| g.covers(path))
            .max_by_key(|g| g.root.components().count())
    }

    fn require_grant(&self, path: &Path) -> Result<&DocumentGrant> {
        self.grant_for(path)
            .ok_or_else(|| anyhow!("No document grant covers {}", path.display()))
    }

    fn resolve(&self, path: &Path) -> Option<(&DocumentGrant, DocumentId)> {
        let grant = self.grant_for(path)?;
        let segments = grant.segments(path).ok()?;
        grant.resolve_segments(&segments).map(|doc| (grant, doc))
    }

    /// Split a target into its grant, parent segments and file name.
    fn split_target<'a>(&'a self, path: &Path) -> Result<(&'a DocumentGrant, Vec<String>, String)> {
        let grant = self.require_grant(path)?;
        let mut segments = grant.segments(path)?;
        let name = segments
            .pop()
            .ok_or_else(|| anyhow!("{} names the grant root itself", path.display()))?;
        Ok((grant, segments, name))
    }

    /// Sources outside every grant (e.g. the staging area) are read directly.
    fn open_source(&self, src: &Path) -> Result<Box<dyn Read + Send>> {
        if self.covers(src) {
            let (grant, doc) = self
                .resolve(src)
                .ok_or_else(|| anyhow!("Source does not exist: {}", src.display()))?;
            if grant.provider.is_directory(&doc) {
                bail!("Source is a directory: {}", src.display());
            }
            grant.provider.open_read(&doc)
        } else {
            let file = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
            Ok(Box::new(file))
        }
    }

    fn try_create_directory(&self, path: &Path) -> Result<()> {
        let grant = self.require_grant(path)?;
        grant.ensure_dir(&grant.segments(path)?).map(|_| ())
    }

    fn try_copy(&self, src: &Path, dest: &Path) -> Result<()> {
        let mut reader = self.open_source(src)?;
        if src == dest {
            return Ok(());
        }
        let (grant, parent_segments, name) = self.split_target(dest)?;
        let parent = grant.ensure_dir(&parent_segments)?;
        let doc = grant.file_in(&parent, &name)?;
        let mut writer = grant.provider.open_write(&doc)?;
        io::copy(&mut reader, &mut writer)
            .with_context(|| format!("Failed to copy {} -> {}", src.display(), dest.display()))?;
        writer.flush()?;
        Ok(())
    }

    fn try_move(&self, src: &Path, dest: &Path) -> Result<()> {
        let (dest_grant, dest_parent_segments, dest_name) = self.split_target(dest)?;
        let same_tree = self
            .grant_for(src)
            .is_some_and(|g| Arc::ptr_eq(&g.provider, &dest_grant.provider));

        if !same_tree {
            // Crossing trees (or coming from outside): copy, then drop the source
            self.try_copy(src, dest)?;
            return if self.covers(src) {
                self.try_delete(src)
            } else {
                fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))
            };
        }

        let (src_grant, src_doc) = self
            .resolve(src)
            .ok_or_else(|| anyhow!("Source does not exist: {}", src.display()))?;
        if src == dest {
            return Ok(());
        }
        let mut src_segments = src_grant.segments(src)?;
        let src_name = src_segments
            .pop()
            .ok_or_else(|| anyhow!("{} names the grant root itself", src.display()))?;
        let provider = &dest_grant.provider;

        if let Some(existing) = dest_grant.resolve_segments(
            &[dest_parent_segments.clone(), vec![dest_name.clone()]].concat(),
        ) {
            if existing != src_doc {
                provider.delete(&existing)?;
            }
        }

        if src_segments == dest_parent_segments {
            if src_name != dest_name {
                provider.rename(&src_doc, &dest_name)?;
            }
            return Ok(());
        }

        let src_parent = src_grant
            .resolve_segments(&src_segments)
            .ok_or_else(|| anyhow!("Parent of {} vanished", src.display()))?;
        let dest_parent = dest_grant.ensure_dir(&dest_parent_segments)?;

        // The document travels under its own name, so that name must be free
        // in the target directory; siblings in either directory stay untouched
        let mut doc = src_doc;
        let mut name = src_name;
        if name != dest_name && provider.find_child(&dest_parent, &name).is_some() {
            let transit = (0u32..)
                .map(|i| format!(".{}.moving{}", name, i))
                .find(|n| {
                    provider.find_child(&src_parent, n).is_none() && provider.find_child(&dest_parent, n).is_none()
                })
                .ok_or_else(|| anyhow!("No free transit name for {}", src.display()))?;
            doc = provider.rename(&doc, &transit)?;
            name = transit;
        }

        debug!("Moving document {} under {}", src.display(), dest.display());
        doc = provider.move_to(&doc, &dest_parent)?;
        if name != dest_name {
            provider.rename(&doc, &dest_name)?;
        }
        Ok(())
    }

    fn try_delete(&self, path: &Path) -> Result<()> {
        self.require_grant(path)?;
        match self.resolve(path) {
            Some((grant, doc)) => grant.provider.delete(&doc),
            None => Ok(()),
        }
    }

    fn try_write_text(&self, dir: &Path, name: &str, content: &str) -> Result<()> {
        let grant = self.require_grant(dir)?;
        let parent = grant.ensure_dir(&grant.segments(dir)?)?;
        let doc = grant.file_in(&parent, name)?;
        let mut writer = grant.provider.open_write(&doc)?;
        writer.write_all(content.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

impl FileOperations for DocumentFileOps {
    fn kind(&self) -> AccessKind {
        AccessKind::Document
    }

    fn create_directory(&self, path: &Path) -> bool {
        report(self.kind(), "create_directory", self.try_create_directory(path))
    }

    fn copy_file(&self, src: &Path, dest: &Path) -> bool {
        report(self.kind(), "copy_file", self.try_copy(src, dest))
    }

    fn move_or_rename(&self, src: &Path, dest: &Path) -> bool {
        report(self.kind(), "move_or_rename", self.try_move(src, dest))
    }

    fn delete_file(&self, path: &Path) -> bool {
        report(self.kind(), "delete_file", self.try_delete(path))
    }

    fn write_text(&self, dir: &Path, name: &str, content: &str) -> bool {
        report(self.kind(), "write_text", self.try_write_text(dir, name, content))
    }

    fn open_read_stream(&self, path: &Path) -> Option<Box<dyn Read + Send>> {
        let (grant, doc) = self.resolve(path)?;
        if grant.provider.is_directory(&doc) {
            return None;
        }
        grant.provider.open_read(&doc).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }
}

/// Document provider backed by a real directory. Ids are `/`-joined paths
/// relative to the mirror root; the root itself is the empty id.
#[derive(Debug, Clone)]
pub struct FsDocumentProvider {
    mirror: PathBuf,
}

impl FsDocumentProvider {
    pub fn new(mirror: impl Into<PathBuf>) -> Self {
        Self { mirror: mirror.into() }
    }

    fn path_of(&self, doc: &str) -> PathBuf {
        if doc.is_empty() {
            self.mirror.clone()
        } else {
            self.mirror.join(doc)
        }
    }

    fn child_id(parent: &str, name: &str) -> DocumentId {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent, name)
        }
    }

    fn parent_id(doc: &str) -> &str {
        doc.rfind('/').map_or("", |idx| &doc[..idx])
    }
}

impl DocumentProvider for FsDocumentProvider {
    fn root(&self) -> DocumentId {
        String::new()
    }

    fn find_child(&self, parent: &str, name: &str) -> Option<DocumentId> {
        let id = Self::child_id(parent, name);
        self.path_of(&id).exists().then_some(id)
    }

    fn is_directory(&self, doc: &str) -> bool {
        self.path_of(doc).is_dir()
    }

    fn create_directory(&self, parent: &str, name: &str) -> Result<DocumentId> {
        let id = Self::child_id(parent, name);
        fs::create_dir(self.path_of(&id)).with_context(|| format!("Failed to create document {}", id))?;
        Ok(id)
    }

    fn create_file(&self, parent: &str, name: &str) -> Result<DocumentId> {
        let id = Self::child_id(parent, name);
        File::create(self.path_of(&id)).with_context(|| format!("Failed to create document {}", id))?;
        Ok(id)
    }

    fn open_read(&self, doc: &str) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.path_of(doc)).with_context(|| format!("Failed to open document {}", doc))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, doc: &str) -> Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.path_of(doc))
            .with_context(|| format!("Failed to open document {} for writing", doc))?;
        Ok(Box::new(file))
    }

    fn delete(&self, doc: &str) -> Result<()> {
        let path = self.path_of(doc);
        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to delete document {}", doc))
    }

    fn rename(&self, doc: &str, new_name: &str) -> Result<DocumentId> {
        let id = Self::child_id(Self::parent_id(doc), new_name);
        fs::rename(self.path_of(doc), self.path_of(&id))
            .with_context(|| format!("Failed to rename document {} to {}", doc, new_name))?;
        Ok(id)
    }

    fn move_to(&self, doc: &str, new_parent: &str) -> Result<DocumentId> {
        let name = doc.rsplit('/').next().unwrap_or(doc);
        let id = Self::child_id(new_parent, name);
        fs::rename(self.path_of(doc), self.path_of(&id))
            .with_context(|| format!("Failed to move document {} under {}", doc, new_parent))?;
        Ok(id)
    }
}
