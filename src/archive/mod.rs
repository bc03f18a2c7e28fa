//! Archive handling for mod packages.
//!
//! Provides one reader over ZIP (zip crate), 7z (sevenz-rust2) and RAR
//! (unrar) containers with password support, filename encoding recovery
//! and throttled progress reporting.
//!
//! Every operation opens the container, does its work and drops the handle
//! before returning. Only a wrong or missing password is propagated to the
//! caller; every other failure is logged and reported as `false` / `None`.

pub mod detect;
pub mod encoding;
pub mod error;
pub mod progress;
mod rar;
mod sevenzip;
mod zip;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use tracing::{debug, info, warn};

use crate::paths;

pub use detect::{classify, is_archive, ArchiveFormat};
pub use error::{ArchiveError, PasswordError};
pub use progress::ProgressListener;

use progress::ProgressTracker;

/// A decoded archive entry, buffered in memory.
pub type EntryStream = Box<dyn Read + Send>;

/// Information about a file in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path within the archive (forward slashes, NFC, recovered encoding)
    pub normalized_path: String,
    /// Name as stored in the container
    pub raw_path: String,
    /// Whether reading the entry's data needs a password
    pub is_encrypted: bool,
    /// Uncompressed size in bytes
    pub size_bytes: u64,
    /// Whether this is a directory record
    pub is_dir: bool,
}

/// Tunables shared by all archive backends.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSettings {
    /// Code page used when a ZIP container's names are not UTF-8
    pub legacy_charset: &'static Encoding,
    /// Minimum time between two progress updates
    pub progress_interval: Duration,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            legacy_charset: encoding_rs::GBK,
            progress_interval: Duration::from_millis(100),
        }
    }
}

/// Reader for mod archives.
///
/// Extractions into the same destination directory are serialized; calls
/// for different destinations run concurrently.
#[derive(Default)]
pub struct ArchiveReader {
    settings: ArchiveSettings,
    dest_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ArchiveReader {
    pub fn new(settings: ArchiveSettings) -> Self {
        Self {
            settings,
            dest_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    /// True if `path` is a regular file in a supported container format.
    pub fn detect_archive(&self, path: &Path) -> bool {
        is_archive(path)
    }

    /// Normalized paths of the non-directory entries, in archive order.
    pub fn list_entries(&self, path: &Path, password: Option<&str>) -> Result<Vec<String>, ArchiveError> {
        Ok(self
            .list_entry_details(path, password)?
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.normalized_path)
            .collect())
    }

    /// Full entry records, directories included.
    pub fn list_entry_details(
        &self,
        path: &Path,
        password: Option<&str>,
    ) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let result = match classify(path) {
            ArchiveFormat::Zip => zip::list(path, &self.settings),
            ArchiveFormat::SevenZip => sevenzip::list(path, password),
            ArchiveFormat::Rar => rar::list(path, password),
            ArchiveFormat::Unknown => return Err(ArchiveError::UnsupportedFormat(path.to_path_buf())),
        };
        result.map_err(|e| match e.downcast::<PasswordError>() {
            Ok(pw) => ArchiveError::Password(pw),
            Err(e) => ArchiveError::failed(path, e),
        })
    }

    /// Extract every entry of `path` into `dest`.
    ///
    /// An existing `dest` is left alone unless `overwrite` is set.
    pub fn extract_all(
        &self,
        path: &Path,
        dest: &Path,
        password: Option<&str>,
        overwrite: bool,
        progress: Option<&dyn ProgressListener>,
    ) -> Result<bool, PasswordError> {
        if dest.exists() && !overwrite {
            debug!("Destination {} exists, skipping extraction", dest.display());
            return Ok(true);
        }

        let format = classify(path);
        if !format.is_supported() {
            warn!("Not a supported archive: {}", path.display());
            return Ok(false);
        }
        // Nothing may be written before the key is known to be good
        if self.is_encrypted(path) && !self.validate_password(path, password) {
            let err = PasswordError::new(path);
            warn!("{}", err);
            return Err(err);
        }

        let lock = self.dest_lock(dest);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let created = !dest.exists();
            info!("Extracting {} archive {} -> {}", format, path.display(), dest.display());
            let mut tracker = ProgressTracker::new(progress, 0, self.settings.progress_interval);
            let result = fs::create_dir_all(dest)
                .with_context(|| format!("Failed to create destination: {}", dest.display()))
                .and_then(|_| match format {
                    ArchiveFormat::Zip => zip::extract(path, dest, None, password, &self.settings, &mut tracker),
                    ArchiveFormat::SevenZip => sevenzip::extract(path, dest, None, password, &mut tracker),
                    ArchiveFormat::Rar => rar::extract(path, dest, None, password, &mut tracker),
                    ArchiveFormat::Unknown => Ok(()),
                });

            let outcome = settle(path, result.map(|_| true));
            if matches!(outcome, Ok(true)) {
                tracker.finish();
            } else if created {
                // A partial tree would pass for a finished one on the next call
                if let Err(e) = fs::remove_dir_all(dest) {
                    debug!("Failed to remove partial destination {}: {}", dest.display(), e);
                }
            }
            outcome
        };
        self.release_dest_lock(dest, lock);
        outcome
    }

    /// Extract only `entries` (archive-relative paths) into `dest`.
    ///
    /// Returns `Ok(true)` without opening the archive when every target
    /// already exists and `overwrite` is not set. A requested entry that the
    /// archive does not contain makes the call return `Ok(false)`.
    pub fn extract_entries(
        &self,
        path: &Path,
        entries: &[String],
        dest: &Path,
        password: Option<&str>,
        overwrite: bool,
    ) -> Result<bool, PasswordError> {
        let mut wanted = HashSet::new();
        for entry in entries {
            let normalized = paths::normalize_for_lookup(entry);
            if paths::sanitize_relative(&normalized).is_none() {
                warn!("Refusing unsafe entry path '{}' for {}", entry, path.display());
                return Ok(false);
            }
            wanted.insert(normalized);
        }

        let all_present = wanted
            .iter()
            .all(|e| paths::safe_join(dest, e).is_some_and(|p| p.exists()));
        if all_present && !overwrite {
            debug!("All {} requested entries exist in {}", wanted.len(), dest.display());
            return Ok(true);
        }

        let listed = match self.list_entries(path, password) {
            Ok(listed) => listed,
            Err(ArchiveError::Password(e)) => return Err(e),
            Err(e) => {
                warn!("{}", e);
                return Ok(false);
            }
        };
        let available: HashSet<&str> = listed.iter().map(String::as_str).collect();
        if let Some(missing) = wanted.iter().find(|e| !available.contains(e.as_str())) {
            warn!("Entry '{}' not found in {}", missing, path.display());
            return Ok(false);
        }

        let format = classify(path);
        if !format.is_supported() {
            return Ok(false);
        }

        let lock = self.dest_lock(dest);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut tracker = ProgressTracker::new(None, 0, self.settings.progress_interval);
            let result = match format {
                ArchiveFormat::Zip => zip::extract(path, dest, Some(&wanted), password, &self.settings, &mut tracker),
                ArchiveFormat::SevenZip => sevenzip::extract(path, dest, Some(&wanted), password, &mut tracker),
                ArchiveFormat::Rar => rar::extract(path, dest, Some(&wanted), password, &mut tracker),
                ArchiveFormat::Unknown => Ok(()),
            };
            settle(path, result.map(|_| true))
        };
        self.release_dest_lock(dest, lock);
        outcome
    }

    /// Decode one entry into memory and hand it out as a reader.
    ///
    /// The container is closed before this returns. `Ok(None)` when the
    /// entry does not exist or cannot be read.
    pub fn open_entry_stream(
        &self,
        path: &Path,
        entry: &str,
        password: Option<&str>,
    ) -> Result<Option<EntryStream>, PasswordError> {
        let target = paths::normalize_for_lookup(entry);
        let result = match classify(path) {
            ArchiveFormat::Zip => zip::read_entry(path, &target, password, &self.settings),
            ArchiveFormat::SevenZip => sevenzip::read_entry(path, &target, password),
            ArchiveFormat::Rar => rar::read_entry(path, &target, password),
            ArchiveFormat::Unknown => return Ok(None),
        };
        let data = settle(path, result)?;
        Ok(data.map(|bytes| Box::new(Cursor::new(bytes)) as EntryStream))
    }

    /// True if any entry (or the header block) needs a password.
    pub fn is_encrypted(&self, path: &Path) -> bool {
        let result = match classify(path) {
            ArchiveFormat::Zip => zip::is_encrypted(path),
            ArchiveFormat::SevenZip => sevenzip::is_encrypted(path),
            ArchiveFormat::Rar => rar::is_encrypted(path),
            ArchiveFormat::Unknown => return false,
        };
        result.unwrap_or_else(|e| {
            warn!("Failed to inspect {}: {:#}", path.display(), e);
            false
        })
    }

    /// Check `password` against the archive.
    ///
    /// Unencrypted archives accept anything; encrypted ones reject a
    /// missing password.
    pub fn validate_password(&self, path: &Path, password: Option<&str>) -> bool {
        let result = match classify(path) {
            ArchiveFormat::Zip => zip::validate_password(path, password),
            ArchiveFormat::SevenZip => sevenzip::validate_password(path, password),
            ArchiveFormat::Rar => rar::validate_password(path, password),
            ArchiveFormat::Unknown => return false,
        };
        result.unwrap_or_else(|e| {
            warn!("Password check failed for {}: {:#}", path.display(), e);
            false
        })
    }

    fn dest_lock(&self, dest: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.dest_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(dest.to_path_buf()).or_default().clone()
    }

    /// Drop the caller's handle and forget the lock once nobody else holds
    /// or waits on it.
    fn release_dest_lock(&self, dest: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.dest_locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(dest).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(dest);
        }
    }

    #[cfg(test)]
    fn tracked_destinations(&self) -> usize {
        self.dest_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Split a backend result into the propagated password failure and the
/// logged-and-swallowed rest.
fn settle<T: Default>(path: &Path, result: Result<T>) -> Result<T, PasswordError> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => match e.downcast::<PasswordError>() {
            Ok(pw) => {
                warn!("{}", pw);
                Err(pw)
            }
            Err(e) => {
                warn!("Archive operation failed for {}: {:#}", path.display(), e);
                Ok(T::default())
            }
        },
    }
}

/// Copy one entry's data, reporting progress. Read failures on encrypted
/// entries mean the key was wrong.
pub(crate) fn copy_entry(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    encrypted: bool,
    archive: &Path,
    tracker: &mut ProgressTracker<'_>,
) -> Result<u64> {
    let mut buf = vec![0u8; 256 * 1024];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if encrypted || error::mentions_password(&e.to_string()) => {
                debug!("Read of encrypted entry failed: {}", e);
                return Err(PasswordError::new(archive).into());
            }
            Err(e) => return Err(e).context("Failed to read archive entry"),
        };
        writer.write_all(&buf[..n]).context("Failed to write extracted data")?;
        copied += n as u64;
        tracker.advance(n as u64);
    }
    Ok(copied)
}

/// Whether `name` (already normalized) is selected by the optional filter.
pub(crate) fn selected(wanted: Option<&HashSet<String>>, name: &str) -> bool {
    wanted.map_or(true, |w| w.contains(name))
}

/// True if `dir` has no entries at all.
pub(crate) fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).map_or(true, |mut it| it.next().is_none())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::path::Path;

    use ::zip::write::SimpleFileOptions;
    use ::zip::{AesMode, ZipWriter};

    /// Write a ZIP with the given `(name, content)` entries.
    pub fn write_zip(path: &Path, files: &[(&str, &[u8])], password: Option<&str>) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let mut options = SimpleFileOptions::default();
        if let Some(pw) = password {
            options = options.with_aes_encryption(AesMode::Aes256, pw);
        }
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    /// Write a 7z archive from a staging directory of `(name, content)` files.
    pub fn write_7z(path: &Path, files: &[(&str, &[u8])], password: Option<&str>) {
        let staging = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let target = staging.path().join(name);
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::write(target, content).unwrap();
        }
        match password {
            Some(pw) => sevenz_rust2::compress_to_path_encrypted(
                staging.path(),
                path,
                sevenz_rust2::Password::from(pw),
            )
            .unwrap(),
            None => sevenz_rust2::compress_to_path(staging.path(), path).unwrap(),
        }
    }
}
