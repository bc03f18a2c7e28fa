//! 7z backend (sevenz-rust2).
//!
//! 7z entry names are stored as UTF-16, so no code page recovery is needed.
//! Encryption is a property of a block's coder chain: an entry is encrypted
//! when the archive carries an AES coder and the entry has a data stream.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sevenz_rust2::{Archive, ArchiveReader, EncoderMethod, Password};
use tracing::{debug, warn};

use super::error::{mentions_password, PasswordError};
use super::progress::ProgressTracker;
use super::{copy_entry, dir_is_empty, selected, ArchiveEntry};
use crate::paths;

/// Upper bound on the buffer reserved from a header-declared entry size.
const MAX_PREALLOC: u64 = 1024 * 1024;

fn password_for(password: Option<&str>) -> Password {
    password.map(Password::from).unwrap_or_else(Password::empty)
}

fn sevenz_error(err: sevenz_rust2::Error, path: &Path) -> anyhow::Error {
    let message = format!("{:?}", err);
    if mentions_password(&message) {
        PasswordError::new(path).into()
    } else {
        anyhow!("7z error in {}: {}", path.display(), err)
    }
}

fn open(path: &Path, password: Option<&str>) -> Result<ArchiveReader<File>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open 7z archive: {}", path.display()))?;
    ArchiveReader::new(file, password_for(password)).map_err(|e| sevenz_error(e, path))
}

/// Metadata-only check for AES in any block's coder chain.
fn has_aes_coder(archive: &Archive) -> bool {
    archive.blocks.iter().any(|block| {
        block
            .coders
            .iter()
            .any(|coder| coder.encoder_method_id() == EncoderMethod::ID_AES256_SHA256)
    })
}

pub(super) fn list(path: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntry>> {
    let reader = open(path, password)?;
    let archive = reader.archive();
    let encrypted = has_aes_coder(archive);

    Ok(archive
        .files
        .iter()
        .filter_map(|entry| {
            let normalized_path = paths::normalize_entry_path(entry.name());
            if normalized_path.is_empty() {
                return None;
            }
            Some(ArchiveEntry {
                normalized_path,
                raw_path: entry.name().to_string(),
                is_encrypted: encrypted && entry.has_stream(),
                size_bytes: entry.size,
                is_dir: entry.is_directory(),
            })
        })
        .collect())
}

pub(super) fn extract(
    path: &Path,
    dest: &Path,
    wanted: Option<&HashSet<String>>,
    password: Option<&str>,
    tracker: &mut ProgressTracker<'_>,
) -> Result<()> {
    let encrypted = is_encrypted(path)?;
    if encrypted && !validate_password(path, password)? {
        return Err(PasswordError::new(path).into());
    }

    let mut reader = open(path, password)?;
    let total = reader
        .archive()
        .files
        .iter()
        .filter(|e| selected(wanted, &paths::normalize_entry_path(e.name())))
        .map(|e| e.size)
        .sum();
    tracker.set_total(total);

    let mut failure: Option<anyhow::Error> = None;
    let result = reader.for_each_entries(|entry, data| {
        let name = paths::normalize_entry_path(entry.name());
        if name.is_empty() || !selected(wanted, &name) {
            return Ok(true);
        }
        let Some(out) = paths::safe_join(dest, &name) else {
            warn!("Skipping unsafe entry path '{}' in {}", name, path.display());
            return Ok(true);
        };

        let written = if entry.is_directory() {
            fs::create_dir_all(&out)
                .with_context(|| format!("Failed to create directory: {}", out.display()))
        } else {
            paths::ensure_parent_dirs(&out)
                .with_context(|| format!("Failed to create parent of: {}", out.display()))
                .and_then(|_| {
                    File::create(&out)
                        .with_context(|| format!("Failed to create file: {}", out.display()))
                })
                .and_then(|mut file| copy_entry(data, &mut file, encrypted, path, tracker))
                .map(|_| ())
        };
        match written {
            Ok(()) => Ok(true),
            Err(e) => {
                failure = Some(e);
                Ok(false)
            }
        }
    });

    if let Some(e) = failure {
        return Err(e);
    }
    result.map_err(|e| sevenz_error(e, path))?;

    if encrypted && wanted.is_none() && dir_is_empty(dest) {
        debug!("Encrypted archive produced no files: {}", path.display());
        return Err(PasswordError::new(path).into());
    }
    Ok(())
}

pub(super) fn read_entry(path: &Path, target: &str, password: Option<&str>) -> Result<Option<Vec<u8>>> {
    let mut reader = open(path, password)?;
    let encrypted = has_aes_coder(reader.archive());
    let exists = reader
        .archive()
        .files
        .iter()
        .any(|e| !e.is_directory() && paths::normalize_entry_path(e.name()) == target);
    if !exists {
        return Ok(None);
    }

    let mut tracker = ProgressTracker::new(None, 0, Duration::ZERO);
    let mut found: Option<Result<Vec<u8>>> = None;
    let result = reader.for_each_entries(|entry, data| {
        if entry.is_directory() || paths::normalize_entry_path(entry.name()) != target {
            return Ok(true);
        }
        let mut buf = Vec::with_capacity(entry.size.min(MAX_PREALLOC) as usize);
        found = Some(copy_entry(data, &mut buf, encrypted, path, &mut tracker).map(|_| buf));
        Ok(false)
    });

    match found {
        Some(data) => data.map(Some),
        None => {
            result.map_err(|e| sevenz_error(e, path))?;
            Ok(None)
        }
    }
}

/// Encrypted when any block uses AES, or when the header itself is
/// encrypted and cannot be opened without a password.
pub(super) fn is_encrypted(path: &Path) -> Result<bool> {
    match open(path, None) {
        Ok(reader) => Ok(has_aes_coder(reader.archive())),
        Err(e) if e.is::<PasswordError>() => Ok(true),
        Err(e) => Err(e),
    }
}

/// Trial-decodes the first encrypted entry that has a data stream. A decode
/// failure on that stream means the key is wrong; failures outside the
/// stream (filesystem, truncated archive) fall through to the next entry.
pub(super) fn validate_password(path: &Path, password: Option<&str>) -> Result<bool> {
    if !is_encrypted(path)? {
        return Ok(true);
    }
    if password.is_none() {
        return Ok(false);
    }

    // An encrypted header that will not open under this key is a wrong key
    let mut reader = match open(path, password) {
        Ok(reader) => reader,
        Err(e) => {
            debug!("Encrypted 7z did not open with the given password: {:#}", e);
            return Ok(false);
        }
    };

    let mut tracker = ProgressTracker::new(None, 0, Duration::ZERO);
    let mut verdict: Option<bool> = None;
    let result = reader.for_each_entries(|entry, data| {
        if entry.is_directory() || !entry.has_stream() {
            return Ok(true);
        }
        match copy_entry(data, &mut std::io::sink(), true, path, &mut tracker) {
            Ok(_) => {
                verdict = Some(true);
                Ok(false)
            }
            Err(e) if e.is::<PasswordError>() => {
                verdict = Some(false);
                Ok(false)
            }
            Err(e) => {
                debug!("Trial decode of '{}' failed: {:#}", entry.name(), e);
                Ok(true)
            }
        }
    });

    if let Some(valid) = verdict {
        return Ok(valid);
    }
    match result {
        Err(e) if mentions_password(&format!("{:?}", e)) => Ok(false),
        _ => Ok(true),
    }
}
