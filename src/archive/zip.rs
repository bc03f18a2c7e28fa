//! ZIP backend (zip crate).
//!
//! Entry names are decoded once per open: if every stored name is UTF-8 the
//! container is read as UTF-8, otherwise the whole container is decoded with
//! the configured legacy code page.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use encoding_rs::Encoding;
use tracing::{debug, warn};
use ::zip::result::ZipError;
use ::zip::ZipArchive;

use super::encoding;
use super::error::{mentions_password, PasswordError};
use super::progress::ProgressTracker;
use super::{copy_entry, selected, ArchiveEntry, ArchiveSettings};
use crate::paths;

fn open(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open ZIP: {}", path.display()))?;
    ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Failed to read ZIP: {}", path.display()))
}

fn zip_error(err: ZipError, path: &Path) -> anyhow::Error {
    let message = err.to_string();
    if mentions_password(&message) {
        PasswordError::new(path).into()
    } else {
        anyhow!(err).context(format!("ZIP error in {}", path.display()))
    }
}

/// Decoded, normalized names for every entry, in index order.
fn decoded_names<R: Read + Seek>(archive: &mut ZipArchive<R>, legacy: &'static Encoding) -> Result<Vec<String>> {
    let mut raw_names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        raw_names.push(file.name_raw().to_vec());
    }

    let legacy_needed = encoding::needs_legacy_charset(raw_names.iter().map(Vec::as_slice));
    if legacy_needed {
        debug!("ZIP names are not UTF-8, decoding with {}", legacy.name());
    }
    Ok(raw_names
        .iter()
        .map(|raw| {
            let name = if legacy_needed {
                encoding::decode_with(legacy, raw)
            } else {
                String::from_utf8_lossy(raw).into_owned()
            };
            paths::normalize_entry_path(&name)
        })
        .collect())
}

/// Run `f` over the decrypted data of entry `index`.
fn with_entry<R, T>(
    archive: &mut ZipArchive<R>,
    index: usize,
    password: Option<&str>,
    path: &Path,
    f: impl FnOnce(&mut dyn Read, bool) -> Result<T>,
) -> Result<T>
where
    R: Read + Seek,
{
    let encrypted = archive.by_index_raw(index)?.encrypted();
    let opened = if encrypted {
        let Some(pw) = password else {
            return Err(PasswordError::new(path).into());
        };
        archive.by_index_decrypt(index, pw.as_bytes())
    } else {
        archive.by_index(index)
    };
    let mut file = opened.map_err(|e| zip_error(e, path))?;
    f(&mut file, encrypted)
}

pub(super) fn list(path: &Path, settings: &ArchiveSettings) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open(path)?;
    let names = decoded_names(&mut archive, settings.legacy_charset)?;

    let mut entries = Vec::with_capacity(names.len());
    for (i, normalized_path) in names.into_iter().enumerate() {
        let file = archive.by_index_raw(i)?;
        if normalized_path.is_empty() {
            continue;
        }
        entries.push(ArchiveEntry {
            normalized_path,
            raw_path: String::from_utf8_lossy(file.name_raw()).into_owned(),
            is_encrypted: file.encrypted(),
            size_bytes: file.size(),
            is_dir: file.is_dir(),
        });
    }
    Ok(entries)
}

pub(super) fn extract(
    path: &Path,
    dest: &Path,
    wanted: Option<&HashSet<String>>,
    password: Option<&str>,
    settings: &ArchiveSettings,
    tracker: &mut ProgressTracker<'_>,
) -> Result<()> {
    let mut archive = open(path)?;
    let names = decoded_names(&mut archive, settings.legacy_charset)?;

    let mut total = 0u64;
    for (i, name) in names.iter().enumerate() {
        if selected(wanted, name) {
            total += archive.by_index_raw(i)?.size();
        }
    }
    tracker.set_total(total);

    for (i, name) in names.iter().enumerate() {
        if name.is_empty() || !selected(wanted, name) {
            continue;
        }
        let Some(out) = paths::safe_join(dest, name) else {
            warn!("Skipping unsafe entry path '{}' in {}", name, path.display());
            continue;
        };

        if archive.by_index_raw(i)?.is_dir() {
            fs::create_dir_all(&out)
                .with_context(|| format!("Failed to create directory: {}", out.display()))?;
            continue;
        }

        paths::ensure_parent_dirs(&out)
            .with_context(|| format!("Failed to create parent of: {}", out.display()))?;
        with_entry(&mut archive, i, password, path, |reader, encrypted| {
            let mut file = File::create(&out)
                .with_context(|| format!("Failed to create file: {}", out.display()))?;
            copy_entry(reader, &mut file, encrypted, path, tracker)
        })?;
    }
    Ok(())
}

pub(super) fn read_entry(
    path: &Path,
    target: &str,
    password: Option<&str>,
    settings: &ArchiveSettings,
) -> Result<Option<Vec<u8>>> {
    let mut archive = open(path)?;
    let names = decoded_names(&mut archive, settings.legacy_charset)?;

    let Some(index) = names.iter().position(|n| n == target) else {
        return Ok(None);
    };
    if archive.by_index_raw(index)?.is_dir() {
        return Ok(None);
    }

    let mut tracker = ProgressTracker::new(None, 0, settings.progress_interval);
    let data = with_entry(&mut archive, index, password, path, |reader, encrypted| {
        let mut buf = Vec::new();
        copy_entry(reader, &mut buf, encrypted, path, &mut tracker)?;
        Ok(buf)
    })?;
    Ok(Some(data))
}

pub(super) fn is_encrypted(path: &Path) -> Result<bool> {
    let mut archive = open(path)?;
    for i in 0..archive.len() {
        if archive.by_index_raw(i)?.encrypted() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Decrypts the first encrypted entry fully; ZipCrypto's one-byte check
/// passes wrong keys often enough that opening alone is not proof.
pub(super) fn validate_password(path: &Path, password: Option<&str>) -> Result<bool> {
    let mut archive = open(path)?;
    let mut first_encrypted = None;
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        if file.encrypted() && !file.is_dir() {
            first_encrypted = Some(i);
            break;
        }
    }

    let Some(index) = first_encrypted else {
        return Ok(true);
    };
    if password.is_none() {
        return Ok(false);
    }

    let mut tracker = ProgressTracker::new(None, 0, std::time::Duration::ZERO);
    let checked = with_entry(&mut archive, index, password, path, |reader, encrypted| {
        copy_entry(reader, &mut std::io::sink(), encrypted, path, &mut tracker)
    });
    match checked {
        Ok(_) => Ok(true),
        Err(e) if e.is::<PasswordError>() => Ok(false),
        Err(e) => Err(e),
    }
}
