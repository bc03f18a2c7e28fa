//! RAR backend (unrar).
//!
//! unrar walks the archive with a typestate cursor: every header must be
//! either processed or skipped before the next one can be read. RAR names
//! are stored as Unicode, so no code page recovery is needed.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use unrar::error::UnrarError;
use unrar::Archive;

use super::error::{mentions_password, PasswordError};
use super::progress::ProgressTracker;
use super::{selected, ArchiveEntry};
use crate::paths;

fn archive<'a>(path: &'a Path, password: Option<&'a str>) -> Archive<'a> {
    match password {
        Some(pw) => Archive::with_password(path, pw),
        None => Archive::new(path),
    }
}

/// Wrong keys surface as `BadPassword` on RAR5 and as corrupt data on RAR4
/// encrypted entries.
fn rar_error(err: UnrarError, path: &Path, encrypted: bool) -> anyhow::Error {
    let message = format!("{:?} {}", err, err);
    if mentions_password(&message) || (encrypted && message.contains("BadData")) {
        PasswordError::new(path).into()
    } else {
        anyhow!("RAR error in {}: {}", path.display(), err)
    }
}

pub(super) fn list(path: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntry>> {
    let listing = archive(path, password)
        .open_for_listing()
        .map_err(|e| rar_error(e, path, false))?;

    let mut entries = Vec::new();
    for header in listing {
        let header = header.map_err(|e| rar_error(e, path, false))?;
        let raw_path = header.filename.to_string_lossy().into_owned();
        let normalized_path = paths::normalize_entry_path(&raw_path);
        if normalized_path.is_empty() {
            continue;
        }
        entries.push(ArchiveEntry {
            normalized_path,
            raw_path,
            is_encrypted: header.is_encrypted(),
            size_bytes: header.unpacked_size,
            is_dir: header.is_directory(),
        });
    }
    Ok(entries)
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

    let total = list(path, password)?
        .iter()
        .filter(|e| selected(wanted, &e.normalized_path))
        .map(|e| e.size_bytes)
        .sum();
    tracker.set_total(total);

    let opened = archive(path, password)
        .open_for_processing()
        .map_err(|e| rar_error(e, path, encrypted))?;

    let mut extracted = 0usize;
    let mut cursor = Some(opened);
    while let Some(archive) = cursor.take() {
        let Some(entry) = archive.read_header().map_err(|e| rar_error(e, path, encrypted))? else {
            break;
        };

        let header = entry.entry();
        let name = paths::normalize_entry_path(&header.filename.to_string_lossy());
        let size = header.unpacked_size;
        let is_dir = header.is_directory();
        let entry_encrypted = header.is_encrypted();
        let target = if name.is_empty() || !selected(wanted, &name) {
            None
        } else {
            let out = paths::safe_join(dest, &name);
            if out.is_none() {
                warn!("Skipping unsafe entry path '{}' in {}", name, path.display());
            }
            out
        };

        let Some(out) = target else {
            cursor = Some(entry.skip().map_err(|e| rar_error(e, path, encrypted))?);
            continue;
        };

        if is_dir {
            fs::create_dir_all(&out)
                .with_context(|| format!("Failed to create directory: {}", out.display()))?;
            cursor = Some(entry.skip().map_err(|e| rar_error(e, path, encrypted))?);
            continue;
        }

        paths::ensure_parent_dirs(&out)
            .with_context(|| format!("Failed to create parent of: {}", out.display()))?;
        cursor = Some(
            entry
                .extract_to(&out)
                .map_err(|e| rar_error(e, path, entry_encrypted))?,
        );
        extracted += 1;
        tracker.advance(size);
    }

    debug!("Extracted {} RAR entries from {}", extracted, path.display());
    if encrypted && wanted.is_none() && extracted == 0 {
        return Err(PasswordError::new(path).into());
    }
    Ok(())
}

pub(super) fn read_entry(path: &Path, target: &str, password: Option<&str>) -> Result<Option<Vec<u8>>> {
    let opened = archive(path, password)
        .open_for_processing()
        .map_err(|e| rar_error(e, path, false))?;

    let mut cursor = Some(opened);
    while let Some(archive) = cursor.take() {
        let Some(entry) = archive.read_header().map_err(|e| rar_error(e, path, false))? else {
            break;
        };
        let header = entry.entry();
        let matches = header.is_file()
            && paths::normalize_entry_path(&header.filename.to_string_lossy()) == target;
        if matches {
            let encrypted = header.is_encrypted();
            let (data, _rest) = entry.read().map_err(|e| rar_error(e, path, encrypted))?;
            return Ok(Some(data));
        }
        cursor = Some(entry.skip().map_err(|e| rar_error(e, path, false))?);
    }
    Ok(None)
}

/// Encrypted when any file header is flagged, or when the headers
/// themselves cannot be listed without a password.
pub(super) fn is_encrypted(path: &Path) -> Result<bool> {
    match list(path, None) {
        Ok(entries) => Ok(entries.iter().any(|e| e.is_encrypted)),
        Err(e) if e.is::<PasswordError>() => Ok(true),
        Err(e) => Err(e),
    }
}

/// Tests encrypted entries in order until one decodes (valid) or fails
/// with a password error (invalid). Other failures move on to the next
/// encrypted entry, reopening the archive since unrar consumes the cursor.
pub(super) fn validate_password(path: &Path, password: Option<&str>) -> Result<bool> {
    if !is_encrypted(path)? {
        return Ok(true);
    }
    let Some(password) = password else {
        return Ok(false);
    };

    let entries = match list(path, Some(password)) {
        Ok(entries) => entries,
        Err(e) if e.is::<PasswordError>() => return Ok(false),
        Err(e) => return Err(e),
    };
    let candidates: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_encrypted && !e.is_dir)
        .map(|(i, _)| i)
        .collect();

    for index in candidates {
        match test_entry(path, password, index) {
            Ok(()) => return Ok(true),
            Err(e) if e.is::<PasswordError>() => return Ok(false),
            Err(e) => debug!("Trial decode of RAR entry {} failed: {:#}", index, e),
        }
    }
    Ok(true)
}

/// Decode the `index`-th header's data without writing it anywhere.
fn test_entry(path: &Path, password: &str, index: usize) -> Result<()> {
    let opened = archive(path, Some(password))
        .open_for_processing()
        .map_err(|e| rar_error(e, path, true))?;

    let mut cursor = Some(opened);
    let mut position = 0usize;
    while let Some(archive) = cursor.take() {
        let Some(entry) = archive.read_header().map_err(|e| rar_error(e, path, true))? else {
            break;
        };
        // Empty names are skipped by list(), keep the indices aligned
        if paths::normalize_entry_path(&entry.entry().filename.to_string_lossy()).is_empty() {
            cursor = Some(entry.skip().map_err(|e| rar_error(e, path, false))?);
            continue;
        }
        if position == index {
            entry.test().map_err(|e| rar_error(e, path, true))?;
            return Ok(());
        }
        position += 1;
        cursor = Some(entry.skip().map_err(|e| rar_error(e, path, false))?);
    }
    Err(anyhow!("RAR entry {} not found in {}", index, path.display()))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use crate::archive::{classify, ArchiveError, ArchiveFormat, ArchiveReader};

    /// RAR4, one stored entry `VERSION`
    const PLAIN: &[u8] = include_bytes!("testdata/plain.rar");
    /// RAR4, `.gitignore` encrypted with `unrar`, headers readable
    const ENCRYPTED_ENTRIES: &[u8] = include_bytes!("testdata/encrypted-entries.rar");
    /// RAR5, headers and data encrypted with `password`
    const ENCRYPTED_HEADERS: &[u8] = include_bytes!("testdata/encrypted-headers.rar");

    const GITIGNORE: &[u8] = b"target\nCargo.lock\n";

    fn fixture(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn read_stream(reader: &ArchiveReader, path: &Path, entry: &str, password: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::new();
        reader
            .open_entry_stream(path, entry, password)
            .unwrap()
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_plain_rar() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "plain.rar", PLAIN);
        let reader = ArchiveReader::default();

        assert_eq!(classify(&path), ArchiveFormat::Rar);
        assert_eq!(reader.list_entries(&path, None).unwrap(), vec!["VERSION".to_string()]);
        let details = reader.list_entry_details(&path, None).unwrap();
        assert_eq!(details[0].size_bytes, 11);
        assert!(!details[0].is_encrypted);

        assert!(!reader.is_encrypted(&path));
        assert!(reader.validate_password(&path, None));
        assert!(reader.validate_password(&path, Some("anything")));

        let dest = dir.path().join("all");
        assert_eq!(reader.extract_all(&path, &dest, None, false, None), Ok(true));
        assert_eq!(fs::read(dest.join("VERSION")).unwrap(), b"unrar-0.4.0");

        let dest = dir.path().join("some");
        let wanted = vec!["VERSION".to_string()];
        assert_eq!(reader.extract_entries(&path, &wanted, &dest, None, false), Ok(true));
        assert_eq!(fs::read(dest.join("VERSION")).unwrap(), b"unrar-0.4.0");
        let missing = vec!["CHANGELOG".to_string()];
        assert_eq!(reader.extract_entries(&path, &missing, &dest, None, false), Ok(false));

        assert_eq!(read_stream(&reader, &path, "VERSION", None), b"unrar-0.4.0");
        assert!(reader.open_entry_stream(&path, "CHANGELOG", None).unwrap().is_none());
    }

    #[test]
    fn test_rar_with_encrypted_entries() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "locked.rar", ENCRYPTED_ENTRIES);
        let reader = ArchiveReader::default();

        // Names are readable without the key
        let details = reader.list_entry_details(&path, None).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].normalized_path, ".gitignore");
        assert!(details[0].is_encrypted);

        assert!(reader.is_encrypted(&path));
        assert!(!reader.validate_password(&path, None));
        assert!(!reader.validate_password(&path, Some("wrong")));
        assert!(reader.validate_password(&path, Some("unrar")));

        assert!(reader.open_entry_stream(&path, ".gitignore", None).is_err());
        assert_eq!(read_stream(&reader, &path, ".gitignore", Some("unrar")), GITIGNORE);

        let dest = dir.path().join("out");
        assert!(reader.extract_all(&path, &dest, Some("wrong"), false, None).is_err());
        assert!(!dest.exists());
        assert_eq!(reader.extract_all(&path, &dest, Some("unrar"), false, None), Ok(true));
        assert_eq!(fs::read(dest.join(".gitignore")).unwrap(), GITIGNORE);
    }

    #[test]
    fn test_rar_with_encrypted_headers() {
        let dir = tempdir().unwrap();
        let path = fixture(dir.path(), "hidden.rar", ENCRYPTED_HEADERS);
        let reader = ArchiveReader::default();

        assert!(matches!(reader.list_entries(&path, None), Err(ArchiveError::Password(_))));
        assert!(reader.is_encrypted(&path));
        assert!(!reader.validate_password(&path, None));
        assert!(reader.validate_password(&path, Some("password")));
        assert_eq!(
            reader.list_entries(&path, Some("password")).unwrap(),
            vec![".gitignore".to_string()]
        );

        let dest = dir.path().join("out");
        assert!(reader.extract_all(&path, &dest, None, false, None).is_err());
        assert!(!dest.exists());
        assert_eq!(reader.extract_all(&path, &dest, Some("password"), false, None), Ok(true));
        assert_eq!(fs::read(dest.join(".gitignore")).unwrap(), GITIGNORE);
    }
}
