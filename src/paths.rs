//! Archive-relative path handling.
//!
//! Archive entry names arrive with either separator and sometimes with
//! decomposed Unicode (macOS-built archives). This module handles:
//! - Converting `\` to `/` so every entry path is `/`-separated
//! - Comparing paths after NFC normalization
//! - Refusing entry paths that would escape an extraction root

use std::path::{Component, Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

/// Convert backslash separators to forward slashes
/// `Mods\Skins\hero.pak` -> `Mods/Skins/hero.pak`
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalize an archive entry name into the form handed to callers:
/// forward slashes, NFC, no leading `./` or `/`, no trailing `/`.
pub fn normalize_entry_path(path: &str) -> String {
    let unified: String = normalize_separators(path).nfc().collect();
    let trimmed = unified.trim_end_matches('/');
    let mut trimmed = trimmed.trim_start_matches('/');
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}

/// Normalize a path for lookups and comparisons (NFC, forward slashes, trimmed)
pub fn normalize_for_lookup(path: &str) -> String {
    normalize_entry_path(path)
}

/// Get the filename from a path (handles both / and \)
pub fn file_name(path: &str) -> &str {
    path.rfind(['\\', '/'])
        .map(|idx| &path[idx + 1..])
        .unwrap_or(path)
}

/// Get file extension (lowercase)
pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    name.rfind('.').map(|idx| name[idx + 1..].to_lowercase())
}

/// Turn an archive-relative path into a relative `PathBuf` with no `..`,
/// root or prefix components. Returns `None` for anything that would
/// resolve outside the directory it is joined to.
pub fn sanitize_relative(raw: &str) -> Option<PathBuf> {
    let unified = normalize_separators(raw);
    let mut clean = PathBuf::new();
    for comp in Path::new(&unified).components() {
        match comp {
            Component::Normal(v) => clean.push(v),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Join an archive-relative path under `root`, refusing escapes.
pub fn safe_join(root: &Path, raw: &str) -> Option<PathBuf> {
    let out = root.join(sanitize_relative(raw)?);
    out.starts_with(root).then_some(out)
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// True if `a` and `b` name the same existing file, through links and
/// relative components included.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Nearest ancestor of `path` (including itself) that exists on disk.
pub fn nearest_existing(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| !p.as_os_str().is_empty() && p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_separators() {
        assert_eq!(normalize_separators("Mods\\Skins\\hero.pak"), "Mods/Skins/hero.pak");
        assert_eq!(normalize_separators("already/unix/path"), "already/unix/path");
        assert_eq!(normalize_separators("mixed\\path/style"), "mixed/path/style");
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(normalize_entry_path("./Mods\\a.pak"), "Mods/a.pak");
        assert_eq!(normalize_entry_path("/root/dir/"), "root/dir");
        // "e" + combining acute composes to a single code point
        assert_eq!(normalize_entry_path("caf\u{0065}\u{0301}.txt"), "caf\u{00e9}.txt");
    }

    #[test]
    fn test_file_name_and_extension() {
        assert_eq!(file_name("Mods\\Skins\\hero.pak"), "hero.pak");
        assert_eq!(file_name("hero.pak"), "hero.pak");
        assert_eq!(extension("Mods/hero.PAK"), Some("pak".to_string()));
        assert_eq!(extension("noext"), None);
    }

    #[test]
    fn test_sanitize_relative_rejects_escapes() {
        assert_eq!(sanitize_relative("a/b/c.txt"), Some(PathBuf::from("a/b/c.txt")));
        assert_eq!(sanitize_relative("./a\\b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(sanitize_relative("../evil.txt"), None);
        assert_eq!(sanitize_relative("a/../../evil.txt"), None);
        assert_eq!(sanitize_relative("/etc/passwd"), None);
        assert_eq!(sanitize_relative(""), None);
    }

    #[test]
    fn test_safe_join() {
        let root = Path::new("/data/staging");
        assert_eq!(
            safe_join(root, "mods/a.pak"),
            Some(PathBuf::from("/data/staging/mods/a.pak"))
        );
        assert_eq!(safe_join(root, "../a.pak"), None);
    }

    #[test]
    fn test_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pak");
        std::fs::write(&file, b"a").unwrap();
        assert!(same_file(&file, &dir.path().join("./a.pak")));
        assert!(!same_file(&file, &dir.path().join("b.pak")));
    }

    #[test]
    fn test_nearest_existing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("x/y/z");
        assert_eq!(nearest_existing(&missing), Some(dir.path()));
    }
}
