//! Archive container detection by magic bytes.
//!
//! Detection never trusts the extension, with one exception: Android
//! packages are ZIP containers on disk but must never be treated as mod
//! archives.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// `PK\x03\x04`
const ZIP_MAGIC: u32 = 0x504B_0304;
/// `7z\xBC\xAF`
const SEVEN_ZIP_MAGIC: u32 = 0x377A_BCAF;
/// `Rar!`
const RAR_MAGIC: u32 = 0x5261_7221;

/// Container format of an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    Zip,
    SevenZip,
    Rar,
    Unknown,
}

impl ArchiveFormat {
    pub fn is_supported(self) -> bool {
        self != ArchiveFormat::Unknown
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Classify the leading bytes of a file.
///
/// The first four bytes are read as a big-endian `u32`.
pub fn classify_bytes(header: &[u8]) -> ArchiveFormat {
    let Some(magic) = header.get(..4) else {
        return ArchiveFormat::Unknown;
    };
    match u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]) {
        ZIP_MAGIC => ArchiveFormat::Zip,
        SEVEN_ZIP_MAGIC => ArchiveFormat::SevenZip,
        RAR_MAGIC => ArchiveFormat::Rar,
        _ => ArchiveFormat::Unknown,
    }
}

/// Classify a file on disk. Missing, unreadable and short files are `Unknown`.
pub fn classify(path: &Path) -> ArchiveFormat {
    let is_apk = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("apk"));
    if is_apk {
        return ArchiveFormat::Unknown;
    }

    let Ok(mut file) = File::open(path) else {
        return ArchiveFormat::Unknown;
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => classify_bytes(&magic),
        Err(_) => ArchiveFormat::Unknown,
    }
}

/// True for a regular file whose content is a supported container.
pub fn is_archive(path: &Path) -> bool {
    path.is_file() && classify(path).is_supported()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_classify_bytes() {
        assert_eq!(classify_bytes(b"PK\x03\x04rest"), ArchiveFormat::Zip);
        assert_eq!(classify_bytes(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]), ArchiveFormat::SevenZip);
        assert_eq!(classify_bytes(b"Rar!\x1A\x07\x00"), ArchiveFormat::Rar);
        assert_eq!(classify_bytes(b"PK\x05\x06"), ArchiveFormat::Unknown);
        assert_eq!(classify_bytes(b"PK"), ArchiveFormat::Unknown);
        assert_eq!(classify_bytes(b""), ArchiveFormat::Unknown);
    }

    #[test]
    fn test_classify_files() {
        let dir = tempdir().unwrap();

        let rar = dir.path().join("mod.bin");
        fs::write(&rar, b"Rar!\x1A\x07\x01\x00").unwrap();
        assert_eq!(classify(&rar), ArchiveFormat::Rar);

        let text = dir.path().join("readme.zip");
        fs::write(&text, b"hello world").unwrap();
        assert_eq!(classify(&text), ArchiveFormat::Unknown);

        let short = dir.path().join("short.7z");
        fs::write(&short, b"7z").unwrap();
        assert_eq!(classify(&short), ArchiveFormat::Unknown);

        assert_eq!(classify(&dir.path().join("missing.zip")), ArchiveFormat::Unknown);
    }

    #[test]
    fn test_apk_is_never_an_archive() {
        let dir = tempdir().unwrap();
        for name in ["game.apk", "game.APK"] {
            let apk = dir.path().join(name);
            fs::write(&apk, b"PK\x03\x04....").unwrap();
            assert_eq!(classify(&apk), ArchiveFormat::Unknown);
            assert!(!is_archive(&apk));
        }
    }

    #[test]
    fn test_is_archive_requires_regular_file() {
        let dir = tempdir().unwrap();
        assert!(!is_archive(dir.path()));

        let zip = dir.path().join("a.zip");
        fs::write(&zip, b"PK\x03\x04").unwrap();
        assert!(is_archive(&zip));
    }
}
