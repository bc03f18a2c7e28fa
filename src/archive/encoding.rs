//! Filename encoding recovery for archive entries.
//!
//! ZIP archives built on Chinese-locale Windows store entry names in the
//! system code page without setting the UTF-8 flag. Reading those names as
//! UTF-8 (or CP437) produces mojibake, so names are recovered by trying a
//! fixed list of candidate encodings:
//! - UTF-8
//! - GBK (GB2312 is a subset and resolves to the same decoder)
//! - Big5
//! - ISO-8859-1 (windows-1252 in encoding_rs)
//!
//! A candidate only wins if the bytes decode cleanly *and* re-encode to the
//! identical bytes, so a lucky-but-wrong decode is rejected.

use std::borrow::Cow;

use encoding_rs::{Encoding, BIG5, GBK, UTF_8, WINDOWS_1252};

/// Candidate encodings in priority order.
pub const CANDIDATES: [&Encoding; 4] = [UTF_8, GBK, BIG5, WINDOWS_1252];

/// Labels accepted for the legacy ZIP code page setting.
pub const LEGACY_LABELS: [&str; 5] = ["GBK", "UTF-8", "GB2312", "Big5", "ISO-8859-1"];

/// Resolve an encoding label (`"GBK"`, `"Big5"`, `"ISO-8859-1"`, ...).
pub fn charset_for_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// Decode `raw` under `encoding` only if it decodes without errors and
/// encodes back to exactly the same bytes.
fn round_trip(encoding: &'static Encoding, raw: &[u8]) -> Option<String> {
    let decoded: Cow<'_, str> = encoding.decode_without_bom_handling_and_without_replacement(raw)?;
    let (encoded, _, unmappable) = encoding.encode(&decoded);
    if unmappable || encoded.as_ref() != raw {
        return None;
    }
    Some(decoded.into_owned())
}

/// Recover a readable name from raw filename bytes.
///
/// Bytes that are valid UTF-8 are returned unchanged. If no candidate
/// round-trips, the bytes are decoded lossily.
pub fn recover(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }
    CANDIDATES
        .iter()
        .skip(1)
        .find_map(|enc| round_trip(enc, raw))
        .unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned())
}

/// Whole-container decision: true when any name is not valid UTF-8 and
/// the container must be re-read with a legacy code page.
pub fn needs_legacy_charset<'a, I>(names: I) -> bool
where
    I: IntoIterator<Item = &'a [u8]>,
{
    names.into_iter().any(|raw| std::str::from_utf8(raw).is_err())
}

/// Decode a name with the container's chosen code page, falling back to
/// per-name recovery when that code page cannot represent it.
pub fn decode_with(encoding: &'static Encoding, raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        if encoding == UTF_8 || raw.is_ascii() {
            return s.to_string();
        }
    }
    round_trip(encoding, raw).unwrap_or_else(|| recover(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_is_unchanged() {
        for name in ["plain.txt", "模组/角色.pak", "café/naïve.txt", ""] {
            assert_eq!(recover(name.as_bytes()), name);
        }
    }

    #[test]
    fn test_gbk_names_recover() {
        // "中文.txt" in GBK
        let raw = [0xD6, 0xD0, 0xCE, 0xC4, b'.', b't', b'x', b't'];
        assert!(std::str::from_utf8(&raw).is_err());
        assert_eq!(recover(&raw), "中文.txt");
    }

    #[test]
    fn test_latin1_fallback() {
        // "café" in ISO-8859-1: a trailing 0xE9 is an incomplete GBK/Big5 sequence
        let raw = [b'c', b'a', b'f', 0xE9];
        assert_eq!(recover(&raw), "café");
    }

    #[test]
    fn test_labels_resolve() {
        for label in LEGACY_LABELS {
            assert!(charset_for_label(label).is_some(), "label {label}");
        }
        assert_eq!(charset_for_label("GB2312"), Some(GBK));
        assert_eq!(charset_for_label("ISO-8859-1"), Some(WINDOWS_1252));
        assert!(charset_for_label("not-a-charset").is_none());
    }

    #[test]
    fn test_needs_legacy_charset() {
        let utf8: Vec<&[u8]> = vec![b"a.txt", "目录/b.txt".as_bytes()];
        assert!(!needs_legacy_charset(utf8));

        let mixed: Vec<&[u8]> = vec![b"a.txt", &[0xD6, 0xD0]];
        assert!(needs_legacy_charset(mixed));
    }

    #[test]
    fn test_decode_with_container_charset() {
        let raw = [0xD6, 0xD0, 0xCE, 0xC4];
        assert_eq!(decode_with(GBK, &raw), "中文");
        assert_eq!(decode_with(GBK, b"ascii.pak"), "ascii.pak");
        // Incomplete GBK sequence falls back to per-name recovery
        assert_eq!(decode_with(GBK, &[b'c', b'a', b'f', 0xE9]), "café");
    }
}
