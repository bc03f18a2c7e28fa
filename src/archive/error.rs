//! Archive error types.

use std::path::PathBuf;

use thiserror::Error;

/// The archive is encrypted and the supplied password (or its absence)
/// cannot decrypt it. This is the one condition archive operations
/// propagate instead of degrading to `false`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("wrong or missing password for archive: {}", path.display())]
pub struct PasswordError {
    pub path: PathBuf,
}

impl PasswordError {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Failures surfaced by listing operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a supported archive: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error("failed to read archive {}: {reason}", path.display())]
    Failed { path: PathBuf, reason: String },
}

impl ArchiveError {
    pub fn failed(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ArchiveError::Failed {
            path: path.into(),
            reason: format!("{:#}", err),
        }
    }
}

/// Heuristic used for backends whose error types only describe password
/// problems in their message text.
pub fn mentions_password(message: &str) -> bool {
    const MARKERS: [&str; 7] = [
        "password",
        "Password",
        "encrypted",
        "WrongPassword",
        "InvalidPassword",
        "BadPassword",
        "ERAR_BAD_PASSWORD",
    ];
    MARKERS.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_password() {
        assert!(mentions_password("MaybeBadPassword(Io(...))"));
        assert!(mentions_password("PasswordRequired"));
        assert!(mentions_password("ERAR_BAD_PASSWORD"));
        assert!(!mentions_password("unexpected end of file"));
    }

    #[test]
    fn test_password_error_converts() {
        let err: ArchiveError = PasswordError::new("/tmp/a.7z").into();
        assert!(matches!(err, ArchiveError::Password(_)));
        assert!(err.to_string().contains("/tmp/a.7z"));
    }
}
