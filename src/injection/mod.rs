//! Game-specific mod placement.
//!
//! A [`GameInjection`] strategy knows how one family of games expects mod
//! files to appear: plain file replacement ([`copy::CopyInjection`]) or a
//! pak manifest the game checks at startup ([`manifest::ManifestInjection`]).
//! Strategies only see the archive reader, one resolved file backend and
//! the game's paths, bundled in an [`InjectionContext`].

pub mod copy;
pub mod manifest;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{self, ArchiveReader, EntryStream, PasswordError};
use crate::fileops::FileOperations;
use crate::paths;

pub use copy::CopyInjection;
pub use manifest::ManifestInjection;

/// Result of the pre-launch check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Success,
    NoPermission,
    /// The game's versioned data directory is gone or locked, usually after an update
    GameUpdated,
}

impl std::fmt::Display for StartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartStatus::Success => write!(f, "success"),
            StartStatus::NoPermission => write!(f, "no permission"),
            StartStatus::GameUpdated => write!(f, "game updated"),
        }
    }
}

/// Which strategy a game uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionKind {
    #[default]
    Copy,
    Manifest,
}

/// The target game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub package_name: String,
    /// Installed version string, e.g. `1.4.2.1837`
    pub version: String,
    /// The game's private data directory (`.../Android/data/<package>`)
    pub game_path: PathBuf,
    /// Where mod files are placed
    pub mod_dir: PathBuf,
    #[serde(default)]
    pub injection: InjectionKind,
}

/// One mod: a source (archive, directory or single file) and the files it provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModPackage {
    pub name: String,
    pub source: PathBuf,
    /// Entry paths inside the archive, or paths relative to a source directory
    pub files: Vec<String>,
    pub password: Option<String>,
    /// Directory the archive was extracted into, if it was
    pub staged_dir: Option<PathBuf>,
}

impl ModPackage {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>, files: Vec<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            files,
            password: None,
            staged_dir: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_staged_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staged_dir = Some(dir.into());
        self
    }

    pub fn is_archive(&self) -> bool {
        archive::is_archive(&self.source)
    }

    /// A local file holding `entry`'s content, if one exists without
    /// touching the archive.
    pub fn local_file(&self, entry: &str) -> Option<PathBuf> {
        if let Some(staged) = self
            .staged_dir
            .as_deref()
            .and_then(|dir| paths::safe_join(dir, entry))
            .filter(|p| p.is_file())
        {
            return Some(staged);
        }
        if self.source.is_dir() {
            return paths::safe_join(&self.source, entry).filter(|p| p.is_file());
        }
        if self.source.is_file() && !self.is_archive() {
            return Some(self.source.clone());
        }
        None
    }

    /// Read `entry` from wherever it lives: staged copy, loose file or the
    /// archive itself.
    pub fn open_entry(&self, archives: &ArchiveReader, entry: &str) -> Result<Option<EntryStream>, PasswordError> {
        if let Some(local) = self.local_file(entry) {
            return Ok(File::open(&local).ok().map(|f| Box::new(f) as EntryStream));
        }
        if !self.is_archive() {
            return Ok(None);
        }
        archives.open_entry_stream(&self.source, entry, self.password.as_deref())
    }
}

/// Everything a strategy may use.
pub struct InjectionContext<'a> {
    pub archives: &'a ArchiveReader,
    /// Backend resolved for the game's data directory; `None` when access was denied
    pub files: Option<Arc<dyn FileOperations>>,
    /// Scratch space for archive entries that must exist as files
    pub staging_dir: PathBuf,
    /// Originals displaced by enabled mods
    pub backup_dir: PathBuf,
    /// App-private state such as per-game manifests
    pub state_dir: PathBuf,
}

impl InjectionContext<'_> {
    /// Backup location of a game file displaced by a mod.
    pub fn backup_path(&self, game: &GameInfo, file_name: &str) -> PathBuf {
        self.backup_dir.join(&game.package_name).join(file_name)
    }

    pub fn staging_for(&self, package: &ModPackage) -> PathBuf {
        self.staging_dir.join(staging_key(&package.source))
    }
}

/// Per-game placement strategy.
pub trait GameInjection: Send + Sync {
    /// Place `package`'s files for `game`. Only a password failure is an error.
    fn enable(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage)
        -> Result<bool, PasswordError>;

    /// Undo [`GameInjection::enable`].
    fn disable(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage) -> bool;

    /// Check the game can be launched with mods in place.
    fn before_start_game(&self, ctx: &InjectionContext<'_>, game: &GameInfo) -> StartStatus;

    /// Work to do while the game is starting up.
    fn on_game_started(&self, _ctx: &InjectionContext<'_>, _game: &GameInfo) -> bool {
        true
    }
}

/// The strategy for `kind`.
pub fn strategy(kind: InjectionKind, write_window: Duration) -> Box<dyn GameInjection> {
    match kind {
        InjectionKind::Copy => Box::new(CopyInjection),
        InjectionKind::Manifest => Box::new(ManifestInjection::new(write_window)),
    }
}

/// Staging directory name for `source`: its file name plus a short digest of
/// the full path, so sources sharing a stem never share a directory.
pub fn staging_key(source: &Path) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mod".to_string());
    let digest = format!("{:x}", md5::compute(source.to_string_lossy().as_bytes()));
    format!("{}-{}", name, &digest[..8])
}

/// Target of `entry` inside the game's mod directory. Mods are flattened by file name.
pub(crate) fn target_in(game: &GameInfo, entry: &str) -> Option<PathBuf> {
    let name = paths::file_name(entry);
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(game.mod_dir.join(name))
}
