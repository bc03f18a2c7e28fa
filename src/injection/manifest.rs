//! Pak-manifest injection.
//!
//! Some games load only the paks listed in a `manifest.json` inside their
//! data directory and rewrite that file from the server on startup. Mod
//! files are placed like [`super::CopyInjection`] places them, and are also
//! recorded in a per-game manifest in app-private state. When the
//! game launches, their entries are merged into the live manifest, which is
//! then rewritten repeatedly for a bounded window so the game's own update
//! does not drop them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{target_in, CopyInjection, GameInfo, GameInjection, InjectionContext, ModPackage, StartStatus};
use crate::archive::PasswordError;
use crate::hash::{self, ContentDigest};
use crate::paths;

pub const MANIFEST_NAME: &str = "manifest.json";

/// Delay between two rewrites of the live manifest.
const REWRITE_PAUSE: Duration = Duration::from_millis(50);

static VERSION_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    pub version: String,
    pub project_version: String,
    pub path_offset: String,
    #[serde(rename = "bUserCache")]
    pub user_cache: bool,
    pub paks: Vec<Pak>,
    /// Fields this tool does not interpret, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: "1.0".into(),
            project_version: "1.0".into(),
            path_offset: String::new(),
            user_cache: true,
            paks: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pak {
    pub name: String,
    pub hash: String,
    pub size_in_bytes: u64,
    #[serde(rename = "bPrimary")]
    pub primary: bool,
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub diff_size_bytes: u64,
}

impl Pak {
    fn from_digest(name: &str, digest: ContentDigest) -> Self {
        Self {
            name: name.to_string(),
            hash: digest.md5,
            size_in_bytes: digest.size,
            primary: false,
            base: String::new(),
            diff: String::new(),
            diff_size_bytes: 0,
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load, or start empty if the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        paths::ensure_parent_dirs(path)?;
        fs::write(path, serde_json::to_string(self)?).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Put `paks` in front of the existing list, skipping exact duplicates.
    pub fn prepend(&mut self, paks: &[Pak]) {
        for pak in paks {
            if !self.paks.contains(pak) {
                self.paks.insert(0, pak.clone());
            }
        }
    }
}

/// The versioned data directory name: `x.y.0` for a version starting `x.y.z`.
pub fn version_dir(version: &str) -> Option<String> {
    let re = VERSION_RE.get_or_init(|| Regex::new(r"^(\d+)\.(\d+)\.\d+").unwrap());
    let caps = re.captures(version)?;
    Some(format!("{}.{}.0", &caps[1], &caps[2]))
}

/// Strategy for games that verify paks against a manifest.
#[derive(Debug, Clone)]
pub struct ManifestInjection {
    write_window: Duration,
}

impl ManifestInjection {
    pub fn new(write_window: Duration) -> Self {
        Self { write_window }
    }

    /// The manifest of enabled mods for `game`, kept in app-private state.
    pub fn mod_manifest_path(ctx: &InjectionContext<'_>, game: &GameInfo) -> PathBuf {
        ctx.state_dir.join(&game.package_name).join(MANIFEST_NAME)
    }

    fn files_dir(game: &GameInfo) -> PathBuf {
        game.game_path.join("files")
    }

    /// Add the package's paks to the per-game manifest.
    fn record(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage) -> Result<bool, PasswordError> {
        let manifest_path = Self::mod_manifest_path(ctx, game);
        let mut manifest = match Manifest::load_or_default(&manifest_path) {
            Ok(m) => m,
            Err(e) => {
                warn!("{:#}", e);
                return Ok(false);
            }
        };

        for entry in &package.files {
            let Some(digest) = Self::digest(ctx, game, package, entry)? else {
                warn!("Entry '{}' of {} could not be read", entry, package.name);
                return Ok(false);
            };
            let name = paths::file_name(entry);
            manifest.paks.retain(|p| p.name != name);
            manifest.paks.push(Pak::from_digest(name, digest));
        }

        match manifest.save(&manifest_path) {
            Ok(()) => {
                info!("Recorded {} paks of {} for {}", package.files.len(), package.name, game.package_name);
                Ok(true)
            }
            Err(e) => {
                warn!("{:#}", e);
                Ok(false)
            }
        }
    }

    /// Drop the package's paks from the per-game manifest.
    fn forget(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage) -> bool {
        let manifest_path = Self::mod_manifest_path(ctx, game);
        if !manifest_path.exists() {
            return true;
        }
        let result = Manifest::load(&manifest_path).and_then(|mut manifest| {
            manifest
                .paks
                .retain(|pak| !package.files.iter().any(|f| paths::file_name(f) == pak.name));
            manifest.save(&manifest_path)
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        }
    }

    /// Digest of `entry` as placed in the game, falling back to the mod's
    /// own copy.
    fn digest(
        ctx: &InjectionContext<'_>,
        game: &GameInfo,
        package: &ModPackage,
        entry: &str,
    ) -> Result<Option<ContentDigest>, PasswordError> {
        let placed = ctx
            .files
            .as_deref()
            .zip(target_in(game, entry))
            .and_then(|(ops, target)| ops.open_read_stream(&target));
        if let Some(mut stream) = placed {
            match hash::md5_reader(&mut stream) {
                Ok(digest) => return Ok(Some(digest)),
                Err(e) => debug!("{:#}, hashing the mod's copy instead", e),
            }
        }
        if let Some(local) = package.local_file(entry) {
            match hash::md5_file(&local) {
                Ok(digest) => return Ok(Some(digest)),
                Err(e) => debug!("{:#}, reading from archive instead", e),
            }
        }
        let Some(mut stream) = package.open_entry(ctx.archives, entry)? else {
            return Ok(None);
        };
        match hash::md5_reader(&mut stream) {
            Ok(digest) => Ok(Some(digest)),
            Err(e) => {
                warn!("Failed to hash '{}' of {}: {:#}", entry, package.name, e);
                Ok(None)
            }
        }
    }
}

impl GameInjection for ManifestInjection {
    fn enable(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage) -> Result<bool, PasswordError> {
        if !CopyInjection.enable(ctx, game, package)? {
            return Ok(false);
        }
        let recorded = self.record(ctx, game, package);
        if !matches!(recorded, Ok(true)) {
            // Paks the manifest does not list would only confuse the game
            CopyInjection.disable(ctx, game, package);
        }
        recorded
    }

    fn disable(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage) -> bool {
        let removed = CopyInjection.disable(ctx, game, package);
        self.forget(ctx, game, package) && removed
    }

    fn before_start_game(&self, ctx: &InjectionContext<'_>, game: &GameInfo) -> StartStatus {
        let Some(ops) = ctx.files.as_deref() else {
            return StartStatus::NoPermission;
        };
        let mut dir = Self::files_dir(game);
        if let Some(name) = version_dir(&game.version) {
            dir.push(name);
        }
        // A freshly updated game recreates this directory with other owners
        let probe = dir.join("test");
        if !ops.create_directory(&probe) {
            return StartStatus::GameUpdated;
        }
        ops.delete_file(&probe);
        StartStatus::Success
    }

    fn on_game_started(&self, ctx: &InjectionContext<'_>, game: &GameInfo) -> bool {
        let Some(ops) = ctx.files.as_deref() else {
            return false;
        };
        let mod_paks = match Manifest::load_or_default(&Self::mod_manifest_path(ctx, game)) {
            Ok(m) => m.paks,
            Err(e) => {
                warn!("{:#}", e);
                return false;
            }
        };
        if mod_paks.is_empty() {
            return true;
        }

        let files_dir = Self::files_dir(game);
        let live = ops
            .read_text(&files_dir.join(MANIFEST_NAME))
            .map(|text| Manifest::parse(&text))
            .transpose();
        let mut manifest = match live {
            Ok(m) => m.unwrap_or_default(),
            Err(e) => {
                warn!("Live manifest of {} is unreadable: {:#}", game.package_name, e);
                return false;
            }
        };
        manifest.prepend(&mod_paks);
        let json = match serde_json::to_string(&manifest) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize manifest: {}", e);
                return false;
            }
        };

        info!("Injecting {} paks into {}", mod_paks.len(), game.package_name);
        let started = Instant::now();
        let mut writes = 0u32;
        loop {
            if ops.write_text(&files_dir, MANIFEST_NAME, &json) {
                writes += 1;
            }
            if started.elapsed() >= self.write_window {
                break;
            }
            thread::sleep(REWRITE_PAUSE);
        }
        debug!("Manifest rewritten {} times", writes);
        writes > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::write_zip;
    use crate::archive::ArchiveReader;
    use crate::fileops::DirectFileOps;
    use crate::injection::InjectionKind;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn game(root: &Path) -> GameInfo {
        let game_path = root.join("Android/data/com.snow");
        GameInfo {
            package_name: "com.snow".into(),
            version: "1.4.7.2091".into(),
            mod_dir: game_path.join("files/Paks"),
            game_path,
            injection: InjectionKind::Manifest,
        }
    }

    fn context<'a>(reader: &'a ArchiveReader, root: &Path) -> InjectionContext<'a> {
        InjectionContext {
            archives: reader,
            files: Some(Arc::new(DirectFileOps)),
            staging_dir: root.join("staging"),
            backup_dir: root.join("backup"),
            state_dir: root.join("state"),
        }
    }

    #[test]
    fn test_version_dir() {
        assert_eq!(version_dir("1.4.7.2091").as_deref(), Some("1.4.0"));
        assert_eq!(version_dir("10.22.3").as_deref(), Some("10.22.0"));
        assert_eq!(version_dir("beta"), None);
        assert_eq!(version_dir("1.4"), None);
    }

    #[test]
    fn test_manifest_field_names() {
        let mut manifest = Manifest::default();
        manifest.paks.push(Pak::from_digest(
            "a.pak",
            ContentDigest { md5: "abc".into(), size: 3 },
        ));
        let value: Value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["projectVersion"], "1.0");
        assert_eq!(value["bUserCache"], true);
        assert_eq!(value["paks"][0]["sizeInBytes"], 3);
        assert_eq!(value["paks"][0]["bPrimary"], false);
        assert_eq!(value["paks"][0]["diffSizeBytes"], 0);
    }

    #[test]
    fn test_unknown_fields_survive() {
        let text = r#"{"version":"2","projectVersion":"9","pathOffset":"x","bUserCache":false,"paks":[],"cdn":"eu"}"#;
        let manifest = Manifest::parse(text).unwrap();
        assert_eq!(manifest.extra["cdn"], "eu");
        let back: Value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(back["cdn"], "eu");
        assert_eq!(back["pathOffset"], "x");
    }

    #[test]
    fn test_enable_places_and_records_paks() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod.zip");
        write_zip(&archive, &[("Paks/hero.pak", b"hello world")], None);
        let reader = ArchiveReader::default();
        let ctx = context(&reader, dir.path());
        let game = game(dir.path());

        // Not staged: extracted, placed, then hashed
        let package = ModPackage::new("hero", &archive, vec!["Paks/hero.pak".into()]);
        assert!(ManifestInjection::new(Duration::ZERO).enable(&ctx, &game, &package).unwrap());
        let manifest = Manifest::load(&ManifestInjection::mod_manifest_path(&ctx, &game)).unwrap();
        assert_eq!(manifest.paks.len(), 1);
        assert_eq!(manifest.paks[0].name, "hero.pak");
        assert_eq!(manifest.paks[0].hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(manifest.paks[0].size_in_bytes, 11);
        assert_eq!(fs::read(game.mod_dir.join("hero.pak")).unwrap(), b"hello world");

        let strategy = ManifestInjection::new(Duration::ZERO);
        assert!(strategy.disable(&ctx, &game, &package));
        let manifest = Manifest::load(&ManifestInjection::mod_manifest_path(&ctx, &game)).unwrap();
        assert!(manifest.paks.is_empty());
        assert!(!game.mod_dir.join("hero.pak").exists());

        // A staged copy takes precedence over the archive
        let staged = dir.path().join("staged");
        fs::create_dir_all(staged.join("Paks")).unwrap();
        fs::write(staged.join("Paks/hero.pak"), b"").unwrap();
        let package = package.with_staged_dir(&staged);
        assert!(strategy.enable(&ctx, &game, &package).unwrap());
        let manifest = Manifest::load(&ManifestInjection::mod_manifest_path(&ctx, &game)).unwrap();
        assert_eq!(manifest.paks.len(), 1);
        assert_eq!(manifest.paks[0].hash, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(fs::read(game.mod_dir.join("hero.pak")).unwrap(), b"");

        assert!(strategy.disable(&ctx, &game, &package));
        assert!(!game.mod_dir.join("hero.pak").exists());
    }

    #[test]
    fn test_original_game_pak_is_restored() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod.zip");
        write_zip(&archive, &[("hero.pak", b"modded")], None);
        let reader = ArchiveReader::default();
        let ctx = context(&reader, dir.path());
        let game = game(dir.path());
        fs::create_dir_all(&game.mod_dir).unwrap();
        fs::write(game.mod_dir.join("hero.pak"), b"stock").unwrap();

        let strategy = ManifestInjection::new(Duration::ZERO);
        let package = ModPackage::new("hero", &archive, vec!["hero.pak".into()]);
        assert!(strategy.enable(&ctx, &game, &package).unwrap());
        assert_eq!(fs::read(game.mod_dir.join("hero.pak")).unwrap(), b"modded");
        assert!(strategy.disable(&ctx, &game, &package));
        assert_eq!(fs::read(game.mod_dir.join("hero.pak")).unwrap(), b"stock");
    }

    #[test]
    fn test_enable_propagates_password_error() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("locked.zip");
        write_zip(&archive, &[("a.pak", b"x")], Some("pw"));
        let reader = ArchiveReader::default();
        let ctx = context(&reader, dir.path());
        let package = ModPackage::new("locked", &archive, vec!["a.pak".into()]);
        assert!(ManifestInjection::new(Duration::ZERO)
            .enable(&ctx, &game(dir.path()), &package)
            .is_err());
    }

    #[test]
    fn test_before_start_game_statuses() {
        let dir = tempdir().unwrap();
        let reader = ArchiveReader::default();
        let mut ctx = context(&reader, dir.path());
        let game = game(dir.path());
        let strategy = ManifestInjection::new(Duration::ZERO);

        assert_eq!(strategy.before_start_game(&ctx, &game), StartStatus::Success);
        assert!(game.game_path.join("files/1.4.0").is_dir());
        assert!(!game.game_path.join("files/1.4.0/test").exists());

        // A file where the version directory should be blocks the probe
        let updated = GameInfo { version: "1.5.0".into(), ..game.clone() };
        fs::write(game.game_path.join("files/1.5.0"), b"").unwrap();
        assert_eq!(strategy.before_start_game(&ctx, &updated), StartStatus::GameUpdated);

        ctx.files = None;
        assert_eq!(strategy.before_start_game(&ctx, &game), StartStatus::NoPermission);
    }

    #[test]
    fn test_start_merges_mod_paks_in_front_once() {
        let dir = tempdir().unwrap();
        let reader = ArchiveReader::default();
        let ctx = context(&reader, dir.path());
        let game = game(dir.path());

        let mut live = Manifest::default();
        live.paks.push(Pak::from_digest("base.pak", ContentDigest { md5: "b".into(), size: 1 }));
        live.save(&game.game_path.join("files").join(MANIFEST_NAME)).unwrap();

        let mut mods = Manifest::default();
        mods.paks.push(Pak::from_digest("mod.pak", ContentDigest { md5: "m".into(), size: 2 }));
        mods.save(&ManifestInjection::mod_manifest_path(&ctx, &game)).unwrap();

        let strategy = ManifestInjection::new(Duration::ZERO);
        assert!(strategy.on_game_started(&ctx, &game));
        assert!(strategy.on_game_started(&ctx, &game));

        let merged = Manifest::load(&game.game_path.join("files").join(MANIFEST_NAME)).unwrap();
        let names: Vec<&str> = merged.paks.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["mod.pak", "base.pak"]);
    }

    #[test]
    fn test_start_without_mods_leaves_live_manifest() {
        let dir = tempdir().unwrap();
        let reader = ArchiveReader::default();
        let ctx = context(&reader, dir.path());
        let game = game(dir.path());
        assert!(ManifestInjection::new(Duration::ZERO).on_game_started(&ctx, &game));
        assert!(!game.game_path.join("files").join(MANIFEST_NAME).exists());
    }
}
