//! Mod installation
//!
//! Takes a mod source through the whole pipeline:
//! 1. Sniff     — archive, loose directory or single file
//! 2. Unlock    — check the password of encrypted archives
//! 3. Stage     — extract the archive into the staging area
//! 4. Resolve   — pick the file backend for the game's directory
//! 5. Inject    — hand the staged package to the game's strategy
//!
//! Staging runs in parallel across mods; injection is serialized because
//! strategies share backups and manifests per game.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, ArchiveReader, ProgressListener};
use crate::config::CoreConfig;
use crate::injection::{self, GameInfo, InjectionContext, ModPackage};
use crate::paths;
use crate::permission::PermissionResolver;

/// Extensions that must sniff as a supported container.
const ARCHIVE_EXTENSIONS: [&str; 3] = ["zip", "7z", "rar"];

/// What happened to one mod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum InstallOutcome {
    Installed,
    NeedsPassword,
    NoPermission,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub name: String,
    pub source: PathBuf,
    pub outcome: InstallOutcome,
}

/// Installation statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallStats {
    pub installed: usize,
    pub needs_password: usize,
    pub no_permission: usize,
    pub failed: usize,
}

impl InstallStats {
    pub fn from_reports(reports: &[InstallReport]) -> Self {
        let mut stats = Self::default();
        for report in reports {
            match report.outcome {
                InstallOutcome::Installed => stats.installed += 1,
                InstallOutcome::NeedsPassword => stats.needs_password += 1,
                InstallOutcome::NoPermission => stats.no_permission += 1,
                InstallOutcome::Failed(_) => stats.failed += 1,
            }
        }
        stats
    }
}

/// Drives mods from source file to enabled state.
pub struct ModInstaller {
    config: CoreConfig,
    archives: ArchiveReader,
    resolver: PermissionResolver,
    inject_lock: Mutex<()>,
}

impl ModInstaller {
    /// Create an installer, making sure its working directories exist.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        for dir in [&config.staging_dir, &config.backup_dir, &config.state_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        let archives = ArchiveReader::new(config.archive_settings()?);
        let resolver = config.permission_resolver();
        Ok(Self {
            config,
            archives,
            resolver,
            inject_lock: Mutex::new(()),
        })
    }

    /// Replace the resolver built from the config.
    pub fn with_resolver(mut self, resolver: PermissionResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn archives(&self) -> &ArchiveReader {
        &self.archives
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Injection context for `game`, with the backend resolved right now.
    pub fn context(&self, game: &GameInfo) -> InjectionContext<'_> {
        let files = match self.resolver.strategy_for(&game.game_path, self.config.privileged_mode) {
            Ok(ops) => Some(ops),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };
        InjectionContext {
            archives: &self.archives,
            files,
            staging_dir: self.config.staging_dir.clone(),
            backup_dir: self.config.backup_dir.clone(),
            state_dir: self.config.state_dir.clone(),
        }
    }

    /// Turn a source path into a package, staging archives on the way.
    pub fn prepare(
        &self,
        source: &Path,
        password: Option<&str>,
        progress: Option<&dyn ProgressListener>,
    ) -> Result<ModPackage, InstallOutcome> {
        let name = mod_name(source);

        if self.archives.detect_archive(source) {
            if self.archives.is_encrypted(source) && !self.archives.validate_password(source, password) {
                return Err(InstallOutcome::NeedsPassword);
            }
            let entries = match self.archives.list_entries(source, password) {
                Ok(entries) => entries,
                Err(ArchiveError::Password(_)) => return Err(InstallOutcome::NeedsPassword),
                Err(e) => return Err(InstallOutcome::Failed(e.to_string())),
            };
            let staged = self.config.staging_dir.join(injection::staging_key(source));
            match self.archives.extract_all(source, &staged, password, true, progress) {
                Ok(true) => {}
                Ok(false) => return Err(InstallOutcome::Failed(format!("extraction of {} failed", source.display()))),
                Err(_) => return Err(InstallOutcome::NeedsPassword),
            }
            let mut package = ModPackage::new(name, source, entries).with_staged_dir(staged);
            package.password = password.map(str::to_string);
            return Ok(package);
        }

        let looks_like_archive = paths::extension(&source.to_string_lossy())
            .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()));
        if source.is_file() && looks_like_archive {
            return Err(InstallOutcome::Failed(format!("{} is not a readable archive", source.display())));
        }

        if source.is_dir() {
            let mut files = Vec::new();
            for entry in walkdir::WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(source) {
                    files.push(paths::normalize_entry_path(&rel.to_string_lossy()));
                }
            }
            files.sort();
            return Ok(ModPackage::new(name, source, files));
        }

        if source.is_file() {
            let file = paths::file_name(&source.to_string_lossy()).to_string();
            return Ok(ModPackage::new(name, source, vec![file]));
        }

        Err(InstallOutcome::Failed(format!("{} does not exist", source.display())))
    }

    /// Install one mod into `game`.
    pub fn install(
        &self,
        game: &GameInfo,
        source: &Path,
        password: Option<&str>,
        progress: Option<&dyn ProgressListener>,
    ) -> InstallReport {
        let started = Instant::now();
        let outcome = match self.prepare(source, password, progress) {
            Ok(package) => self.enable(game, &package),
            Err(outcome) => outcome,
        };
        info!(
            "Install: mod='{}' outcome={:?} elapsed_ms={}",
            mod_name(source),
            outcome,
            started.elapsed().as_millis()
        );
        InstallReport {
            name: mod_name(source),
            source: source.to_path_buf(),
            outcome,
        }
    }

    /// Run the game's strategy for an already prepared package.
    pub fn enable(&self, game: &GameInfo, package: &ModPackage) -> InstallOutcome {
        let _guard = self.inject_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let ctx = self.context(game);
        if ctx.files.is_none() {
            return InstallOutcome::NoPermission;
        }
        let strategy = injection::strategy(game.injection, self.config.write_window());
        match strategy.enable(&ctx, game, package) {
            Ok(true) => InstallOutcome::Installed,
            Ok(false) => InstallOutcome::Failed(format!("could not place files of {}", package.name)),
            Err(_) => InstallOutcome::NeedsPassword,
        }
    }

    /// Undo [`ModInstaller::enable`].
    pub fn disable(&self, game: &GameInfo, package: &ModPackage) -> bool {
        let _guard = self.inject_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let ctx = self.context(game);
        injection::strategy(game.injection, self.config.write_window()).disable(&ctx, game, package)
    }

    /// Install every source, continuing past failures. Reports keep the
    /// order of `sources`.
    pub fn install_all(&self, game: &GameInfo, sources: &[PathBuf], password: Option<&str>) -> Vec<InstallReport> {
        info!("Installing {} mods into {}", sources.len(), game.package_name);
        let reports: Vec<InstallReport> = sources
            .par_iter()
            .map(|source| self.install(game, source, password, None))
            .collect();

        let stats = InstallStats::from_reports(&reports);
        debug!("Install stats: {:?}", stats);
        if stats.installed < reports.len() {
            warn!(
                "{} of {} mods were not installed ({} need a password, {} lack permission)",
                reports.len() - stats.installed,
                reports.len(),
                stats.needs_password,
                stats.no_permission
            );
        }
        reports
    }

    /// [`ModInstaller::install_all`] on tokio's blocking pool.
    pub fn install_in_background(
        self: Arc<Self>,
        game: GameInfo,
        sources: Vec<PathBuf>,
        password: Option<String>,
    ) -> tokio::task::JoinHandle<Vec<InstallReport>> {
        tokio::task::spawn_blocking(move || self.install_all(&game, &sources, password.as_deref()))
    }
}

/// Display name of a mod: the source's file name without extension.
fn mod_name(source: &Path) -> String {
    source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mod".to_string())
}
