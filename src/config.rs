//! Core configuration
//!
//! Persistent settings for the mod core, stored as JSON in the user's config
//! directory (`MODCORE_CONFIG` points elsewhere) and turned into the archive
//! and access settings the rest of the crate runs with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::archive::encoding::{charset_for_label, LEGACY_LABELS};
use crate::archive::ArchiveSettings;
use crate::fileops::{AccessKind, DocumentFileOps, DocumentGrant, DocumentProvider, FsDocumentProvider, ProcessShellChannel};
use crate::permission::PermissionResolver;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "MODCORE_CONFIG";

/// How to reach the privileged file helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Program that serves the shell protocol on stdin/stdout
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Core settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Where archives are extracted before placement
    pub staging_dir: PathBuf,
    /// Originals displaced by enabled mods
    pub backup_dir: PathBuf,
    /// Per-game state such as mod manifests
    pub state_dir: PathBuf,
    /// Persistent log directory; console only when unset
    pub log_dir: Option<PathBuf>,
    /// Code page for ZIP names that are not UTF-8
    pub legacy_zip_charset: String,
    pub progress_interval_ms: u64,
    /// Prefer the privileged helper whenever it is granted
    pub privileged_mode: bool,
    /// Forced access kind per path prefix
    pub path_overrides: BTreeMap<PathBuf, AccessKind>,
    /// Document-tree grants: storage root -> directory backing it
    pub document_roots: BTreeMap<PathBuf, PathBuf>,
    pub shell: Option<ShellConfig>,
    /// How long the live manifest is rewritten after game start
    pub start_write_window_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let data = dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("modcore");
        Self {
            staging_dir: data.join("staging"),
            backup_dir: data.join("backup"),
            state_dir: data.join("state"),
            log_dir: Some(data.join("logs")),
            legacy_zip_charset: "GBK".to_string(),
            progress_interval_ms: 100,
            privileged_mode: false,
            path_overrides: BTreeMap::new(),
            document_roots: BTreeMap::new(),
            shell: None,
            start_write_window_secs: 40,
        }
    }
}

impl CoreConfig {
    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("modcore")
            .join("config.json"))
    }

    /// Load the config from disk, or return defaults if it is missing or broken
    pub fn load() -> Self {
        match Self::config_path().and_then(|path| Self::load_from(&path)) {
            Ok(config) => config,
            Err(e) => {
                warn!("Could not load config: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load and validate `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: Self = serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if charset_for_label(&self.legacy_zip_charset).is_none() {
            return Err(ConfigError::UnknownCharset(self.legacy_zip_charset.clone()));
        }
        if self.progress_interval_ms == 0 {
            return Err(ConfigError::ZeroProgressInterval);
        }
        for (name, dir) in [
            ("staging_dir", &self.staging_dir),
            ("backup_dir", &self.backup_dir),
            ("state_dir", &self.state_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPath(name));
            }
        }
        Ok(())
    }

    pub fn archive_settings(&self) -> Result<ArchiveSettings, ConfigError> {
        let legacy_charset = charset_for_label(&self.legacy_zip_charset)
            .ok_or_else(|| ConfigError::UnknownCharset(self.legacy_zip_charset.clone()))?;
        Ok(ArchiveSettings {
            legacy_charset,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        })
    }

    /// Build the access resolver described by this config.
    pub fn permission_resolver(&self) -> PermissionResolver {
        let grants = self
            .document_roots
            .iter()
            .map(|(root, mirror)| {
                let provider: Arc<dyn DocumentProvider> = Arc::new(FsDocumentProvider::new(mirror));
                DocumentGrant::new(root, provider)
            })
            .collect();

        let mut resolver = PermissionResolver::new().with_documents(DocumentFileOps::new(grants));
        if let Some(shell) = &self.shell {
            resolver = resolver.with_shell(Arc::new(ProcessShellChannel::new(&shell.program, shell.args.clone())));
        }
        for (path, kind) in &self.path_overrides {
            resolver = resolver.with_override(path, *kind);
        }
        resolver
    }

    pub fn write_window(&self) -> Duration {
        Duration::from_secs(self.start_write_window_secs)
    }
}

/// Configuration errors
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown legacy ZIP charset '{0}' (known: {known})", known = LEGACY_LABELS.join(", "))]
    UnknownCharset(String),

    #[error("progress_interval_ms must be greater than zero")]
    ZeroProgressInterval,

    #[error("{0} must not be empty")]
    EmptyPath(&'static str),
}
