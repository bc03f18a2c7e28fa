//! Plain file replacement.
//!
//! Mod files are copied into the game's mod directory. A game file that a
//! mod replaces is backed up once, on its first displacement, and put back
//! when the mod is disabled.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::{target_in, GameInfo, GameInjection, InjectionContext, ModPackage, StartStatus};
use crate::archive::PasswordError;
use crate::fileops::FileOperations;
use crate::paths;

#[derive(Debug, Default, Clone, Copy)]
pub struct CopyInjection;

impl CopyInjection {
    /// Save the game's current file at `target` unless a backup already exists.
    fn backup(ops: &dyn FileOperations, target: &Path, backup: &Path) -> Result<()> {
        if backup.exists() || !ops.exists(target) {
            return Ok(());
        }
        let mut stream = ops
            .open_read_stream(target)
            .with_context(|| format!("Failed to read {} for backup", target.display()))?;
        paths::ensure_parent_dirs(backup)?;
        let mut out = File::create(backup).with_context(|| format!("Failed to create {}", backup.display()))?;
        io::copy(&mut stream, &mut out).with_context(|| format!("Failed to back up {}", target.display()))?;
        debug!("Backed up {} -> {}", target.display(), backup.display());
        Ok(())
    }
}

impl GameInjection for CopyInjection {
    fn enable(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage) -> Result<bool, PasswordError> {
        let Some(ops) = ctx.files.as_deref() else {
            warn!("No access to {}, cannot enable {}", game.mod_dir.display(), package.name);
            return Ok(false);
        };

        // Archive entries without a local copy are extracted first. Staging
        // is scratch space, so a leftover from an earlier attempt is replaced.
        let pending: Vec<String> = package
            .files
            .iter()
            .filter(|f| package.local_file(f).is_none())
            .cloned()
            .collect();
        let staging = ctx.staging_for(package);
        if !pending.is_empty() {
            if !package.is_archive() {
                warn!("Mod {} is missing files: {:?}", package.name, pending);
                return Ok(false);
            }
            if !ctx
                .archives
                .extract_entries(&package.source, &pending, &staging, package.password.as_deref(), true)?
            {
                return Ok(false);
            }
        }

        let mut all_ok = true;
        for entry in &package.files {
            let Some(target) = target_in(game, entry) else {
                warn!("Skipping entry without a file name: '{}'", entry);
                all_ok = false;
                continue;
            };
            let source = package
                .local_file(entry)
                .or_else(|| paths::safe_join(&staging, entry));
            let Some(source) = source else {
                all_ok = false;
                continue;
            };

            if let Err(e) = Self::backup(ops, &target, &ctx.backup_path(game, paths::file_name(entry))) {
                // Never overwrite a file we could not save
                warn!("{:#}", e);
                all_ok = false;
                continue;
            }
            if !ops.copy_file(&source, &target) {
                all_ok = false;
            }
        }
        info!("Enabled {} ({} files, ok={})", package.name, package.files.len(), all_ok);
        Ok(all_ok)
    }

    fn disable(&self, ctx: &InjectionContext<'_>, game: &GameInfo, package: &ModPackage) -> bool {
        let Some(ops) = ctx.files.as_deref() else {
            warn!("No access to {}, cannot disable {}", game.mod_dir.display(), package.name);
            return false;
        };

        let mut all_ok = true;
        for entry in &package.files {
            let Some(target) = target_in(game, entry) else {
                continue;
            };
            let backup = ctx.backup_path(game, paths::file_name(entry));
            let restored = if backup.is_file() {
                ops.copy_file(&backup, &target) && fs::remove_file(&backup).is_ok()
            } else {
                ops.delete_file(&target)
            };
            all_ok &= restored;
        }
        info!("Disabled {} (ok={})", package.name, all_ok);
        all_ok
    }

    fn before_start_game(&self, ctx: &InjectionContext<'_>, game: &GameInfo) -> StartStatus {
        match &ctx.files {
            Some(ops) if ops.exists(&game.game_path) => StartStatus::Success,
            Some(_) => StartStatus::GameUpdated,
            None => StartStatus::NoPermission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::write_zip;
    use crate::archive::ArchiveReader;
    use crate::fileops::DirectFileOps;
    use crate::injection::InjectionKind;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        game: GameInfo,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let game_path = root.join("Android/data/com.game");
        let game = GameInfo {
            package_name: "com.game".into(),
            version: "2.1.0".into(),
            mod_dir: game_path.join("files/Paks"),
            game_path,
            injection: InjectionKind::Copy,
        };
        fs::create_dir_all(&game.mod_dir).unwrap();
        Fixture { _dir: dir, root, game }
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
    fn test_enable_then_disable_restores_originals() {
        let fx = fixture();
        fs::write(fx.game.mod_dir.join("hero.pak"), b"original").unwrap();
        let archive = fx.root.join("skins.zip");
        write_zip(&archive, &[("skins/hero.pak", b"modded"), ("skins/extra.pak", b"extra")], None);

        let reader = ArchiveReader::default();
        let ctx = context(&reader, &fx.root);
        let package = ModPackage::new("skins", &archive, vec!["skins/hero.pak".into(), "skins/extra.pak".into()]);

        assert!(CopyInjection.enable(&ctx, &fx.game, &package).unwrap());
        assert_eq!(fs::read(fx.game.mod_dir.join("hero.pak")).unwrap(), b"modded");
        assert_eq!(fs::read(fx.game.mod_dir.join("extra.pak")).unwrap(), b"extra");
        assert_eq!(fs::read(ctx.backup_path(&fx.game, "hero.pak")).unwrap(), b"original");

        assert!(CopyInjection.disable(&ctx, &fx.game, &package));
        assert_eq!(fs::read(fx.game.mod_dir.join("hero.pak")).unwrap(), b"original");
        assert!(!fx.game.mod_dir.join("extra.pak").exists());
        assert!(!ctx.backup_path(&fx.game, "hero.pak").exists());
    }

    #[test]
    fn test_backup_keeps_first_original() {
        let fx = fixture();
        fs::write(fx.game.mod_dir.join("hero.pak"), b"original").unwrap();
        let first = fx.root.join("first.pak");
        let second = fx.root.join("second");
        fs::write(&first, b"one").unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(second.join("hero.pak"), b"two").unwrap();

        let reader = ArchiveReader::default();
        let ctx = context(&reader, &fx.root);
        let a = ModPackage::new("a", &first, vec!["hero.pak".into()]);
        let b = ModPackage::new("b", &second, vec!["hero.pak".into()]);
        assert!(CopyInjection.enable(&ctx, &fx.game, &a).unwrap());
        assert!(CopyInjection.enable(&ctx, &fx.game, &b).unwrap());

        assert_eq!(fs::read(fx.game.mod_dir.join("hero.pak")).unwrap(), b"two");
        assert_eq!(fs::read(ctx.backup_path(&fx.game, "hero.pak")).unwrap(), b"original");
    }

    #[test]
    fn test_encrypted_archive_needs_password() {
        let fx = fixture();
        let archive = fx.root.join("locked.zip");
        write_zip(&archive, &[("a.pak", b"secret")], Some("pw"));

        let reader = ArchiveReader::default();
        let ctx = context(&reader, &fx.root);
        let package = ModPackage::new("locked", &archive, vec!["a.pak".into()]);
        assert!(CopyInjection.enable(&ctx, &fx.game, &package).is_err());
        assert!(!fx.game.mod_dir.join("a.pak").exists());

        let package = package.with_password("pw");
        assert!(CopyInjection.enable(&ctx, &fx.game, &package).unwrap());
        assert_eq!(fs::read(fx.game.mod_dir.join("a.pak")).unwrap(), b"secret");
    }

    #[test]
    fn test_no_access_and_start_status() {
        let fx = fixture();
        let reader = ArchiveReader::default();
        let mut ctx = context(&reader, &fx.root);
        assert_eq!(CopyInjection.before_start_game(&ctx, &fx.game), StartStatus::Success);

        ctx.files = None;
        let package = ModPackage::new("x", fx.root.join("x.pak"), vec!["x.pak".into()]);
        assert!(!CopyInjection.enable(&ctx, &fx.game, &package).unwrap());
        assert!(!CopyInjection.disable(&ctx, &fx.game, &package));
        assert_eq!(CopyInjection.before_start_game(&ctx, &fx.game), StartStatus::NoPermission);
    }
}
