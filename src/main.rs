//! modcore - command line front end
//!
//! Inspects and extracts mod archives, reports path access and installs
//! mods. `shell-service` is the privileged side of the shell file backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use modcore::archive::{classify, ArchiveReader, ProgressListener};
use modcore::config::CoreConfig;
use modcore::fileops::ShellService;
use modcore::injection::{GameInfo, InjectionKind};
use modcore::installer::{InstallOutcome, InstallStats, ModInstaller};
use modcore::logging;

#[derive(Parser)]
#[command(name = "modcore")]
#[command(version)]
#[command(about = "Mod archive reader and installer for Android games")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the container format of each file
    Sniff {
        files: Vec<PathBuf>,
    },

    /// List the files inside an archive
    List {
        archive: PathBuf,

        #[arg(short, long)]
        password: Option<String>,

        /// Show size and encryption per entry
        #[arg(short, long)]
        details: bool,
    },

    /// Extract an archive, or selected entries of it
    Extract {
        archive: PathBuf,

        /// Destination directory
        dest: PathBuf,

        /// Only these entries (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        entries: Vec<String>,

        #[arg(short, long)]
        password: Option<String>,

        /// Extract even if the destination already exists
        #[arg(long)]
        overwrite: bool,
    },

    /// Check an archive password
    Validate {
        archive: PathBuf,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Show which backend may write a path
    CheckPermission {
        path: PathBuf,

        /// Prefer the privileged helper
        #[arg(long)]
        privileged: bool,
    },

    /// Install mods into a game directory
    Install {
        /// Archives, folders or single files
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Game package name
        #[arg(long)]
        package: String,

        /// Game data directory (.../Android/data/<package>)
        #[arg(long)]
        game_path: PathBuf,

        /// Where mod files go (defaults to <game-path>/files)
        #[arg(long)]
        mod_dir: Option<PathBuf>,

        /// Installed game version
        #[arg(long, default_value = "")]
        game_version: String,

        /// The game verifies paks against a manifest
        #[arg(long)]
        manifest: bool,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Serve file operations over stdin/stdout (run with elevated rights)
    ShellService,
}

fn progress_bar(label: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% | {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.set_message(label.to_string());
    pb
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CoreConfig::load();
    let _log_guard = logging::init(cli.verbose, config.log_dir.as_deref())?;

    match cli.command {
        Commands::Sniff { files } => {
            for file in &files {
                println!("{}: {}", file.display(), classify(file));
            }
        }

        Commands::List {
            archive,
            password,
            details,
        } => {
            let reader = ArchiveReader::new(config.archive_settings()?);
            if details {
                let entries = reader.list_entry_details(&archive, password.as_deref())?;
                for e in &entries {
                    let kind = if e.is_dir { "dir " } else { "file" };
                    let lock = if e.is_encrypted { " [encrypted]" } else { "" };
                    println!("{} {:>12} {}{}", kind, e.size_bytes, e.normalized_path, lock);
                }
                eprintln!("\nTotal: {} entries", entries.len());
            } else {
                let entries = reader.list_entries(&archive, password.as_deref())?;
                for e in &entries {
                    println!("{}", e);
                }
                eprintln!("\nTotal: {} files", entries.len());
            }
        }

        Commands::Extract {
            archive,
            dest,
            entries,
            password,
            overwrite,
        } => {
            let reader = ArchiveReader::new(config.archive_settings()?);
            let ok = if entries.is_empty() {
                let pb = progress_bar(&archive.display().to_string());
                let listener = |progress: &str| {
                    if let Ok(percent) = progress.trim_end_matches('%').parse::<u64>() {
                        pb.set_position(percent);
                    }
                };
                let ok = reader.extract_all(&archive, &dest, password.as_deref(), overwrite, Some(&listener as &dyn ProgressListener))?;
                pb.finish_and_clear();
                ok
            } else {
                reader.extract_entries(&archive, &entries, &dest, password.as_deref(), overwrite)?
            };
            if !ok {
                bail!("Extraction of {} failed (see log)", archive.display());
            }
            println!("Extracted {} -> {}", archive.display(), dest.display());
        }

        Commands::Validate { archive, password } => {
            let reader = ArchiveReader::new(config.archive_settings()?);
            if !reader.is_encrypted(&archive) {
                println!("{}: not encrypted", archive.display());
            } else if reader.validate_password(&archive, password.as_deref()) {
                println!("{}: password OK", archive.display());
            } else {
                bail!("{}: wrong or missing password", archive.display());
            }
        }

        Commands::CheckPermission { path, privileged } => {
            let resolver = config.permission_resolver();
            let grant = resolver.grant(&path, privileged || config.privileged_mode);
            println!("{}: {}", grant.path.display(), grant.kind);
        }

        Commands::Install {
            sources,
            package,
            game_path,
            mod_dir,
            game_version,
            manifest,
            password,
        } => {
            let game = GameInfo {
                package_name: package,
                version: game_version,
                mod_dir: mod_dir.unwrap_or_else(|| game_path.join("files")),
                game_path,
                injection: if manifest { InjectionKind::Manifest } else { InjectionKind::Copy },
            };
            let installer = Arc::new(ModInstaller::new(config)?);
            let reports = installer.install_in_background(game, sources, password).await?;

            for report in &reports {
                match &report.outcome {
                    InstallOutcome::Installed => println!("  ✓ {}", report.name),
                    InstallOutcome::NeedsPassword => println!("  ✗ {}: password required", report.name),
                    InstallOutcome::NoPermission => println!("  ✗ {}: no access to game directory", report.name),
                    InstallOutcome::Failed(reason) => println!("  ✗ {}: {}", report.name, reason),
                }
            }
            let stats = InstallStats::from_reports(&reports);
            println!("\nInstalled {} of {} mods", stats.installed, reports.len());
            if stats.installed < reports.len() {
                std::process::exit(1);
            }
        }

        Commands::ShellService => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            ShellService.serve(stdin.lock(), stdout.lock())?;
        }
    }

    Ok(())
}
