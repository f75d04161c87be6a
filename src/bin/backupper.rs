//! # Backupper CLI
//!
//! Command-line front end for the backupper library.
//!
//! ## Usage
//! ```bash
//! # Create a backup with the configured categories
//! backupper backup
//!
//! # List local archives and remote placeholders
//! backupper list
//!
//! # Restore an archive (or pick one interactively)
//! backupper restore /storage/backup/backup_conf-src_20240101_030000.zip
//! backupper restore
//!
//! # Change a setting
//! backupper settings set max_backups 5
//! ```

use anyhow::{bail, Context};
use backupper::host::{Dialog, Notifier};
use backupper::schedule::{self, Schedule};
use backupper::settings::DEFAULTS;
use backupper::utils::format_bytes;
use backupper::{
    AbortSignal, BackupManager, BackupService, JsonSettings, OperationOutcome, ProgressInfo,
    RestoreOptions, SettingsStore, SystemPaths,
};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Backupper - backups for LibreELEC/Kodi configuration and user data
#[derive(Parser)]
#[command(name = "backupper")]
#[command(version)]
#[command(about = "Create, rotate and restore zip backups of a Kodi installation")]
#[command(long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Treat this directory as the filesystem root (for testing layouts)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    /// Enable verbose output (-vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup now
    Backup,

    /// Restore a backup
    #[command(alias = "rs")]
    Restore {
        /// Archive or `.remote.json` placeholder; omit to choose interactively
        archive: Option<PathBuf>,

        /// Write below this directory instead of the live system
        #[arg(long)]
        into: Option<PathBuf>,
    },

    /// List backups
    #[command(alias = "ls")]
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Verify an archive
    Verify {
        /// Archive to check
        archive: PathBuf,
    },

    /// Show an archive's manifest
    Info {
        /// Archive to inspect
        archive: PathBuf,
    },

    /// Delete backups beyond the retention count
    Rotate,

    /// Run the scheduling service in the foreground
    Service,

    /// Remote location commands
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },

    /// Read or change settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },

    /// Show the last and next scheduled backup
    NextRun,
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// List archives on the remote location
    List,

    /// Write a placeholder so a remote archive can be restored
    Fetch {
        /// Remote archive file name
        name: String,
    },

    /// Check that the remote location is reachable
    Test,
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print one setting
    Get {
        /// Setting key
        key: String,
    },

    /// Change one setting
    Set {
        /// Setting key
        key: String,
        /// New value
        value: String,
    },

    /// Print every known setting
    Show,
}

/// Terminal implementation of the host notifier and dialogs
struct Console {
    assume_yes: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl Console {
    fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            bar: Mutex::new(None),
        }
    }

    fn read_line(&self) -> Option<String> {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }

    fn finish_bar(&self) {
        if let Some(bar) = self.bar.lock().take() {
            bar.finish_and_clear();
        }
    }
}

impl Notifier for Console {
    fn notify(&self, message: &str) {
        self.finish_bar();
        println!("{} {}", "›".blue().bold(), message);
    }

    fn progress(&self, info: &ProgressInfo) {
        let mut slot = self.bar.lock();
        let bar = slot.get_or_insert_with(|| {
            let bar = ProgressBar::new(100);
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}% {msg}")
            {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        });

        if let Some(percentage) = info.percentage() {
            bar.set_position(percentage.clamp(0.0, 100.0) as u64);
        }
        let message = match &info.current_item {
            Some(item) => format!("{} {}", info.operation, item),
            None => info.operation.clone(),
        };
        bar.set_message(message);

        if info.is_complete() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl Dialog for Console {
    fn confirm(&self, heading: &str, message: &str) -> bool {
        self.finish_bar();
        println!("{}", heading.yellow().bold());
        println!("{}", message);
        if self.assume_yes {
            println!("{}", "(answered yes)".dimmed());
            return true;
        }

        print!("{} ", "[y/N]".bold());
        let _ = io::stdout().flush();
        matches!(
            self.read_line().as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("y") | Some("yes")
        )
    }

    fn select(&self, heading: &str, options: &[String]) -> Option<usize> {
        self.finish_bar();
        println!("{}", heading.blue().bold());
        for (index, option) in options.iter().enumerate() {
            println!("  {:>3}  {}", (index + 1).to_string().yellow(), option);
        }
        if self.assume_yes {
            return (!options.is_empty()).then_some(0);
        }

        print!("Number (empty to cancel): ");
        let _ = io::stdout().flush();
        let choice: usize = self.read_line()?.parse().ok()?;
        (1..=options.len()).contains(&choice).then(|| choice - 1)
    }

    fn ok(&self, heading: &str, message: &str) {
        self.finish_bar();
        println!("{}: {}", heading.bold(), message);
    }
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Run a command; `Ok(false)` means the operation reported failure
fn run(cli: Cli) -> anyhow::Result<bool> {
    let settings_path = match &cli.settings {
        Some(path) => path.clone(),
        None => default_paths(&cli).addon_profile().join("settings.json"),
    };
    let settings = Arc::new(
        JsonSettings::open(&settings_path)
            .with_context(|| format!("cannot open settings {}", settings_path.display()))?,
    );

    let command = match cli.command {
        Commands::Settings { command } => {
            cmd_settings(&*settings, &command)?;
            return Ok(true);
        }
        command => command,
    };

    let console = Arc::new(Console::new(cli.yes));
    let mut builder = BackupManager::builder(settings.clone())
        .notifier(console.clone())
        .dialog(console.clone());
    if let Some(root) = &cli.root {
        builder = builder.paths(SystemPaths::rooted_at(root));
    }
    let manager = builder.build();

    let outcome = match command {
        Commands::Backup => {
            let mut outcome = manager.create_backup();
            if !outcome.success {
                outcome.message = format!("Backup failed: {}", outcome.message);
            }
            outcome
        }
        Commands::Restore { archive, into } => cmd_restore(&manager, archive, into),
        Commands::List { json } => return cmd_list(&manager, json),
        Commands::Verify { archive } => manager.verify_backup(&archive),
        Commands::Info { archive } => {
            let manifest = manager.backup_info(&archive)?;
            println!("{}", String::from_utf8_lossy(&manifest.to_json()?));
            return Ok(true);
        }
        Commands::Rotate => manager.rotate(),
        Commands::Service => {
            println!("{}", "Backup service running, stop with Ctrl-C".blue().bold());
            BackupService::new(Arc::new(manager), Arc::new(AbortSignal::new())).run();
            return Ok(true);
        }
        Commands::Remote { command } => match command {
            RemoteCommands::List => return cmd_remote_list(&manager),
            RemoteCommands::Fetch { name } => {
                let path = manager.prepare_remote_restore(&name)?;
                OperationOutcome::success(format!(
                    "Placeholder written, restore with: backupper restore {}",
                    path.display()
                ))
            }
            RemoteCommands::Test => manager.test_connection(),
        },
        Commands::NextRun => return cmd_next_run(&manager),
        Commands::Settings { .. } => return Ok(true),
    };

    Ok(report(&outcome))
}

fn default_paths(cli: &Cli) -> SystemPaths {
    match &cli.root {
        Some(root) => SystemPaths::rooted_at(root),
        None => SystemPaths::libreelec(),
    }
}

fn report(outcome: &OperationOutcome) -> bool {
    if outcome.success {
        println!("{} {}", "✓".green().bold(), outcome.message);
    } else {
        eprintln!("{} {}", "✗".red().bold(), outcome.message);
    }
    outcome.success
}

fn cmd_restore(
    manager: &BackupManager,
    archive: Option<PathBuf>,
    into: Option<PathBuf>,
) -> OperationOutcome {
    let Some(archive) = archive else {
        return manager.restore_interactive();
    };

    let options = match into {
        Some(root) => RestoreOptions::new().relocate_to(root),
        None => RestoreOptions::new(),
    };
    match manager.run_restore(&archive, options) {
        Ok(result) => {
            for warning in &result.warnings {
                println!("  {} {}", "warning:".yellow().bold(), warning);
            }
            OperationOutcome::success(format!(
                "Restored {} files ({}) in {}",
                result.files_restored,
                format_bytes(result.bytes_written),
                format_duration(std::time::Duration::from_millis(result.duration_ms))
            ))
        }
        Err(e) => OperationOutcome::failure(format!("Restore failed: {}", e.user_message())),
    }
}

fn cmd_list(manager: &BackupManager, json: bool) -> anyhow::Result<bool> {
    let listings = manager.list_backups()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(true);
    }
    if listings.is_empty() {
        println!("{}", "No backups found.".yellow());
        return Ok(true);
    }

    println!("{}", "Backups:".blue().bold());
    for listing in &listings {
        let created = listing
            .created
            .map(|created| created.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let size = listing.size.map(format_bytes).unwrap_or_default();
        let marker = if listing.remote {
            "remote".magenta()
        } else {
            "local".normal()
        };
        println!(
            "  {} {} {:>10} {}",
            created.dimmed(),
            marker,
            size,
            listing.name.cyan()
        );
    }
    Ok(true)
}

fn cmd_remote_list(manager: &BackupManager) -> anyhow::Result<bool> {
    let records = manager.list_remote_backups()?;
    if records.is_empty() {
        println!("{}", "No remote backups found.".yellow());
        return Ok(true);
    }
    for record in records {
        let size = record.size.map(format_bytes).unwrap_or_default();
        println!(
            "  {} {:>10} {}",
            record.modified.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            size,
            record.name.cyan()
        );
    }
    Ok(true)
}

fn cmd_next_run(manager: &BackupManager) -> anyhow::Result<bool> {
    let settings = manager.settings();
    let mut last = settings.get_string("last_backup");
    if last.is_empty() {
        last = "never".to_string();
    }
    println!("Last backup: {}", last.cyan());

    let Some(schedule) = Schedule::from_settings(&**settings)? else {
        println!("Scheduling is {}", "off".yellow());
        return Ok(true);
    };

    let now = manager.now().naive_local();
    let next = schedule::parse_timestamp(&settings.get_string("next_backup"))
        .unwrap_or_else(|| schedule.next_after(now));
    let wait = (next - now).to_std().unwrap_or_default();
    println!(
        "Next {} backup: {} (in {})",
        schedule.interval,
        next.format(schedule::SCHEDULE_FORMAT).to_string().cyan(),
        format_duration(std::time::Duration::from_secs(wait.as_secs()))
    );
    Ok(true)
}

fn cmd_settings(settings: &dyn SettingsStore, command: &SettingsCommands) -> anyhow::Result<()> {
    match command {
        SettingsCommands::Get { key } => {
            if settings.get_raw(key).is_none() && !DEFAULTS.iter().any(|(k, _)| k == key) {
                bail!("unknown setting {:?}", key);
            }
            println!("{}", settings.get_string(key));
        }
        SettingsCommands::Set { key, value } => {
            settings.set(key, value)?;
            println!("{} {} = {}", "✓".green().bold(), key, display_value(key, value));
        }
        SettingsCommands::Show => {
            for (key, _) in DEFAULTS {
                let value = settings.get_string(key);
                println!("{:<24} {}", key.bold(), display_value(key, &value));
            }
        }
    }
    Ok(())
}

fn display_value(key: &str, value: &str) -> String {
    if key.ends_with("password") && !value.is_empty() {
        "********".to_string()
    } else {
        value.to_string()
    }
}
