//! Mooring - health checks and self-healing for network mounts
//!
//! Probes every NFS and SMB/CIFS share listed in the static mount table,
//! remounts the ones that went stale or disappeared, and tells the
//! operator when something changed.

mod bridge;
mod cli;
mod dispatch;
mod error;
mod ledger;
mod logbook;
mod logging;
mod manifest;
mod mount;
mod sickbay;
mod watch;

use cli::{Cli, Commands};
use error::{Error, Result};
use fs2::FileExt;
use manifest::MooringConfig;
use nix::unistd::{Uid, gethostname};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn main() {
    if let Err(e) = run() {
        if e.is_configuration() {
            eprintln!("Configuration error: {}", e);
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }

        Commands::Check { dry_run, debug } => {
            let config = load_config(cli.config.as_deref())?;
            let capture = debug.then(logging::CaptureBuffer::new);
            logging::init(
                cli.verbose || debug,
                config.config.log_file.as_deref(),
                capture.as_ref(),
            );
            check(&config, dry_run, capture.as_ref())
        }

        Commands::Status { json } => {
            let config = load_config(cli.config.as_deref())?;
            logging::init(cli.verbose, None, None);
            status(&config, json)
        }

        Commands::Install { interval } => {
            let config = load_config(cli.config.as_deref())?;
            logging::init(cli.verbose, None, None);
            require_root("install")?;

            let exe = std::env::current_exe()?;
            let interval = interval.unwrap_or(config.config.cron_interval);
            let config_path = cli.config.as_deref().map(absolute);

            if watch::install(&exe, config_path.as_deref(), interval)? {
                println!("Installed: checks every {} minute(s)", interval);
            } else {
                println!("Already installed");
            }
            Ok(())
        }

        Commands::Remove => {
            logging::init(cli.verbose, None, None);
            require_root("remove")?;

            let exe = std::env::current_exe()?;
            if watch::remove(&exe)? {
                println!("Removed scheduled check");
            } else {
                println!("No scheduled check found");
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<MooringConfig> {
    match path {
        Some(path) => manifest::load(path, true),
        None => manifest::load(Path::new(manifest::DEFAULT_CONFIG_PATH), false),
    }
}

/// Run one check cycle
fn check(config: &MooringConfig, dry_run: bool, capture: Option<&logging::CaptureBuffer>) -> Result<()> {
    let global = &config.config;

    if !Uid::effective().is_root() {
        warn!("not running as root, mount and unmount will likely fail");
    }

    let mounts = mount::load_fstab(&global.fstab)?;
    if mounts.is_empty() {
        info!(fstab = %global.fstab.display(), "no NFS or SMB mounts configured");
    }

    let _lock = match acquire_cycle_lock(&global.lock_file) {
        Ok(Some(lock)) => Some(lock),
        Ok(None) => {
            info!(lock = %global.lock_file.display(), "another check cycle is running, skipping");
            return Ok(());
        }
        Err(e) => {
            warn!(lock = %global.lock_file.display(), error = %e, "cannot take cycle lock, continuing without it");
            None
        }
    };

    let system = mount::HostMountSystem::new(global.live_table.clone());
    let courier = dispatch::SmtpCourier::new(&config.notifications);
    let mut bridge = bridge::Bridge::new(config, &system, &courier, hostname());
    if let Some(capture) = capture {
        bridge = bridge.with_debug_output(capture);
    }

    let report = bridge.run_cycle(&mounts, dry_run);
    if dry_run {
        for outcome in &report.outcomes {
            println!(
                "{:<30} {:<8} {}",
                outcome.mount_path.display(),
                outcome.final_status,
                outcome.verdict.reason()
            );
        }
        if let dispatch::Delivery::DryRun(withheld) = report.delivery {
            println!("{} notification(s) withheld", withheld);
        }
    }

    Ok(())
}

/// Print the last-known status ledger
fn status(config: &MooringConfig, json: bool) -> Result<()> {
    let ledger = ledger::StatusLedger::load(&config.config.state_file);

    if json {
        println!("{}", serde_json::to_string_pretty(&ledger)?);
        return Ok(());
    }

    if ledger.is_empty() {
        println!("No status recorded yet ({})", ledger.path().display());
        return Ok(());
    }

    println!("{:<30} {:<8} {:<26} CHECKED", "MOUNT", "STATUS", "SINCE");
    for (mount, record) in ledger.records() {
        println!(
            "{:<30} {:<8} {:<26} {}",
            mount,
            record.status,
            record.since.format("%Y-%m-%d %H:%M:%S UTC"),
            record.checked_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

fn require_root(action: &str) -> Result<()> {
    if Uid::effective().is_root() {
        Ok(())
    } else {
        Err(Error::Schedule(format!("{} must be run as root", action)))
    }
}

fn hostname() -> String {
    gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Take the non-blocking cycle lock; `None` if another cycle holds it
fn acquire_cycle_lock(path: &Path) -> Result<Option<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(e.into()),
    }
}
