//! Scheduler installation
//!
//! Registers `mooring check` in root's crontab. The crontab text is edited
//! by pure functions; only `install` and `remove` talk to `crontab(1)`.

use crate::error::{Error, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Comment placed above the scheduled entry
pub const CRON_MARKER: &str = "# mooring: network share monitoring";

/// Build the crontab line for a periodic check
pub fn cron_line(exe: &Path, config: Option<&Path>, interval: u32) -> String {
    let mut command = exe.display().to_string();
    if let Some(config) = config {
        command.push_str(&format!(" --config {}", config.display()));
    }
    format!("*/{} * * * * {} check >/dev/null 2>&1", interval, command)
}

fn is_entry(line: &str, exe: &Path) -> bool {
    let line = line.trim();
    !line.starts_with('#') && line.contains(&exe.display().to_string()) && line.contains(" check")
}

/// Append the entry to `existing`; `None` if one is already present
pub fn with_entry(existing: &str, exe: &Path, line: &str) -> Option<String> {
    if existing
        .lines()
        .any(|l| l.trim() == CRON_MARKER || is_entry(l, exe))
    {
        return None;
    }

    let mut updated = existing.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(CRON_MARKER);
    updated.push('\n');
    updated.push_str(line);
    updated.push('\n');
    Some(updated)
}

/// Strip the marker and entry from `existing`; `None` if neither is present
pub fn without_entry(existing: &str, exe: &Path) -> Option<String> {
    let mut removed = false;
    let mut after_marker = false;
    let mut kept = Vec::new();

    for line in existing.lines() {
        if line.trim() == CRON_MARKER {
            removed = true;
            after_marker = true;
            continue;
        }
        if is_entry(line, exe) || (after_marker && line.contains(" check >/dev/null")) {
            removed = true;
            after_marker = false;
            continue;
        }
        after_marker = false;
        kept.push(line);
    }

    if !removed {
        return None;
    }

    let mut updated = kept.join("\n");
    if !updated.is_empty() {
        updated.push('\n');
    }
    Some(updated)
}

/// Install the periodic check; returns false if already installed
pub fn install(exe: &Path, config: Option<&Path>, interval: u32) -> Result<bool> {
    let existing = read_crontab()?;
    let line = cron_line(exe, config, interval);

    match with_entry(&existing, exe, &line) {
        Some(updated) => {
            write_crontab(&updated)?;
            info!(entry = %line, "scheduled check installed");
            Ok(true)
        }
        None => {
            info!("scheduled check already installed");
            Ok(false)
        }
    }
}

/// Remove the periodic check; returns false if nothing was installed
pub fn remove(exe: &Path) -> Result<bool> {
    let existing = read_crontab()?;

    match without_entry(&existing, exe) {
        Some(updated) => {
            write_crontab(&updated)?;
            info!("scheduled check removed");
            Ok(true)
        }
        None => {
            info!("no scheduled check to remove");
            Ok(false)
        }
    }
}

fn read_crontab() -> Result<String> {
    let output = Command::new("crontab")
        .arg("-l")
        .output()
        .map_err(|e| Error::Schedule(format!("failed to run crontab -l: {}", e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("no crontab") {
        debug!("no existing crontab");
        Ok(String::new())
    } else {
        Err(Error::Schedule(format!("crontab -l failed: {}", stderr.trim())))
    }
}

fn write_crontab(content: &str) -> Result<()> {
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Schedule(format!("failed to run crontab -: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(content.as_bytes())
            .map_err(|e| Error::Schedule(format!("failed to write crontab: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| Error::Schedule(format!("crontab did not finish: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Schedule(format!(
            "crontab - failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}
