//! Append-only audit trail
//!
//! One JSON line per check cycle holding exactly one record per
//! configured mount. Lines are appended under an exclusive advisory lock
//! and synced, so a crash mid-cycle never rewrites earlier entries.

use crate::error::{Error, Result};
use crate::mount::{FsKind, MountEntry, Residue};
use crate::sickbay::{Action, MountStatus, ProbeResult, RemediationOutcome};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Audit record for one mount in one cycle
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub mount_path: PathBuf,
    pub remote_target: String,
    pub kind: FsKind,
    pub prior_status: Option<MountStatus>,
    pub new_status: MountStatus,
    pub action: Action,
    pub attempts: u8,
    pub sentinel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residue: Option<Residue>,
}

impl AuditEntry {
    /// Record stamped with the time the mount was probed
    pub fn new(
        entry: &MountEntry,
        prior_status: Option<MountStatus>,
        outcome: &RemediationOutcome,
        probe: &ProbeResult,
    ) -> Self {
        let sentinel = match outcome.action_taken {
            Action::Remounted if outcome.sentinel_missing_after_remount => "missing".to_string(),
            Action::Remounted => "present".to_string(),
            _ => probe.sentinel.to_string(),
        };

        Self {
            timestamp: probe.checked_at,
            mount_path: entry.mount_path.clone(),
            remote_target: entry.remote_target.clone(),
            kind: entry.kind,
            prior_status,
            new_status: outcome.final_status,
            action: outcome.action_taken,
            attempts: outcome.attempts,
            sentinel,
            detail: outcome.detail.clone(),
            residue: outcome.residue.clone(),
        }
    }
}

/// Summary of one check cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle_id: Uuid,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub mounts: Vec<AuditEntry>,
}

impl CycleRecord {
    pub fn begin(host: impl Into<String>, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4(),
            host: host.into(),
            started_at: now,
            finished_at: now,
            dry_run,
            mounts: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: AuditEntry) {
        self.mounts.push(entry);
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a cycle record, retrying once on failure
    pub fn record(&self, cycle: &CycleRecord) -> Result<()> {
        let mut line = serde_json::to_string(cycle)?;
        line.push('\n');

        match self.append(&line) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(path = %self.path.display(), error = %first, "audit append failed, retrying once");
                self.append(&line)
            }
        }
    }

    fn append(&self, line: &str) -> Result<()> {
        let audit_err = |message: String| Error::Audit {
            path: self.path.clone(),
            message,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| audit_err(e.to_string()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| audit_err(format!("open failed: {}", e)))?;

        file.lock_exclusive()
            .map_err(|e| audit_err(format!("lock failed: {}", e)))?;

        let written = (&file)
            .write_all(line.as_bytes())
            .and_then(|_| file.sync_data());
        let _ = file.unlock();

        written.map_err(|e| audit_err(format!("write failed: {}", e)))?;
        debug!(path = %self.path.display(), bytes = line.len(), "audit record appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sickbay::Verdict;
    use crate::sickbay::probe::SentinelState;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn unmounted_probe(checked_at: DateTime<Utc>) -> ProbeResult {
        ProbeResult {
            is_mounted: false,
            is_responsive: false,
            sentinel: SentinelState::Missing,
            detail: None,
            checked_at,
        }
    }

    fn remounted(entry: &MountEntry) -> RemediationOutcome {
        RemediationOutcome {
            mount_path: entry.mount_path.clone(),
            action_taken: Action::Remounted,
            attempts: 2,
            final_status: MountStatus::Healthy,
            verdict: Verdict::Unmounted,
            detail: None,
            residue: None,
            sentinel_missing_after_remount: false,
        }
    }

    fn cycle(host: &str, mounts: usize) -> CycleRecord {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let outcome = remounted(&entry);
        let probe = unmounted_probe(Utc::now());

        let mut record = CycleRecord::begin(host, false);
        for _ in 0..mounts {
            record.push(AuditEntry::new(
                &entry,
                Some(MountStatus::Healthy),
                &outcome,
                &probe,
            ));
        }
        record.finish();
        record
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_one_line_per_cycle() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("log").join("audit.jsonl"));

        log.record(&cycle("host-a", 2)).unwrap();
        log.record(&cycle("host-a", 2)).unwrap();

        let lines = read_lines(log.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["mounts"].as_array().unwrap().len(), 2);
        assert_ne!(lines[0]["cycle_id"], lines[1]["cycle_id"]);
    }

    #[test]
    fn test_record_fields() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.record(&cycle("host-a", 1)).unwrap();

        let lines = read_lines(log.path());
        let mount = &lines[0]["mounts"][0];
        assert_eq!(lines[0]["host"], "host-a");
        assert_eq!(lines[0]["dry_run"], false);
        assert_eq!(mount["mount_path"], "/srv/nfs1");
        assert_eq!(mount["kind"], "nfs");
        assert_eq!(mount["prior_status"], "healthy");
        assert_eq!(mount["new_status"], "healthy");
        assert_eq!(mount["action"], "remounted");
        assert_eq!(mount["attempts"], 2);
        assert!(mount.get("detail").is_none());
    }

    #[test]
    fn test_entry_stamped_with_probe_time() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let checked_at = Utc.with_ymd_and_hms(2026, 3, 1, 4, 5, 0).unwrap();
        let probe = unmounted_probe(checked_at);

        let mut outcome = remounted(&entry);
        let audit = AuditEntry::new(&entry, None, &outcome, &probe);
        assert_eq!(audit.timestamp, checked_at);
        assert_eq!(audit.sentinel, "present");

        outcome.sentinel_missing_after_remount = true;
        assert_eq!(AuditEntry::new(&entry, None, &outcome, &probe).sentinel, "missing");

        outcome.action_taken = Action::RemountFailed;
        outcome.final_status = MountStatus::Broken;
        assert_eq!(AuditEntry::new(&entry, None, &outcome, &probe).sentinel, "missing");
    }

    #[test]
    fn test_existing_entries_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "{\"earlier\":true}\n").unwrap();

        AuditLog::new(&path).record(&cycle("host-a", 1)).unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["earlier"], true);
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        // A directory where the log file should be
        let path = dir.path().join("audit.jsonl");
        fs::create_dir(&path).unwrap();

        let err = AuditLog::new(&path).record(&cycle("host-a", 1)).unwrap_err();
        assert!(matches!(err, Error::Audit { .. }));
    }
}
