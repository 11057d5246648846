//! Last-known status ledger
//!
//! Small JSON document carried between cycles so notifications fire on
//! transitions only. Written with atomic replace after each mount's
//! remediation, so an interrupted cycle leaves either the old or the new
//! record, never a torn one.
//!
//! The observed status and the status the operator was last told about
//! are tracked separately: a change that was throttled or failed to send
//! is reported again on the next cycle.

use crate::error::{Error, Result};
use crate::sickbay::MountStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Recorded state of one mount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRecord {
    pub status: MountStatus,
    /// When the mount entered `status`
    pub since: DateTime<Utc>,
    pub checked_at: DateTime<Utc>,
    /// Last status that reached the operator
    #[serde(default)]
    pub notified_status: Option<MountStatus>,
    /// The missing-sentinel notice reached the operator
    #[serde(default)]
    pub unverified_warned: bool,
}

/// Persisted token bucket for the alert throttle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    /// `None` means the bucket has never been drawn from
    pub tokens: Option<f64>,
    pub last_refill: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatusLedger {
    #[serde(default)]
    mounts: BTreeMap<String, MountRecord>,

    #[serde(default)]
    throttle: ThrottleState,

    #[serde(skip)]
    path: PathBuf,
}

impl StatusLedger {
    /// Load the ledger, starting empty if it is missing or unreadable
    pub fn load(path: &Path) -> Self {
        let mut ledger = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<StatusLedger>(&content) {
                Ok(ledger) => ledger,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "status ledger is corrupt, starting fresh");
                    StatusLedger::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no status ledger yet");
                StatusLedger::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "status ledger unreadable, starting fresh");
                StatusLedger::default()
            }
        };
        ledger.path = path.to_path_buf();
        ledger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, mount_path: &Path) -> Option<&MountRecord> {
        self.mounts.get(&key(mount_path))
    }

    /// Status recorded by the previous cycle
    pub fn prior(&self, mount_path: &Path) -> Option<MountStatus> {
        self.get(mount_path).map(|r| r.status)
    }

    /// Status the operator was last told about
    pub fn notified(&self, mount_path: &Path) -> Option<MountStatus> {
        self.get(mount_path).and_then(|r| r.notified_status)
    }

    pub fn unverified_warned(&self, mount_path: &Path) -> bool {
        self.get(mount_path).is_some_and(|r| r.unverified_warned)
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &MountRecord)> {
        self.mounts.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Record this cycle's status for a mount
    ///
    /// Notification bookkeeping is carried over untouched.
    pub fn record(&mut self, mount_path: &Path, status: MountStatus, now: DateTime<Utc>) {
        let (since, notified_status, unverified_warned) = match self.get(mount_path) {
            Some(prev) => (
                if prev.status == status { prev.since } else { now },
                prev.notified_status,
                prev.unverified_warned,
            ),
            None => (now, None, false),
        };

        self.mounts.insert(
            key(mount_path),
            MountRecord {
                status,
                since,
                checked_at: now,
                notified_status,
                unverified_warned,
            },
        );
    }

    /// The operator now knows the mount is `status`
    ///
    /// `unverified` says whether the mount is up without its sentinel.
    /// Unknown mounts are ignored; `record` comes first.
    pub fn acknowledge(&mut self, mount_path: &Path, status: MountStatus, unverified: bool) {
        if let Some(record) = self.mounts.get_mut(&key(mount_path)) {
            record.notified_status = Some(status);
            record.unverified_warned = unverified;
        }
    }

    pub fn throttle(&self) -> &ThrottleState {
        &self.throttle
    }

    pub fn set_throttle(&mut self, state: ThrottleState) {
        self.throttle = state;
    }

    /// Atomically replace the ledger file
    pub fn save(&self) -> Result<()> {
        let ledger_err = |message: String| Error::Ledger {
            path: self.path.clone(),
            message,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .map_err(|e| ledger_err(format!("cannot create {}: {}", parent.display(), e)))?;

        let json = serde_json::to_vec_pretty(self)?;

        let mut staging = NamedTempFile::new_in(parent)
            .map_err(|e| ledger_err(format!("cannot create temp file: {}", e)))?;
        staging
            .write_all(&json)
            .map_err(|e| ledger_err(format!("write failed: {}", e)))?;
        staging
            .as_file()
            .sync_all()
            .map_err(|e| ledger_err(format!("sync failed: {}", e)))?;
        staging
            .persist(&self.path)
            .map_err(|e| ledger_err(format!("rename failed: {}", e.error)))?;

        Ok(())
    }
}

fn key(mount_path: &Path) -> String {
    mount_path.display().to_string()
}
