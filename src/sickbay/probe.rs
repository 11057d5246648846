//! Mount probing
//!
//! A probe answers three questions about one configured mount: is it in
//! the live mount table with the expected filesystem family, does a
//! bounded listing of its root complete, and is the operator's sentinel
//! marker readable. Probing never fails; every OS error is folded into
//! the result.

use crate::mount::{Access, MountEntry, MountSystem, StatKind};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// State of the sentinel marker at the mount root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelState {
    /// Marker exists and is readable
    Present,
    /// No marker: the mount was never verified by the operator
    Missing,
    /// Marker exists but reading it failed or hung
    Unreadable(String),
    /// Not checked because the mount root itself is unresponsive
    Unchecked,
}

impl fmt::Display for SentinelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentinelState::Present => write!(f, "present"),
            SentinelState::Missing => write!(f, "missing"),
            SentinelState::Unreadable(_) => write!(f, "unreadable"),
            SentinelState::Unchecked => write!(f, "unchecked"),
        }
    }
}

/// Classification of a probe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Mounted, responsive, sentinel present
    Healthy,
    /// Mounted and responsive, but the operator never placed a sentinel
    Unverified,
    /// Not in the live mount table
    Unmounted,
    /// Mounted but not serving I/O
    Stale(String),
}

impl Verdict {
    pub fn is_broken(&self) -> bool {
        matches!(self, Verdict::Unmounted | Verdict::Stale(_))
    }

    /// Short reason for logs and notifications
    pub fn reason(&self) -> String {
        match self {
            Verdict::Healthy => "healthy".to_string(),
            Verdict::Unverified => "sentinel file missing".to_string(),
            Verdict::Unmounted => "not mounted".to_string(),
            Verdict::Stale(reason) => format!("stale: {}", reason),
        }
    }
}

/// Result of probing one mount
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub is_mounted: bool,
    pub is_responsive: bool,
    pub sentinel: SentinelState,
    /// Why the mount is not responsive, if it isn't
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Apply the edge-case policy
    ///
    /// A missing sentinel alone never makes a mount broken; an unreadable
    /// one on a mounted share does.
    pub fn verdict(&self) -> Verdict {
        if !self.is_mounted {
            return Verdict::Unmounted;
        }
        if !self.is_responsive {
            let reason = self
                .detail
                .clone()
                .unwrap_or_else(|| "filesystem not responding".to_string());
            return Verdict::Stale(reason);
        }
        match &self.sentinel {
            SentinelState::Present => Verdict::Healthy,
            SentinelState::Missing => Verdict::Unverified,
            SentinelState::Unreadable(reason) => {
                Verdict::Stale(format!("sentinel unreadable: {}", reason))
            }
            SentinelState::Unchecked => Verdict::Healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.verdict().is_broken()
    }
}

/// Probe for configured network mounts
pub struct MountProbe<'a, S: MountSystem + ?Sized> {
    system: &'a S,
    sentinel_name: &'a str,
    timeout: Duration,
}

impl<'a, S: MountSystem + ?Sized> MountProbe<'a, S> {
    pub fn new(system: &'a S, sentinel_name: &'a str, timeout: Duration) -> Self {
        Self {
            system,
            sentinel_name,
            timeout,
        }
    }

    pub fn sentinel_name(&self) -> &str {
        self.sentinel_name
    }

    /// Probe one mount
    pub fn probe(&self, entry: &MountEntry) -> ProbeResult {
        let mut detail = None;

        // An unreadable table is an OS error: treat the mount as present but unresponsive
        let (is_mounted, table_error) = match self.system.query() {
            Ok(live) => (live.iter().any(|m| m.matches(entry)), None),
            Err(e) => {
                tracing::warn!(mount = %entry.mount_path.display(), error = %e, "live mount table unavailable");
                (true, Some(format!("live mount table unavailable: {}", e)))
            }
        };

        let is_responsive = match table_error {
            Some(reason) => {
                detail = Some(reason);
                false
            }
            None if is_mounted => {
                let access = self
                    .system
                    .stat(&entry.mount_path, StatKind::Directory, self.timeout);
                detail = access.reason();
                access.is_ok()
            }
            None => false,
        };

        // A hung root would hang the sentinel read as well
        let sentinel = if is_mounted && !is_responsive {
            SentinelState::Unchecked
        } else {
            self.check_sentinel(entry)
        };

        ProbeResult {
            is_mounted,
            is_responsive,
            sentinel,
            detail,
            checked_at: Utc::now(),
        }
    }

    /// Read the operator-placed marker at the mount root
    fn check_sentinel(&self, entry: &MountEntry) -> SentinelState {
        let path = entry.sentinel_path(self.sentinel_name);
        match self.system.stat(&path, StatKind::File, self.timeout) {
            Access::Ok => SentinelState::Present,
            Access::Missing => SentinelState::Missing,
            Access::Failed(reason) => SentinelState::Unreadable(reason),
            Access::TimedOut => SentinelState::Unreadable("read timed out".to_string()),
        }
    }
}
