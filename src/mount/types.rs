//! Mount entry types shared by probing and remediation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Network filesystem family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    /// NFS (v3 or v4)
    Nfs,
    /// SMB / CIFS
    Smb,
}

impl FsKind {
    /// Map a filesystem type string from a mount table to its family
    ///
    /// Returns `None` for anything that is not a network share.
    pub fn from_fstype(fstype: &str) -> Option<Self> {
        match fstype.to_ascii_lowercase().as_str() {
            "nfs" | "nfs4" => Some(FsKind::Nfs),
            "cifs" | "smbfs" | "smb3" => Some(FsKind::Smb),
            _ => None,
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsKind::Nfs => write!(f, "nfs"),
            FsKind::Smb => write!(f, "smb"),
        }
    }
}

/// A configured network mount, sourced from the static mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Local mountpoint (unique key)
    pub mount_path: PathBuf,
    /// Remote target (`server:/export` or `//server/share`)
    pub remote_target: String,
    /// Filesystem family
    pub kind: FsKind,
    /// Exact fs type as written in the table (`nfs4`, `cifs`, ...)
    pub fstype: String,
    /// Mount options as written in the table
    pub options: String,
}

impl MountEntry {
    #[cfg(test)]
    pub fn new(mount_path: impl Into<PathBuf>, remote_target: impl Into<String>, kind: FsKind) -> Self {
        let fstype = match kind {
            FsKind::Nfs => "nfs",
            FsKind::Smb => "cifs",
        };
        Self {
            mount_path: mount_path.into(),
            remote_target: remote_target.into(),
            kind,
            fstype: fstype.to_string(),
            options: "defaults".to_string(),
        }
    }

    /// Path of the operator-placed sentinel inside this mount
    pub fn sentinel_path(&self, sentinel_name: &str) -> PathBuf {
        self.mount_path.join(sentinel_name)
    }
}

/// One row of the live (kernel) mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMount {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

impl LiveMount {
    /// Whether this row is `entry` mounted with the expected filesystem family
    pub fn matches(&self, entry: &MountEntry) -> bool {
        self.target == entry.mount_path && FsKind::from_fstype(&self.fstype) == Some(entry.kind)
    }

    /// Whether anything at all is mounted at `path`
    pub fn occupies(&self, path: &Path) -> bool {
        self.target == path
    }
}

/// Files found in a bare mountpoint after unmounting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Residue {
    /// First entries found (capped by the listing limit)
    pub entries: Vec<String>,
    /// Whether the listing was cut off at the limit
    pub truncated: bool,
    /// Total size in bytes of everything below the mountpoint
    pub total_bytes: u64,
}

impl Residue {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        let more = if self.truncated { ", ..." } else { "" };
        format!(
            "{} item(s) ({}{}), total {}",
            self.entries.len(),
            self.entries.join(", "),
            more,
            format_size(self.total_bytes)
        )
    }
}

/// Format a byte count for humans
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}
