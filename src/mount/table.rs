//! Static and live mount table parsing
//!
//! Both `/etc/fstab` and `/proc/self/mounts` share the same leading
//! column layout (`source target fstype options ...`) and the same octal
//! escaping for whitespace in paths.

use crate::error::{Error, Result};
use crate::mount::types::{FsKind, LiveMount, MountEntry};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Load the configured network mounts from a static mount table
pub fn load_fstab(path: &Path) -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string(path).map_err(|e| Error::MountTable {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(parse_fstab(&content))
}

/// Parse fstab content, keeping only NFS and SMB/CIFS entries
///
/// Malformed lines are skipped with a warning. Entries are keyed by mount
/// path; a repeated path keeps the first occurrence.
pub fn parse_fstab(content: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            warn!(line = idx + 1, content = line, "invalid fstab line");
            continue;
        }

        let fstype = fields[2].to_ascii_lowercase();
        let Some(kind) = FsKind::from_fstype(&fstype) else {
            continue;
        };

        let mount_path = normalize_path(&unescape_field(fields[1]));
        if !seen.insert(mount_path.clone()) {
            warn!(mount = %mount_path.display(), "duplicate fstab entry ignored");
            continue;
        }

        entries.push(MountEntry {
            mount_path,
            remote_target: unescape_field(fields[0]),
            kind,
            fstype,
            options: fields.get(3).copied().unwrap_or("defaults").to_string(),
        });
    }

    entries
}

/// Read the live mount table
pub fn read_live_mounts(path: &Path) -> Result<Vec<LiveMount>> {
    let content = fs::read_to_string(path).map_err(|e| Error::MountTable {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(parse_live_mounts(&content))
}

/// Parse `/proc/mounts` formatted content
pub fn parse_live_mounts(content: &str) -> Vec<LiveMount> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(LiveMount {
                source: unescape_field(source),
                target: normalize_path(&unescape_field(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

fn normalize_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

/// Decode `\ooo` octal escapes used by the kernel and fstab for whitespace
fn unescape_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() {
            let octal = &bytes[index + 1..index + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let num = octal
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(num) {
                    output.push(byte);
                    index += 4;
                    continue;
                }
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}
