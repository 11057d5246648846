//! Network mount management module
//!
//! This module provides:
//! - Mount entry types for NFS and SMB/CIFS shares
//! - Parsers for the static (fstab) and live (/proc/mounts) tables
//! - The `MountSystem` capability used for probing and remediation

pub mod system;
pub mod table;
pub mod types;

#[cfg(test)]
pub mod fake;

// Re-exports
pub use system::{Access, HostMountSystem, MountSystem, StatKind, UnmountMode};
pub use table::load_fstab;
pub use types::{FsKind, MountEntry, Residue};
