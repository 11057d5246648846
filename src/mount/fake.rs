//! Scriptable in-memory mount system for tests

use crate::error::{Error, Result};
use crate::mount::system::{Access, MountSystem, StatKind, UnmountMode};
use crate::mount::types::{LiveMount, MountEntry, Residue};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Recorded side-effecting call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount(PathBuf),
    Unmount(PathBuf, UnmountMode),
}

/// Fake host whose live table and failures are scripted per path
///
/// Scripted stat and mount results are consumed in order; the last one
/// keeps repeating once the script runs out.
#[derive(Default)]
pub struct FakeMountSystem {
    live: RefCell<Vec<LiveMount>>,
    sentinels: HashSet<PathBuf>,
    stats: RefCell<HashMap<PathBuf, VecDeque<Access>>>,
    mounts: RefCell<HashMap<PathBuf, VecDeque<std::result::Result<(), String>>>>,
    stuck: HashSet<PathBuf>,
    residues: HashMap<PathBuf, Residue>,
    query_fails: bool,
    calls: RefCell<Vec<Call>>,
}

impl FakeMountSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `entry` present in the live table
    pub fn with_mounted(self, entry: &MountEntry) -> Self {
        self.live.borrow_mut().push(live_row(entry, &entry.fstype));
        self
    }

    /// Start with `path` mounted under a different filesystem type
    pub fn with_mounted_as(self, entry: &MountEntry, fstype: &str) -> Self {
        self.live.borrow_mut().push(live_row(entry, fstype));
        self
    }

    /// The share behind `mount_path` carries a readable sentinel
    pub fn with_sentinel(mut self, mount_path: impl Into<PathBuf>) -> Self {
        self.sentinels.insert(mount_path.into());
        self
    }

    /// Script bounded-stat results for `path`
    pub fn script_stat(self, path: impl Into<PathBuf>, results: Vec<Access>) -> Self {
        self.stats.borrow_mut().insert(path.into(), results.into());
        self
    }

    /// Script mount results for `mount_path` (`Err` carries the stderr text)
    pub fn script_mount(
        self,
        mount_path: impl Into<PathBuf>,
        results: Vec<std::result::Result<(), String>>,
    ) -> Self {
        self.mounts.borrow_mut().insert(mount_path.into(), results.into());
        self
    }

    /// Every unmount stage fails for `mount_path`
    pub fn with_stuck(mut self, mount_path: impl Into<PathBuf>) -> Self {
        self.stuck.insert(mount_path.into());
        self
    }

    pub fn with_residue(mut self, mount_path: impl Into<PathBuf>, residue: Residue) -> Self {
        self.residues.insert(mount_path.into(), residue);
        self
    }

    pub fn with_failing_query(mut self) -> Self {
        self.query_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn mount_calls(&self, path: &Path) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, Call::Mount(p) if p == path))
            .count()
    }

    pub fn unmount_calls(&self, path: &Path) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, Call::Unmount(p, _) if p == path))
            .count()
    }

    fn is_mounted(&self, path: &Path) -> bool {
        self.live.borrow().iter().any(|m| m.occupies(path))
    }

    fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn live_row(entry: &MountEntry, fstype: &str) -> LiveMount {
    LiveMount {
        source: entry.remote_target.clone(),
        target: entry.mount_path.clone(),
        fstype: fstype.to_string(),
    }
}

impl MountSystem for FakeMountSystem {
    fn query(&self) -> Result<Vec<LiveMount>> {
        if self.query_fails {
            return Err(Error::MountTable {
                path: PathBuf::from("/proc/self/mounts"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        Ok(self.live.borrow().clone())
    }

    fn stat(&self, path: &Path, kind: StatKind, _timeout: Duration) -> Access {
        if let Some(queue) = self.stats.borrow_mut().get_mut(path) {
            if let Some(access) = Self::next_scripted(queue) {
                return access;
            }
        }

        match kind {
            StatKind::Directory => Access::Ok,
            StatKind::File => {
                let parent = path.parent().unwrap_or(path);
                if self.is_mounted(parent) && self.sentinels.contains(parent) {
                    Access::Ok
                } else {
                    Access::Missing
                }
            }
        }
    }

    fn unmount(&self, path: &Path, mode: UnmountMode, _timeout: Duration) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(Call::Unmount(path.to_path_buf(), mode));

        if self.stuck.contains(path) {
            return Err(Error::Unmount {
                path: path.to_path_buf(),
                message: "device is busy".to_string(),
            });
        }

        self.live.borrow_mut().retain(|m| !m.occupies(path));
        Ok(())
    }

    fn mount(&self, entry: &MountEntry, _timeout: Duration) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(Call::Mount(entry.mount_path.clone()));

        let scripted = self
            .mounts
            .borrow_mut()
            .get_mut(&entry.mount_path)
            .and_then(Self::next_scripted);

        match scripted {
            Some(Err(message)) => Err(Error::CommandFailed {
                command: format!("mount {}", entry.mount_path.display()),
                message,
            }),
            _ => {
                self.live.borrow_mut().push(live_row(entry, &entry.fstype));
                Ok(())
            }
        }
    }

    fn residue(&self, path: &Path, _skip: &str, _limit: usize, _timeout: Duration) -> Result<Residue> {
        Ok(self.residues.get(path).cloned().unwrap_or_default())
    }

    fn prepare_mountpoint(&self, _path: &Path, _timeout: Duration) -> Result<bool> {
        Ok(false)
    }
}
