//! Operating system mount capability
//!
//! Everything the probe and remediation code needs from the host goes
//! through [`MountSystem`], so tests can substitute an in-memory fake.
//! Every operation that may touch a network filesystem is bounded by a
//! timeout: a hung NFS server must never stall the cycle.

use crate::error::{Error, Result};
use crate::mount::table::read_live_mounts;
use crate::mount::types::{LiveMount, MountEntry, Residue};
use crossbeam::channel;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use std::fmt;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Read};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// What kind of object a bounded stat expects to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// A directory whose first entry must be listable
    Directory,
    /// A regular file that must be readable
    File,
}

/// Result of a bounded filesystem access
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// The operation completed
    Ok,
    /// The path does not exist
    Missing,
    /// The operation returned an error
    Failed(String),
    /// The operation did not finish within the timeout
    TimedOut,
}

impl Access {
    pub fn is_ok(&self) -> bool {
        matches!(self, Access::Ok)
    }

    /// Human-readable reason for anything other than `Ok`
    pub fn reason(&self) -> Option<String> {
        match self {
            Access::Ok => None,
            Access::Missing => Some("path does not exist".to_string()),
            Access::Failed(msg) => Some(msg.clone()),
            Access::TimedOut => Some("operation timed out".to_string()),
        }
    }
}

/// Unmount escalation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    /// Plain unmount
    Soft,
    /// `MNT_FORCE`: abort outstanding requests to an unreachable server
    Force,
    /// `MNT_DETACH`: detach now, clean up once no longer busy
    Lazy,
}

impl UnmountMode {
    /// Escalation order used by remediation
    pub fn ladder() -> &'static [UnmountMode] {
        &[UnmountMode::Soft, UnmountMode::Force, UnmountMode::Lazy]
    }

    fn flags(self) -> MntFlags {
        match self {
            UnmountMode::Soft => MntFlags::empty(),
            UnmountMode::Force => MntFlags::MNT_FORCE,
            UnmountMode::Lazy => MntFlags::MNT_DETACH,
        }
    }
}

impl fmt::Display for UnmountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmountMode::Soft => write!(f, "soft"),
            UnmountMode::Force => write!(f, "force"),
            UnmountMode::Lazy => write!(f, "lazy"),
        }
    }
}

/// Host capability for querying and manipulating mounts
pub trait MountSystem {
    /// Read the live mount table
    fn query(&self) -> Result<Vec<LiveMount>>;

    /// Access `path` within `timeout`
    fn stat(&self, path: &Path, kind: StatKind, timeout: Duration) -> Access;

    /// Unmount `path`; "not mounted" counts as success
    fn unmount(&self, path: &Path, mode: UnmountMode, timeout: Duration) -> Result<()>;

    /// Mount `entry` from its remote target
    fn mount(&self, entry: &MountEntry, timeout: Duration) -> Result<()>;

    /// List what is left in a bare mountpoint, skipping `skip`
    fn residue(&self, path: &Path, skip: &str, limit: usize, timeout: Duration) -> Result<Residue>;

    /// Create the mountpoint directory if it is missing; returns true if created
    fn prepare_mountpoint(&self, path: &Path, timeout: Duration) -> Result<bool>;
}

/// The real host, backed by `/proc/self/mounts`, `umount2(2)` and `mount(8)`
#[derive(Debug, Clone)]
pub struct HostMountSystem {
    /// Live mount table location
    live_table: PathBuf,
}

impl HostMountSystem {
    pub fn new(live_table: impl Into<PathBuf>) -> Self {
        Self {
            live_table: live_table.into(),
        }
    }
}

impl MountSystem for HostMountSystem {
    fn query(&self) -> Result<Vec<LiveMount>> {
        read_live_mounts(&self.live_table)
    }

    fn stat(&self, path: &Path, kind: StatKind, timeout: Duration) -> Access {
        let owned = path.to_path_buf();
        let outcome = bounded(timeout, move || match kind {
            StatKind::Directory => list_first_entry(&owned),
            StatKind::File => read_first_byte(&owned),
        });

        match outcome {
            Ok(Some(Ok(()))) => Access::Ok,
            Ok(Some(Err(e))) if e.kind() == io::ErrorKind::NotFound => Access::Missing,
            Ok(Some(Err(e))) => Access::Failed(e.to_string()),
            Ok(None) => Access::TimedOut,
            Err(e) => Access::Failed(format!("failed to spawn probe thread: {}", e)),
        }
    }

    fn unmount(&self, path: &Path, mode: UnmountMode, timeout: Duration) -> Result<()> {
        let owned = path.to_path_buf();
        let outcome = bounded(timeout, move || umount2(&owned, mode.flags()))?;

        match outcome {
            Some(Ok(())) | Some(Err(Errno::EINVAL)) | Some(Err(Errno::ENOENT)) => Ok(()),
            Some(Err(errno)) => Err(Error::Unmount {
                path: path.to_path_buf(),
                message: format!("{} unmount: {}", mode, errno.desc()),
            }),
            None => Err(Error::CommandTimeout {
                command: format!("umount ({}) {}", mode, path.display()),
                secs: timeout.as_secs(),
            }),
        }
    }

    fn mount(&self, entry: &MountEntry, timeout: Duration) -> Result<()> {
        let mut args: Vec<String> = vec!["-t".to_string(), entry.fstype.clone()];
        if !entry.options.is_empty() && entry.options != "defaults" {
            args.push("-o".to_string());
            args.push(entry.options.clone());
        }
        args.push(entry.remote_target.clone());
        args.push(entry.mount_path.display().to_string());

        let output = run_command("mount", &args, timeout)?;
        if output.success {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: format!("mount {}", entry.mount_path.display()),
                message: output.stderr.trim().to_string(),
            })
        }
    }

    fn residue(&self, path: &Path, skip: &str, limit: usize, timeout: Duration) -> Result<Residue> {
        let owned = path.to_path_buf();
        let skip = skip.to_string();
        match bounded(timeout, move || scan_residue(&owned, &skip, limit))? {
            Some(result) => Ok(result?),
            None => Err(Error::CommandTimeout {
                command: format!("scan {}", path.display()),
                secs: timeout.as_secs(),
            }),
        }
    }

    fn prepare_mountpoint(&self, path: &Path, timeout: Duration) -> Result<bool> {
        let owned = path.to_path_buf();
        let created = bounded(timeout, move || -> io::Result<bool> {
            if owned.exists() {
                return Ok(false);
            }
            DirBuilder::new().recursive(true).mode(0o755).create(&owned)?;
            Ok(true)
        })?;

        match created {
            Some(result) => Ok(result?),
            None => Err(Error::CommandTimeout {
                command: format!("mkdir {}", path.display()),
                secs: timeout.as_secs(),
            }),
        }
    }
}

/// Run `op` on a worker thread and wait at most `timeout` for it
///
/// Returns `Ok(None)` on timeout. A worker stuck in an uninterruptible
/// syscall is left behind; the process is short-lived and exits anyway.
fn bounded<T, F>(timeout: Duration, op: F) -> io::Result<Option<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = channel::bounded(1);
    thread::Builder::new()
        .name("mooring-io".to_string())
        .spawn(move || {
            let _ = tx.send(op());
        })?;
    Ok(rx.recv_timeout(timeout).ok())
}

fn list_first_entry(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Err(io::Error::other("not a directory"));
    }
    // Listing forces a round trip to the server; metadata alone may be cached.
    if let Some(entry) = fs::read_dir(path)?.next() {
        entry?;
    }
    Ok(())
}

fn read_first_byte(path: &Path) -> io::Result<()> {
    let mut file = File::open(path)?;
    if !file.metadata()?.is_file() {
        return Err(io::Error::other("not a regular file"));
    }
    let mut buf = [0u8; 1];
    file.read(&mut buf)?;
    Ok(())
}

fn scan_residue(path: &Path, skip: &str, limit: usize) -> io::Result<Residue> {
    let mut residue = Residue::default();

    if !path.is_dir() {
        return Ok(residue);
    }

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == skip {
            continue;
        }
        if residue.entries.len() >= limit {
            residue.truncated = true;
            break;
        }
        residue.entries.push(name);
    }

    if residue.is_empty() {
        return Ok(residue);
    }

    residue.total_bytes = WalkDir::new(path)
        .follow_links(false)
        .same_file_system(true)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name().to_string_lossy() == skip))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();

    Ok(residue)
}

/// Captured output of an external command
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stderr: String,
}

/// How long to wait for stderr after the command exits
const STDERR_GRACE: Duration = Duration::from_secs(1);

/// Read stderr on a worker so a chatty helper never blocks on a full pipe
fn drain(stderr: Option<ChildStderr>) -> channel::Receiver<String> {
    let (tx, rx) = channel::bounded(1);
    if let Some(mut handle) = stderr {
        let _ = thread::Builder::new()
            .name("mooring-stderr".to_string())
            .spawn(move || {
                let mut buf = Vec::new();
                let _ = handle.read_to_end(&mut buf);
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
    }
    rx
}

/// Execute a command with timeout enforcement
fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::CommandFailed {
            command: program.to_string(),
            message: e.to_string(),
        })?;

    let stderr = drain(child.stderr.take());

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // A forked helper may keep the pipe open past exit
                let stderr = stderr.recv_timeout(STDERR_GRACE).unwrap_or_default();
                return Ok(CommandOutput {
                    success: status.success(),
                    stderr,
                });
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    // Reap after kill
                    let _ = child.wait();
                    return Err(Error::CommandTimeout {
                        command: format!("{} {}", program, args.join(" ")),
                        secs: timeout.as_secs(),
                    });
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(Error::CommandFailed {
                    command: program.to_string(),
                    message: format!("Failed to wait on process: {}", e),
                });
            }
        }
    }
}
