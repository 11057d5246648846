//! Remediation of broken mounts
//!
//! One pass per broken mount per cycle: escalate the unmount (soft,
//! force, lazy), look for files written into the bare mountpoint, mount
//! again from the configured remote and re-probe. Attempts are capped by
//! `max_attempts` and spaced by exponential backoff; a mount that is
//! still broken is left for the next scheduled cycle.

use crate::error::{Error, Result};
use crate::manifest::{MooringConfig, RetryConfig};
use crate::mount::{MountEntry, MountSystem, Residue, UnmountMode};
use crate::sickbay::probe::{MountProbe, ProbeResult, SentinelState, Verdict};
use crate::sickbay::state::{MountLifecycle, MountStatus, RepairState};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What remediation did to a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Nothing to do, or remediation not permitted
    None,
    /// Unmounted and mounted again successfully
    Remounted,
    /// Every attempt this cycle failed
    RemountFailed,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::None => write!(f, "none"),
            Action::Remounted => write!(f, "remounted"),
            Action::RemountFailed => write!(f, "remount_failed"),
        }
    }
}

/// Outcome of remediating one mount in one cycle
#[derive(Debug, Clone)]
pub struct RemediationOutcome {
    pub mount_path: PathBuf,
    pub action_taken: Action,
    pub attempts: u8,
    pub final_status: MountStatus,
    /// Classification from the initial probe
    pub verdict: Verdict,
    /// Last failure reason
    pub detail: Option<String>,
    /// Files found in the bare mountpoint after unmounting
    pub residue: Option<Residue>,
    /// Remount worked but the sentinel is still absent
    pub sentinel_missing_after_remount: bool,
}

impl RemediationOutcome {
    /// Outcome for a mount that was not remediated
    pub fn observed(entry: &MountEntry, probe: &ProbeResult) -> Self {
        let verdict = probe.verdict();
        let final_status = if verdict.is_broken() {
            MountStatus::Broken
        } else {
            MountStatus::Healthy
        };
        let detail = verdict.is_broken().then(|| verdict.reason());

        Self {
            mount_path: entry.mount_path.clone(),
            action_taken: Action::None,
            attempts: 0,
            final_status,
            verdict,
            detail,
            residue: None,
            sentinel_missing_after_remount: false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.final_status == MountStatus::Healthy
    }
}

/// Limits and delays governing remediation
#[derive(Debug, Clone)]
pub struct RemediationPolicy {
    pub max_attempts: u8,
    pub unmount_timeout: Duration,
    pub mount_timeout: Duration,
    pub settle: Duration,
    pub residual_listing: usize,
    pub retry: RetryConfig,
}

impl RemediationPolicy {
    pub fn from_config(config: &MooringConfig) -> Self {
        let global = &config.config;
        Self {
            max_attempts: global.max_attempts,
            unmount_timeout: global.unmount_timeout(),
            mount_timeout: global.mount_timeout(),
            settle: global.settle(),
            residual_listing: global.residual_listing,
            retry: config.retry.clone(),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .base_delay_ms(self.retry.base_delay_ms)
            .max_delay_ms(self.retry.max_delay_ms)
            .multiplier(self.retry.multiplier)
            .max_attempts(self.max_attempts)
            .jitter_factor(self.retry.jitter_factor)
    }
}

/// Drives broken mounts back to health
pub struct RemediationEngine<'a, S: MountSystem + ?Sized> {
    system: &'a S,
    probe: MountProbe<'a, S>,
    policy: RemediationPolicy,
}

impl<'a, S: MountSystem + ?Sized> RemediationEngine<'a, S> {
    pub fn new(system: &'a S, probe: MountProbe<'a, S>, policy: RemediationPolicy) -> Self {
        Self {
            system,
            probe,
            policy,
        }
    }

    /// The probe used for initial checks and verification
    pub fn probe(&self) -> &MountProbe<'a, S> {
        &self.probe
    }

    /// Repair `entry` if `initial` shows it broken
    pub fn remediate(&self, entry: &MountEntry, initial: &ProbeResult) -> RemediationOutcome {
        let mut outcome = RemediationOutcome::observed(entry, initial);
        if !outcome.verdict.is_broken() {
            return outcome;
        }

        let path = entry.mount_path.display().to_string();
        let mut lifecycle = MountLifecycle::new();
        advance(&path, "fail", lifecycle.fail());

        warn!(
            mount = %path,
            reason = %outcome.verdict.reason(),
            "mount broken, starting remediation"
        );

        let backoff = self.policy.backoff();
        let mut rng = rng();

        while outcome.attempts < self.policy.max_attempts {
            if outcome.attempts > 0 {
                if let Some(delay_ms) = backoff.delay(outcome.attempts, &mut rng) {
                    debug!(mount = %path, delay_ms, "waiting before next remount attempt");
                    thread::sleep(Duration::from_millis(delay_ms));
                }
            }

            outcome.attempts += 1;
            advance(&path, "repair", lifecycle.repair());

            match self.attempt(entry, &mut outcome.residue) {
                Ok(result) if result.is_healthy() => {
                    advance(&path, "recover", lifecycle.recover());
                    outcome.sentinel_missing_after_remount =
                        result.sentinel == SentinelState::Missing;
                    info!(mount = %path, attempt = outcome.attempts, "remount successful");
                    break;
                }
                Ok(result) => {
                    let reason = result.verdict().reason();
                    warn!(mount = %path, attempt = outcome.attempts, reason = %reason, "mount still broken after remount");
                    outcome.detail = Some(reason);
                }
                Err(e) => {
                    warn!(mount = %path, attempt = outcome.attempts, error = %e, "remount attempt failed");
                    outcome.detail = Some(e.to_string());
                }
            }

            if outcome.attempts >= self.policy.max_attempts {
                advance(&path, "abandon", lifecycle.abandon());
            } else {
                advance(&path, "relapse", lifecycle.relapse());
            }
        }

        if lifecycle.state() == RepairState::Healthy {
            outcome.action_taken = Action::Remounted;
            outcome.final_status = MountStatus::Healthy;
            outcome.detail = None;
            if outcome.sentinel_missing_after_remount {
                warn!(mount = %path, "remount succeeded but sentinel file is missing");
            }
        } else {
            outcome.action_taken = Action::RemountFailed;
            outcome.final_status = MountStatus::Broken;
            error!(
                mount = %path,
                attempts = outcome.attempts,
                "mount persistently broken, retrying next cycle"
            );
        }

        outcome
    }

    /// One unmount, inspect, mount, verify pass
    fn attempt(&self, entry: &MountEntry, residue: &mut Option<Residue>) -> Result<ProbeResult> {
        self.release(entry)?;

        if residue.is_none() {
            *residue = self.inspect_residue(entry);
        }

        self.system.mount(entry, self.policy.mount_timeout)?;
        thread::sleep(self.policy.settle);

        Ok(self.probe.probe(entry))
    }

    /// Escalate through the unmount ladder until the path is free
    fn release(&self, entry: &MountEntry) -> Result<()> {
        if !self.occupied(entry)? {
            return Ok(());
        }

        let path = &entry.mount_path;
        for mode in UnmountMode::ladder() {
            if let Err(e) = self
                .system
                .unmount(path, *mode, self.policy.unmount_timeout)
            {
                warn!(mount = %path.display(), stage = %mode, error = %e, "unmount stage failed");
            }

            thread::sleep(self.policy.settle);

            if !self.occupied(entry)? {
                info!(mount = %path.display(), stage = %mode, "unmount successful");
                return Ok(());
            }
        }

        Err(Error::Unmount {
            path: path.clone(),
            message: "still mounted after soft, force and lazy unmount".to_string(),
        })
    }

    fn occupied(&self, entry: &MountEntry) -> Result<bool> {
        Ok(self
            .system
            .query()?
            .iter()
            .any(|m| m.occupies(&entry.mount_path)))
    }

    fn inspect_residue(&self, entry: &MountEntry) -> Option<Residue> {
        if self.policy.residual_listing == 0 {
            return None;
        }

        match self.system.residue(
            &entry.mount_path,
            self.probe.sentinel_name(),
            self.policy.residual_listing,
            self.policy.unmount_timeout,
        ) {
            Ok(residue) if residue.is_empty() => None,
            Ok(residue) => {
                warn!(
                    mount = %entry.mount_path.display(),
                    residue = %residue.summary(),
                    "residual files appear to have been written while the share was offline"
                );
                Some(residue)
            }
            Err(e) => {
                warn!(mount = %entry.mount_path.display(), error = %e, "could not inspect mountpoint");
                None
            }
        }
    }
}

fn advance(mount: &str, event: &str, step: std::result::Result<(), state_machines::DynamicError>) {
    if let Err(e) = step {
        warn!(mount = %mount, event, error = ?e, "unexpected repair state transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::fake::{Call, FakeMountSystem};
    use crate::mount::{Access, FsKind};
    use std::path::Path;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn policy(max_attempts: u8) -> RemediationPolicy {
        RemediationPolicy {
            max_attempts,
            unmount_timeout: TIMEOUT,
            mount_timeout: TIMEOUT,
            settle: Duration::ZERO,
            residual_listing: 20,
            retry: RetryConfig {
                base_delay_ms: 0,
                max_delay_ms: 0,
                multiplier: 1.0,
                jitter_factor: 0.0,
            },
        }
    }

    fn run(fake: &FakeMountSystem, entry: &MountEntry, max_attempts: u8) -> RemediationOutcome {
        let probe = MountProbe::new(fake, ".checkMount", TIMEOUT);
        let engine = RemediationEngine::new(fake, probe, policy(max_attempts));
        let initial = engine.probe().probe(entry);
        engine.remediate(entry, &initial)
    }

    #[test]
    fn test_healthy_mount_untouched() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new()
            .with_mounted(&entry)
            .with_sentinel("/srv/nfs1");

        let outcome = run(&fake, &entry, 3);
        assert_eq!(outcome.action_taken, Action::None);
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.is_healthy());
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_unverified_mount_untouched() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new().with_mounted(&entry);

        let outcome = run(&fake, &entry, 3);
        assert_eq!(outcome.action_taken, Action::None);
        assert_eq!(outcome.verdict, Verdict::Unverified);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_unmounted_share_remounted() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new().with_sentinel("/srv/nfs1");

        let outcome = run(&fake, &entry, 3);
        assert_eq!(outcome.action_taken, Action::Remounted);
        assert_eq!(outcome.final_status, MountStatus::Healthy);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.verdict, Verdict::Unmounted);
        // Nothing to unmount
        assert_eq!(fake.calls(), vec![Call::Mount(PathBuf::from("/srv/nfs1"))]);
    }

    #[test]
    fn test_stale_share_unmounted_then_remounted() {
        let entry = MountEntry::new("/srv/smb1", "//nas/share", FsKind::Smb);
        let fake = FakeMountSystem::new()
            .with_mounted(&entry)
            .with_sentinel("/srv/smb1")
            .script_stat("/srv/smb1", vec![Access::TimedOut, Access::Ok]);

        let outcome = run(&fake, &entry, 3);
        assert_eq!(outcome.action_taken, Action::Remounted);
        assert_eq!(
            fake.calls(),
            vec![
                Call::Unmount(PathBuf::from("/srv/smb1"), UnmountMode::Soft),
                Call::Mount(PathBuf::from("/srv/smb1")),
            ]
        );
    }

    #[test]
    fn test_attempts_capped_when_mount_keeps_failing() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new().script_mount(
            "/srv/nfs1",
            vec![Err("mount.nfs: Connection timed out".to_string())],
        );

        let outcome = run(&fake, &entry, 2);
        assert_eq!(outcome.action_taken, Action::RemountFailed);
        assert_eq!(outcome.final_status, MountStatus::Broken);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(fake.mount_calls(Path::new("/srv/nfs1")), 2);
        assert!(outcome.detail.unwrap().contains("Connection timed out"));
    }

    #[test]
    fn test_single_attempt_with_persistent_timeout() {
        let entry = MountEntry::new("/srv/smb1", "//nas/share", FsKind::Smb);
        let fake = FakeMountSystem::new()
            .with_mounted(&entry)
            .script_stat("/srv/smb1", vec![Access::TimedOut]);

        let outcome = run(&fake, &entry, 1);
        assert_eq!(outcome.action_taken, Action::RemountFailed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(fake.mount_calls(Path::new("/srv/smb1")), 1);
    }

    #[test]
    fn test_recovers_on_second_attempt() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new()
            .with_sentinel("/srv/nfs1")
            .script_mount("/srv/nfs1", vec![Err("busy".to_string()), Ok(())]);

        let outcome = run(&fake, &entry, 3);
        assert_eq!(outcome.action_taken, Action::Remounted);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.detail.is_none());
    }

    #[test]
    fn test_stuck_unmount_walks_the_ladder() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new()
            .with_mounted(&entry)
            .with_stuck("/srv/nfs1")
            .script_stat("/srv/nfs1", vec![Access::Failed("Stale file handle".into())]);

        let outcome = run(&fake, &entry, 1);
        assert_eq!(outcome.action_taken, Action::RemountFailed);
        assert_eq!(fake.unmount_calls(Path::new("/srv/nfs1")), 3);
        assert_eq!(fake.mount_calls(Path::new("/srv/nfs1")), 0);
        assert!(outcome.detail.unwrap().contains("still mounted"));
    }

    #[test]
    fn test_residue_reported_once() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let residue = Residue {
            entries: vec!["offline-write.tmp".to_string()],
            truncated: false,
            total_bytes: 42,
        };
        let fake = FakeMountSystem::new()
            .with_residue("/srv/nfs1", residue.clone())
            .script_mount("/srv/nfs1", vec![Err("refused".to_string())]);

        let outcome = run(&fake, &entry, 2);
        assert_eq!(outcome.residue, Some(residue));
    }

    #[test]
    fn test_unmounted_with_unreadable_sentinel_is_remounted() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new()
            .with_sentinel("/srv/nfs1")
            .script_stat(
                "/srv/nfs1/.checkMount",
                vec![Access::Failed("Permission denied".into()), Access::Ok],
            );

        let outcome = run(&fake, &entry, 3);
        assert_eq!(outcome.verdict, Verdict::Unmounted);
        assert_eq!(outcome.action_taken, Action::Remounted);
        assert_eq!(fake.mount_calls(Path::new("/srv/nfs1")), 1);
    }

    #[test]
    fn test_unreadable_mount_table_fails_without_mounting() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new().with_failing_query();

        let outcome = run(&fake, &entry, 2);
        assert!(matches!(outcome.verdict, Verdict::Stale(_)));
        assert_eq!(outcome.action_taken, Action::RemountFailed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(fake.mount_calls(Path::new("/srv/nfs1")), 0);
    }

    #[test]
    fn test_sentinel_missing_after_remount_is_healthy() {
        let entry = MountEntry::new("/srv/nfs1", "filer:/export", FsKind::Nfs);
        let fake = FakeMountSystem::new();

        let outcome = run(&fake, &entry, 3);
        assert_eq!(outcome.action_taken, Action::Remounted);
        assert!(outcome.sentinel_missing_after_remount);
    }
}
