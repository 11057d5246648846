//! Bridge: one complete check cycle
//!
//! Handles:
//! - Creating missing mountpoints
//! - Probing each configured mount in configuration order
//! - Remediating broken mounts and recording the result per mount
//! - Batching transition notifications into one summary email
//! - Appending the cycle to the audit log
//!
//! Only configuration problems stop a cycle; everything else is contained
//! to the mount it concerns.

use crate::dispatch::{self, Courier, Delivery, NotificationEvent, NotificationGateway};
use crate::ledger::StatusLedger;
use crate::logbook::{AuditEntry, AuditLog, CycleRecord};
use crate::logging::CaptureBuffer;
use crate::manifest::MooringConfig;
use crate::mount::{MountEntry, MountSystem};
use crate::sickbay::{
    Action, MountProbe, MountStatus, RemediationEngine, RemediationOutcome, RemediationPolicy,
    Verdict,
};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of one cycle
#[derive(Debug)]
pub struct CycleReport {
    pub record: CycleRecord,
    pub outcomes: Vec<RemediationOutcome>,
    pub delivery: Delivery,
}

impl CycleReport {
    pub fn broken(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_healthy()).count()
    }

    pub fn repaired(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action_taken == Action::Remounted)
            .count()
    }
}

/// What the operator should learn about one mount once the email lands
struct Pending {
    mount_path: PathBuf,
    status: MountStatus,
    unverified: bool,
    reported: bool,
}

/// Drives check cycles against a mount system
pub struct Bridge<'a, S: MountSystem + ?Sized, C: Courier + ?Sized> {
    config: &'a MooringConfig,
    system: &'a S,
    courier: &'a C,
    hostname: String,
    debug_output: Option<&'a CaptureBuffer>,
}

impl<'a, S: MountSystem + ?Sized, C: Courier + ?Sized> Bridge<'a, S, C> {
    pub fn new(config: &'a MooringConfig, system: &'a S, courier: &'a C, hostname: impl Into<String>) -> Self {
        Self {
            config,
            system,
            courier,
            hostname: hostname.into(),
            debug_output: None,
        }
    }

    /// Append the cycle's captured log output to the summary email
    pub fn with_debug_output(mut self, capture: &'a CaptureBuffer) -> Self {
        self.debug_output = Some(capture);
        self
    }

    /// Run one check cycle over `mounts`
    ///
    /// A dry run probes and reports but never touches mounts, the ledger
    /// or the notification transport.
    pub fn run_cycle(&self, mounts: &[MountEntry], dry_run: bool) -> CycleReport {
        let global = &self.config.config;
        let started = Instant::now();
        let mut record = CycleRecord::begin(self.hostname.clone(), dry_run);

        info!(
            cycle = %record.cycle_id,
            mounts = mounts.len(),
            dry_run,
            "check cycle started"
        );

        let mut ledger = StatusLedger::load(&global.state_file);
        let probe = MountProbe::new(self.system, &global.sentinel_file, global.probe_timeout());
        let engine = RemediationEngine::new(self.system, probe, RemediationPolicy::from_config(self.config));

        let mut outcomes = Vec::with_capacity(mounts.len());
        let mut events: Vec<NotificationEvent> = Vec::new();
        let mut pending = Vec::with_capacity(mounts.len());

        for entry in mounts {
            let path = entry.mount_path.display().to_string();

            if global.create_missing_mountpoints && !dry_run {
                match self.system.prepare_mountpoint(&entry.mount_path, global.probe_timeout()) {
                    Ok(true) => info!(mount = %path, "created missing mountpoint"),
                    Ok(false) => {}
                    Err(e) => error!(mount = %path, error = %e, "cannot create mountpoint"),
                }
            }

            let prior = ledger.prior(&entry.mount_path);
            let notified = ledger.notified(&entry.mount_path);
            let warned = ledger.unverified_warned(&entry.mount_path);

            let initial = engine.probe().probe(entry);
            debug!(
                mount = %path,
                mounted = initial.is_mounted,
                responsive = initial.is_responsive,
                sentinel = %initial.sentinel,
                "probe complete"
            );

            let outcome = if dry_run {
                RemediationOutcome::observed(entry, &initial)
            } else {
                engine.remediate(entry, &initial)
            };

            let event =
                dispatch::classify(entry, &outcome, notified, warned, self.config.notifications.policy);

            if !dry_run {
                ledger.record(&entry.mount_path, outcome.final_status, Utc::now());
                if let Err(e) = ledger.save() {
                    warn!(mount = %path, error = %e, "failed to update status ledger");
                }
            }

            pending.push(Pending {
                mount_path: entry.mount_path.clone(),
                status: outcome.final_status,
                unverified: outcome.is_healthy()
                    && (outcome.verdict == Verdict::Unverified
                        || outcome.sentinel_missing_after_remount),
                reported: event.is_some(),
            });
            events.extend(event);

            log_outcome(&path, prior, &outcome);
            record.push(AuditEntry::new(entry, prior, &outcome, &initial));
            outcomes.push(outcome);
        }

        let delivery = if dry_run {
            for event in &events {
                info!(severity = %event.severity, "dry run, would notify: {}", event.subject);
            }
            Delivery::DryRun(events.len())
        } else {
            let gateway = NotificationGateway::new(
                self.courier,
                &self.config.notifications,
                &self.config.throttle,
                &self.hostname,
            );
            let debug_output = self.debug_output.map(CaptureBuffer::contents);
            let mut bucket = ledger.throttle().clone();
            let delivery = gateway.notify(&events, debug_output.as_deref(), &mut bucket, Utc::now());

            // Undelivered changes stay unacknowledged and are reported next cycle
            let delivered = delivery.acknowledged();
            for p in pending.iter().filter(|p| delivered || !p.reported) {
                ledger.acknowledge(&p.mount_path, p.status, p.unverified);
            }
            if !delivered {
                warn!(
                    events = events.len(),
                    "notifications not delivered, changes will be reported again next cycle"
                );
            }
            if delivery.drew_token() {
                ledger.set_throttle(bucket);
            }
            if let Err(e) = ledger.save() {
                warn!(error = %e, "failed to persist notification state");
            }
            delivery
        };

        record.finish();
        let audit = AuditLog::new(&global.audit_log);
        if let Err(e) = audit.record(&record) {
            warn!(path = %audit.path().display(), error = %e, "audit record lost for this cycle");
        }

        let report = CycleReport {
            record,
            outcomes,
            delivery,
        };

        info!(
            cycle = %report.record.cycle_id,
            mounts = mounts.len(),
            broken = report.broken(),
            repaired = report.repaired(),
            runtime_ms = started.elapsed().as_millis() as u64,
            "check cycle finished"
        );

        report
    }
}

/// One structured event per mount outcome
fn log_outcome(path: &str, prior: Option<MountStatus>, outcome: &RemediationOutcome) {
    let prior = prior.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string());
    let detail = outcome.detail.as_deref().unwrap_or("");

    match outcome.final_status {
        MountStatus::Healthy => info!(
            mount = %path,
            prior = %prior,
            status = %outcome.final_status,
            action = %outcome.action_taken,
            attempts = outcome.attempts,
            "mount checked"
        ),
        MountStatus::Broken => warn!(
            mount = %path,
            prior = %prior,
            status = %outcome.final_status,
            action = %outcome.action_taken,
            attempts = outcome.attempts,
            detail = %detail,
            "mount checked"
        ),
    }
}
