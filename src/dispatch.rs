//! Operator notifications
//!
//! Outcomes are turned into events only when they represent a change
//! worth reporting; every event of a cycle goes out in one summary email.
//! Delivery failures are logged and never retried within the cycle.

use crate::error::{Error, Result};
use crate::ledger::ThrottleState;
use crate::manifest::{NotificationConfig, NotifyPolicy, ThrottleConfig};
use crate::mount::MountEntry;
use crate::sickbay::{Action, MountStatus, RemediationOutcome, Verdict};
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::{Message, SmtpTransport, Transport};
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;
use throttle_machines::token_bucket;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// One reportable change for one mount
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub subject: String,
    pub body: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Decide whether an outcome deserves a notification
///
/// `notified` is the last status that reached the operator; `warned` says
/// whether the missing-sentinel notice did.
pub fn classify(
    entry: &MountEntry,
    outcome: &RemediationOutcome,
    notified: Option<MountStatus>,
    warned: bool,
    policy: NotifyPolicy,
) -> Option<NotificationEvent> {
    let path = entry.mount_path.display();
    let was_broken = notified == Some(MountStatus::Broken);
    let unverified = outcome.verdict == Verdict::Unverified;

    let (subject, severity, mut body) = match (outcome.action_taken, outcome.final_status) {
        (Action::Remounted, _) => (
            format!("Mount {} repaired", path),
            Severity::Warning,
            format!(
                "{} ({}) was {} and has been remounted after {} attempt(s).",
                path,
                entry.remote_target,
                outcome.verdict.reason(),
                outcome.attempts
            ),
        ),
        (_, MountStatus::Broken) => {
            if was_broken && policy == NotifyPolicy::Transitions {
                return None;
            }
            let mut body = format!(
                "{} ({}) is persistently broken: {}.",
                path,
                entry.remote_target,
                outcome.verdict.reason()
            );
            if outcome.attempts > 0 {
                let _ = write!(body, "\nRemount failed after {} attempt(s).", outcome.attempts);
            }
            if let Some(detail) = &outcome.detail {
                let _ = write!(body, "\nLast error: {}", detail);
            }
            (
                format!("Mount {} persistently broken", path),
                Severity::Critical,
                body,
            )
        }
        (_, MountStatus::Healthy) if was_broken => {
            let mut body =
                format!("{} ({}) is responding again without intervention.", path, entry.remote_target);
            if unverified && !warned {
                body.push_str("\nIt has no sentinel file; create it once the share contents are verified.");
            }
            (format!("Mount {} recovered", path), Severity::Info, body)
        }
        (_, MountStatus::Healthy) if unverified && !warned => (
            format!("Mount {} has no sentinel file", path),
            Severity::Info,
            format!(
                "{} ({}) is mounted and responsive but has no sentinel file. \
                 Create it once the share contents are verified.",
                path, entry.remote_target
            ),
        ),
        _ => return None,
    };

    if outcome.sentinel_missing_after_remount {
        body.push_str("\nThe sentinel file is missing after the remount; verify share contents.");
    }
    if let Some(residue) = &outcome.residue {
        let _ = write!(
            body,
            "\nFiles were written to the mountpoint while the share was offline: {}",
            residue.summary()
        );
    }

    Some(NotificationEvent {
        subject,
        body,
        severity,
        timestamp: Utc::now(),
    })
}

/// Render the cycle's events as one email
///
/// `debug_output` is appended as a final section when present.
pub fn summary(
    hostname: &str,
    events: &[NotificationEvent],
    debug_output: Option<&str>,
) -> (String, String) {
    let subject = format!("[mooring] {} Summary Report", hostname);

    let mut body = format!(
        "Network share monitoring on {} reported {} event(s).\n",
        hostname,
        events.len()
    );
    for event in events {
        let _ = write!(
            body,
            "\n== {} ==\nTime: {}\nSeverity: {}\n\n{}\n",
            event.subject,
            event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            event.severity,
            event.body
        );
    }
    if let Some(output) = debug_output {
        let _ = write!(body, "\n== Debug Output ==\nComplete cycle output:\n\n{}\n", output);
    }

    (subject, body)
}

/// Transport for a rendered notification
pub trait Courier {
    fn deliver(&self, subject: &str, body: &str) -> Result<()>;
}

/// SMTP delivery through a plain relay
pub struct SmtpCourier {
    config: NotificationConfig,
}

impl SmtpCourier {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn message(&self, subject: &str, body: &str) -> Result<Message> {
        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| Error::Notification(format!("invalid sender '{}': {}", self.config.from, e)))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);

        for to in &self.config.to {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| Error::Notification(format!("invalid recipient '{}': {}", to, e)))?;
            builder = builder.to(mailbox);
        }

        builder
            .body(body.to_string())
            .map_err(|e| Error::Notification(e.to_string()))
    }
}

impl Courier for SmtpCourier {
    fn deliver(&self, subject: &str, body: &str) -> Result<()> {
        let message = self.message(subject, body)?;

        let mailer = SmtpTransport::builder_dangerous(self.config.server.as_str())
            .port(self.config.port)
            .timeout(Some(Duration::from_secs(self.config.timeout_secs)))
            .build();

        mailer
            .send(&message)
            .map_err(|e| Error::Notification(format!("{}:{}: {}", self.config.server, self.config.port, e)))?;

        Ok(())
    }
}

/// What happened to a cycle's notifications
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Notifications turned off
    Disabled,
    /// Nothing worth reporting
    Nothing,
    Sent(usize),
    /// Alert-storm throttle is empty
    Throttled(usize),
    Failed(String),
    /// Events withheld by a dry run
    DryRun(usize),
}

impl Delivery {
    /// Every reportable change of the cycle is known to the operator
    ///
    /// Disabled counts: the events were logged and there is nobody to mail.
    pub fn acknowledged(&self) -> bool {
        matches!(self, Delivery::Sent(_) | Delivery::Nothing | Delivery::Disabled)
    }

    /// The throttle bucket was consulted and must be persisted
    pub fn drew_token(&self) -> bool {
        matches!(
            self,
            Delivery::Sent(_) | Delivery::Throttled(_) | Delivery::Failed(_)
        )
    }
}

pub struct NotificationGateway<'a, C: Courier + ?Sized> {
    courier: &'a C,
    config: &'a NotificationConfig,
    throttle: &'a ThrottleConfig,
    hostname: &'a str,
}

impl<'a, C: Courier + ?Sized> NotificationGateway<'a, C> {
    pub fn new(
        courier: &'a C,
        config: &'a NotificationConfig,
        throttle: &'a ThrottleConfig,
        hostname: &'a str,
    ) -> Self {
        Self {
            courier,
            config,
            throttle,
            hostname,
        }
    }

    /// Send the cycle's events as one summary email
    ///
    /// `bucket` is the persisted throttle state and is updated in place.
    /// With `debug_output` the email goes out even without events.
    pub fn notify(
        &self,
        events: &[NotificationEvent],
        debug_output: Option<&str>,
        bucket: &mut ThrottleState,
        now: DateTime<Utc>,
    ) -> Delivery {
        let debug_output = debug_output.filter(|o| !o.is_empty());
        if events.is_empty() && debug_output.is_none() {
            debug!("no state changes to report");
            return Delivery::Nothing;
        }

        if !self.config.enabled {
            for event in events {
                info!(severity = %event.severity, "{} (notifications disabled)", event.subject);
            }
            return Delivery::Disabled;
        }

        if !self.take_token(bucket, now) {
            warn!(
                events = events.len(),
                "notification throttle exhausted, summary email suppressed"
            );
            return Delivery::Throttled(events.len());
        }

        let (subject, body) = summary(self.hostname, events, debug_output);
        match self.courier.deliver(&subject, &body) {
            Ok(()) => {
                info!(
                    events = events.len(),
                    recipients = %self.config.to.join(","),
                    "summary email sent"
                );
                Delivery::Sent(events.len())
            }
            Err(e) => {
                error!(error = %e, "failed to send notification email");
                Delivery::Failed(e.to_string())
            }
        }
    }

    fn take_token(&self, bucket: &mut ThrottleState, now: DateTime<Utc>) -> bool {
        let capacity = self.throttle.burst;
        let now_secs = epoch_secs(now);
        let tokens = bucket.tokens.unwrap_or(capacity);
        let last_refill_secs = bucket.last_refill.map(epoch_secs).unwrap_or(now_secs);

        let result = token_bucket::check(
            tokens,
            last_refill_secs,
            now_secs,
            capacity,
            self.throttle.refill_rate(),
        );

        // Keep refill tracking current even when denied
        bucket.tokens = Some(result.new_tokens);
        bucket.last_refill = Some(now);

        result.allowed
    }
}

fn epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}
