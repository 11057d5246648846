//! Health checks and self-healing for network mounts
//!
//! Provides:
//! - Bounded probing of mount state, responsiveness and sentinel marker
//! - The per-mount repair state machine
//! - Remediation: escalating unmount, remount, verification

pub mod probe;
pub mod recovery;
pub mod state;

pub use probe::{MountProbe, ProbeResult, Verdict};
pub use recovery::{Action, RemediationEngine, RemediationOutcome, RemediationPolicy};
pub use state::MountStatus;
