//! Mount repair state machine
//!
//! Type-safe state machine for one mount's repair within a cycle, using
//! the state-machines crate in dynamic dispatch mode so remediation can
//! drive it from probe results.

use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::fmt;

state_machine! {
    name: MountMachine,
    dynamic: true,
    initial: Healthy,
    states: [Healthy, Broken, Repairing, BrokenPersistent],
    events {
        fail {
            transition: { from: Healthy, to: Broken }
        }
        repair {
            transition: { from: Broken, to: Repairing }
        }
        relapse {
            transition: { from: Repairing, to: Broken }
        }
        recover {
            transition: { from: Repairing, to: Healthy }
        }
        abandon {
            transition: { from: Repairing, to: BrokenPersistent }
        }
    }
}

/// Simple state enum for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairState {
    Healthy,
    Broken,
    Repairing,
    BrokenPersistent,
}

impl RepairState {
    /// Parse state from string representation
    pub fn from_str(s: &str) -> Self {
        match s {
            "Healthy" => RepairState::Healthy,
            "Broken" => RepairState::Broken,
            "Repairing" => RepairState::Repairing,
            "BrokenPersistent" => RepairState::BrokenPersistent,
            _ => RepairState::Broken, // Fallback
        }
    }
}

/// Status persisted across cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Healthy,
    Broken,
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountStatus::Healthy => write!(f, "healthy"),
            MountStatus::Broken => write!(f, "broken"),
        }
    }
}

/// Repair lifecycle of one mount within one cycle
pub struct MountLifecycle {
    machine: DynamicMountMachine<()>,
}

impl MountLifecycle {
    pub fn new() -> Self {
        Self {
            machine: MountMachine::new(()).into_dynamic(),
        }
    }

    /// Get current state as enum
    pub fn state(&self) -> RepairState {
        RepairState::from_str(self.machine.current_state())
    }

    /// Probe found the mount broken
    pub fn fail(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(MountMachineEvent::Fail)
    }

    /// Begin a remount attempt
    pub fn repair(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(MountMachineEvent::Repair)
    }

    /// Remount attempt did not restore the mount
    pub fn relapse(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(MountMachineEvent::Relapse)
    }

    /// Re-probe after remount reported the mount healthy
    pub fn recover(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(MountMachineEvent::Recover)
    }

    /// The last permitted attempt did not restore the mount
    pub fn abandon(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(MountMachineEvent::Abandon)
    }
}

impl Default for MountLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
