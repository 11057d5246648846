//! Unified error types for Mooring

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Mooring operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Failed to read mount table '{path}': {source}")]
    MountTable { path: PathBuf, source: io::Error },

    // Mount operations
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command '{command}' timed out after {secs} seconds")]
    CommandTimeout { command: String, secs: u64 },

    #[error("Failed to unmount '{path}': {message}")]
    Unmount { path: PathBuf, message: String },

    // Reporting
    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Audit log '{path}' write failed: {message}")]
    Audit { path: PathBuf, message: String },

    #[error("Status ledger '{path}': {message}")]
    Ledger { path: PathBuf, message: String },

    #[error("Scheduler installation failed: {0}")]
    Schedule(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error means the cycle itself cannot run
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::ConfigRead { .. }
                | Error::ConfigParse(_)
                | Error::ConfigValidation(_)
                | Error::MountTable { .. }
        )
    }
}

/// Result type alias for Mooring operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(Error::ConfigValidation("bad".into()).is_configuration());
        assert!(
            Error::MountTable {
                path: PathBuf::from("/etc/fstab"),
                source: io::Error::from(io::ErrorKind::NotFound),
            }
            .is_configuration()
        );
        assert!(!Error::Notification("smtp down".into()).is_configuration());
        assert!(
            !Error::CommandTimeout {
                command: "mount".into(),
                secs: 60
            }
            .is_configuration()
        );
    }
}
