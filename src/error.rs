// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Error taxonomy for the backup agent.
///
/// `Config` and `Storage` (when it occurs at ledger open) are fatal and map
/// to exit code 200. `Transient` drives a bounded retry via the
/// [`crate::retry::RetryCounter`]. `Permanent` means an event is banned.
/// `Fatal` is an unrecoverable condition that escalates to the supervisor.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("event '{event_id}' permanently failed: {reason}")]
    Permanent { event_id: String, reason: String },

    #[error("ledger storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl BackupError {
    /// Whether this error should be retried via the [`crate::retry::RetryCounter`]
    /// rather than treated as fatal or permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
