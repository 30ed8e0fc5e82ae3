//! Error taxonomy for backup and restore operations
//!
//! Every failure is folded into [`BackupRestoreError`]. Callers that need to
//! react to a broken backup chain or a demoted replica switch on
//! [`FailureKind`] rather than matching nested error types.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::coordination::CoordinationError;
use crate::metadata::MetadataError;
use crate::retry::CancellableError;
use crate::store::StoreError;

/// Result type for backup/restore operations
pub type Result<T> = std::result::Result<T, BackupRestoreError>;

/// Main error type for backup/restore operations
#[derive(Error, Debug)]
pub enum BackupRestoreError {
    /// The incremental chain has a gap; a full backup has to be taken
    #[error("Backup chain is broken, a full backup is required")]
    MissingFullBackup,

    /// The replica rejected the requested backup option
    #[error("Invalid backup setting: {0}")]
    InvalidBackupSetting(String),

    /// This replica is no longer the primary
    #[error("Replica is not primary")]
    NotPrimary,

    /// Transient read-status failure on the replica
    #[error("Replica is not readable")]
    NotReadable,

    /// The partition object has been closed by the runtime
    #[error("Partition object is closed")]
    ObjectClosed,

    /// A different on-demand backup is already running
    #[error("Backup request already queued with operation ID {0}")]
    BackupInProgress(Uuid),

    /// Periodic backup is not enabled for the partition
    #[error("Periodic backup is not enabled for this partition")]
    PeriodicBackupNotEnabled,

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation ran out of time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact store error
    #[error("Artifact store error: {0}")]
    Store(#[from] StoreError),

    /// Coordination service error
    #[error("Coordination service error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Metadata encoding error
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error reported by the hosting replica
    #[error("Replica error: {0}")]
    Replica(String),

    /// Join error from background tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Closed classification of failures used to drive scheduling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Restart the chain with a full backup
    ChainBroken,
    /// Tear down all per-primary state
    NotPrimary,
    /// Retry without raising health
    NotReadable,
    /// Cancelled by role change or shutdown
    Cancelled,
    /// Ran out of time
    Timeout,
    /// Protection is disabled; not an error
    Disabled,
    /// Worth retrying
    Transient,
    /// Anything else
    Fatal,
}

impl BackupRestoreError {
    /// Classify this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::MissingFullBackup | Self::InvalidBackupSetting(_) => FailureKind::ChainBroken,
            Self::NotPrimary | Self::ObjectClosed => FailureKind::NotPrimary,
            Self::NotReadable => FailureKind::NotReadable,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::PeriodicBackupNotEnabled => FailureKind::Disabled,
            Self::Io(e) if crate::retry::is_retryable_io(e) => FailureKind::Transient,
            Self::Store(e) if e.is_transient() => FailureKind::Transient,
            Self::Store(StoreError::Cancelled) => FailureKind::Cancelled,
            Self::Coordination(CoordinationError::Cancelled) => FailureKind::Cancelled,
            Self::Coordination(e) if e.is_transient() => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    /// Stable numeric code reported to the coordination service (0 means success)
    pub fn error_code(&self) -> i32 {
        match self {
            Self::MissingFullBackup => 1001,
            Self::InvalidBackupSetting(_) => 1002,
            Self::NotPrimary => 1003,
            Self::NotReadable => 1004,
            Self::ObjectClosed => 1005,
            Self::BackupInProgress(_) => 1006,
            Self::PeriodicBackupNotEnabled => 1007,
            Self::Cancelled => 1008,
            Self::Timeout(_) => 1009,
            Self::Io(_) => 1010,
            Self::Store(_) => 1011,
            Self::Coordination(_) => 1012,
            Self::Metadata(_) => 1013,
            Self::Config(_) => 1014,
            Self::Replica(_) => 1015,
            Self::Join(_) => 1016,
        }
    }
}

impl CancellableError for BackupRestoreError {
    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn is_cancelled(&self) -> bool {
        self.failure_kind() == FailureKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_signals_force_full_backup() {
        assert_eq!(
            BackupRestoreError::MissingFullBackup.failure_kind(),
            FailureKind::ChainBroken
        );
        assert_eq!(
            BackupRestoreError::InvalidBackupSetting("incremental".into()).failure_kind(),
            FailureKind::ChainBroken
        );
    }

    #[test]
    fn role_errors_tear_down() {
        assert_eq!(BackupRestoreError::NotPrimary.failure_kind(), FailureKind::NotPrimary);
        assert_eq!(BackupRestoreError::ObjectClosed.failure_kind(), FailureKind::NotPrimary);
    }

    #[test]
    fn transient_io_is_classified() {
        let err = BackupRestoreError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.failure_kind(), FailureKind::Transient);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        let err = BackupRestoreError::Io(denied);
        assert_eq!(err.failure_kind(), FailureKind::Fatal);
    }

    #[test]
    fn nested_cancellation_is_recognised() {
        assert!(BackupRestoreError::Store(StoreError::Cancelled).is_cancelled());
        assert!(BackupRestoreError::Coordination(CoordinationError::Cancelled).is_cancelled());
        assert!(!BackupRestoreError::NotReadable.is_cancelled());
    }

    #[test]
    fn error_codes_are_non_zero() {
        assert_ne!(BackupRestoreError::Cancelled.error_code(), 0);
        assert_ne!(BackupRestoreError::Timeout("x".into()).error_code(), 0);
    }
}
