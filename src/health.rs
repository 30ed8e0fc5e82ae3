//! Partition health reports

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::utils::trim_to_length;

/// Source id of every report raised by the agent
pub const HEALTH_SOURCE_ID: &str = "BackupRestoreAgent";
/// Property carrying backup health
pub const BACKUP_STATUS_PROPERTY: &str = "BackupStatus";
/// Property carrying restore health
pub const RESTORE_STATUS_PROPERTY: &str = "RestoreStatus";
/// Longest description accepted by the health store
pub const MAX_HEALTH_DESCRIPTION_LENGTH: usize = 4096;

const CLEAR_TIME_TO_LIVE: Duration = Duration::from_secs(1);
const USER_RESTORE_TIME_TO_LIVE: Duration = Duration::from_secs(60 * 60);
const RESTORE_FAILURE_TIME_TO_LIVE: Duration = Duration::from_secs(5 * 60);

/// Health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Healthy
    Ok,
    /// Degraded
    Warning,
    /// Unhealthy
    Error,
}

/// One health report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthInformation {
    /// Reporting component
    pub source_id: String,
    /// Reported property
    pub property: String,
    /// Reported state
    pub state: HealthState,
    /// How long the report stays valid; `None` never expires
    pub time_to_live: Option<Duration>,
    /// Drop the report instead of turning it into an error on expiry
    pub remove_when_expired: bool,
    /// Human readable description
    pub description: String,
}

impl HealthInformation {
    fn new(property: &str, state: HealthState, description: String) -> Self {
        Self {
            source_id: HEALTH_SOURCE_ID.to_string(),
            property: property.to_string(),
            state,
            time_to_live: None,
            remove_when_expired: false,
            description: trim_to_length(&description, MAX_HEALTH_DESCRIPTION_LENGTH),
        }
    }

    /// Backup protection was disabled
    pub fn clear_backup() -> Self {
        Self {
            time_to_live: Some(CLEAR_TIME_TO_LIVE),
            remove_when_expired: true,
            ..Self::new(
                BACKUP_STATUS_PROPERTY,
                HealthState::Ok,
                "Backup protection is disabled".into(),
            )
        }
    }

    /// Scheduled backup succeeded
    pub fn backup_success(at: DateTime<Utc>) -> Self {
        Self::new(
            BACKUP_STATUS_PROPERTY,
            HealthState::Ok,
            format!("Backup completed successfully at {}", at.to_rfc3339()),
        )
    }

    /// Scheduled backup failed
    pub fn backup_failure(error: &dyn std::fmt::Display) -> Self {
        Self::new(
            BACKUP_STATUS_PROPERTY,
            HealthState::Warning,
            format!("Backup failed: {}", error),
        )
    }

    /// Restore succeeded
    pub fn restore_success(user_initiated: bool, at: DateTime<Utc>) -> Self {
        let description = if user_initiated {
            format!("Restore requested by the user completed at {}", at.to_rfc3339())
        } else {
            format!("Restore after data loss completed at {}", at.to_rfc3339())
        };
        Self {
            time_to_live: user_initiated.then_some(USER_RESTORE_TIME_TO_LIVE),
            remove_when_expired: true,
            ..Self::new(RESTORE_STATUS_PROPERTY, HealthState::Ok, description)
        }
    }

    /// Restore failed
    pub fn restore_failure(error: &dyn std::fmt::Display) -> Self {
        Self {
            time_to_live: Some(RESTORE_FAILURE_TIME_TO_LIVE),
            ..Self::new(
                RESTORE_STATUS_PROPERTY,
                HealthState::Error,
                format!("Restore failed: {}", error),
            )
        }
    }
}
