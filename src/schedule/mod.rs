//! Backup scheduling
//!
//! [`BackupScheduler`] is what the coordinator owns. It drives a
//! [`PeriodicBackupTimer`] for policy based fires and a
//! [`RescheduleBackoffTimer`] for retries after a failed attempt, both on
//! top of [`OneShotTimer`].

pub mod backoff;
pub mod periodic;
pub mod scheduler;
pub mod timer;

pub use backoff::{RescheduleBackoffTimer, MAX_RESCHEDULE_ATTEMPTS};
pub use periodic::{
    apply_jitter, check_for_missed_backup, next_due_time, random_jitter_millis, PeriodicBackupTimer,
};
pub use scheduler::{BackupScheduler, ScheduleCallback, SchedulerState};
pub use timer::OneShotTimer;
