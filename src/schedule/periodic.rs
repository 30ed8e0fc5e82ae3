//! Periodic backup timer
//!
//! Works out when the next scheduled backup is due from the active policy
//! and the last recovery point, spreads the fire time with random jitter
//! and arms a one-shot timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::timer::OneShotTimer;
use crate::metadata::BackupMetadata;
use crate::policy::BackupSchedule;

/// Whether a scheduled backup was due while the replica was not running.
///
/// Never true without a recovery point or when the recovery point lies in
/// the future. The reference is the later of the recovery point and the
/// policy assignment. Frequency policies count as missed when more than
/// one interval has passed since the reference; calendar policies when a
/// scheduled instant fell between the reference and `now`.
pub fn check_for_missed_backup(metadata: &BackupMetadata, now: DateTime<Utc>) -> bool {
    let (Some(policy), Some(last)) =
        (metadata.policy.as_ref(), metadata.last_recovery_point.as_ref())
    else {
        return false;
    };

    if last.backup_time > now {
        return false;
    }

    let reference = last.backup_time.max(metadata.policy_update_time);
    match policy.schedule.frequency() {
        Some(interval) => now - reference > interval,
        None => policy
            .schedule
            .last_scheduled_run_time(now)
            .is_some_and(|scheduled| scheduled > reference),
    }
}

/// Next instant a scheduled backup is due.
///
/// `force` computes from `now` and ignores history; used to resume the
/// schedule after repeated failures without firing again immediately.
pub fn next_due_time(
    metadata: &BackupMetadata,
    now: DateTime<Utc>,
    force: bool,
) -> Option<DateTime<Utc>> {
    let schedule = &metadata.policy.as_ref()?.schedule;
    let last_backup_time = metadata.last_recovery_point.as_ref().map(|rp| rp.backup_time);

    match schedule {
        BackupSchedule::Frequency { .. } => {
            let interval = schedule.frequency()?;
            // Without history the first backup is one interval away
            let anchor = match last_backup_time {
                Some(t) if !force => t,
                _ => now,
            };
            Some((anchor + interval).max(now))
        }
        BackupSchedule::Daily { .. } | BackupSchedule::Weekly { .. } => {
            let base = match last_backup_time {
                Some(t) if !force => t.max(now),
                _ => now,
            };
            schedule.next_scheduled_run_time(base)
        }
    }
}

/// Uniform jitter in milliseconds within `[-window, +window]`
pub fn random_jitter_millis(window: Duration) -> i64 {
    let window = window.as_millis().min(i64::MAX as u128) as i64;
    if window == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(-window..=window)
}

/// Apply jitter to a due delay.
///
/// Negative jitter never takes the delay below zero. Returns the delay and
/// the jitter actually applied.
pub fn apply_jitter(due: Duration, jitter_millis: i64) -> (Duration, i64) {
    let due_millis = due.as_millis().min(i64::MAX as u128) as i64;
    let applied = jitter_millis.max(-due_millis);
    let delay = due_millis.saturating_add(applied).max(0) as u64;
    (Duration::from_millis(delay), applied)
}

/// Arms backups according to the active policy
#[derive(Debug)]
pub struct PeriodicBackupTimer {
    metadata: Arc<RwLock<BackupMetadata>>,
    jitter_window: Duration,
    timer: OneShotTimer,
}

impl PeriodicBackupTimer {
    /// Timer reading policy and history from the shared `metadata`
    pub fn new(
        metadata: Arc<RwLock<BackupMetadata>>,
        jitter_window: Duration,
        handle: Handle,
    ) -> Self {
        Self {
            metadata,
            jitter_window,
            timer: OneShotTimer::new(handle),
        }
    }

    /// Delay until the next backup without jitter, `None` when protection
    /// is disabled
    pub fn compute_due(
        &self,
        now: DateTime<Utc>,
        check_for_missed_backups: bool,
        force: bool,
    ) -> Option<Duration> {
        let metadata = self.metadata.read();
        metadata.policy.as_ref()?;

        if check_for_missed_backups && !force && check_for_missed_backup(&metadata, now) {
            info!(
                partition_id = %metadata.partition_id,
                "Backup was missed, scheduling immediately"
            );
            return Some(Duration::ZERO);
        }

        let due_at = next_due_time(&metadata, now, force)?;
        Some((due_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Arm the timer, returning the delay used.
    ///
    /// The jitter applied is recorded in the metadata so the completion
    /// time of the resulting backup can be corrected for it.
    pub fn arm<F>(
        &self,
        check_for_missed_backups: bool,
        force: bool,
        on_fire: F,
    ) -> Option<Duration>
    where
        F: FnOnce() + Send + 'static,
    {
        let due = self.compute_due(Utc::now(), check_for_missed_backups, force)?;
        let (delay, jitter) = apply_jitter(due, random_jitter_millis(self.jitter_window));

        {
            let mut metadata = self.metadata.write();
            metadata.jitter_in_millis_used_in_last_backup = jitter;
            debug!(
                partition_id = %metadata.partition_id,
                due_ms = due.as_millis() as u64,
                jitter_ms = jitter,
                "Arming periodic backup timer"
            );
        }

        self.timer.arm(delay, on_fire);
        Some(delay)
    }

    /// Drop the pending fire
    pub fn cancel(&self) {
        self.timer.cancel();
    }

    /// Whether a fire is pending
    pub fn is_pending(&self) -> bool {
        self.timer.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RecoveryPointInformation;
    use crate::policy::{BackupPolicy, FrequencyInterval};
    use crate::store::BackupStoreInformation;
    use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone, Weekday};
    use uuid::Uuid;

    fn metadata(schedule: BackupSchedule) -> BackupMetadata {
        let policy = BackupPolicy::new(
            "p",
            schedule,
            3,
            BackupStoreInformation::FileShare { path: "/share".into() },
        );
        BackupMetadata::new(Uuid::new_v4(), Some(policy))
    }

    fn hourly() -> BackupSchedule {
        BackupSchedule::Frequency { interval: FrequencyInterval::Hours(1) }
    }

    fn recovery_point(at: DateTime<Utc>) -> RecoveryPointInformation {
        RecoveryPointInformation {
            location: "p/x.tgz".into(),
            backup_time: at,
            backup_id: Uuid::new_v4(),
            backup_chain_id: Uuid::new_v4(),
            backup_index: 0,
        }
    }

    #[test]
    fn no_history_is_never_missed() {
        let mut md = metadata(hourly());
        md.policy_update_time = Utc::now() - ChronoDuration::hours(10);
        assert!(!check_for_missed_backup(&md, Utc::now()));
    }

    #[test]
    fn future_recovery_point_is_never_missed() {
        let now = Utc::now();
        let mut md = metadata(hourly());
        md.policy_update_time = now - ChronoDuration::hours(5);
        md.last_recovery_point = Some(recovery_point(now + ChronoDuration::minutes(1)));
        assert!(!check_for_missed_backup(&md, now));
    }

    #[test]
    fn stale_frequency_backup_is_missed() {
        let now = Utc::now();
        let mut md = metadata(hourly());
        md.policy_update_time = now - ChronoDuration::hours(5);
        md.last_recovery_point = Some(recovery_point(now - ChronoDuration::hours(3)));
        assert!(check_for_missed_backup(&md, now));

        md.last_recovery_point = Some(recovery_point(now - ChronoDuration::minutes(30)));
        assert!(!check_for_missed_backup(&md, now));
    }

    #[test]
    fn skipped_daily_slot_is_missed() {
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        let mut md = metadata(BackupSchedule::Daily {
            run_times: vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()],
        });
        md.policy_update_time = now - ChronoDuration::days(3);

        md.last_recovery_point = Some(recovery_point(now - ChronoDuration::hours(20)));
        assert!(check_for_missed_backup(&md, now));

        md.last_recovery_point = Some(recovery_point(now - ChronoDuration::hours(2)));
        assert!(!check_for_missed_backup(&md, now));
    }

    #[test]
    fn frequency_due_time_anchors_on_history() {
        let now = Utc::now();
        let mut md = metadata(hourly());
        md.policy_update_time = now - ChronoDuration::hours(2);
        md.last_recovery_point = Some(recovery_point(now - ChronoDuration::minutes(20)));
        assert_eq!(next_due_time(&md, now, false), Some(now + ChronoDuration::minutes(40)));

        // Overdue without missed-backup checking fires right away
        md.last_recovery_point = Some(recovery_point(now - ChronoDuration::hours(3)));
        assert_eq!(next_due_time(&md, now, false), Some(now));

        assert_eq!(next_due_time(&md, now, true), Some(now + ChronoDuration::hours(1)));
    }

    #[test]
    fn old_policy_without_history_waits_one_interval() {
        let now = Utc::now();
        let mut md = metadata(hourly());
        md.policy_update_time = now - ChronoDuration::hours(3);

        assert!(!check_for_missed_backup(&md, now));
        assert_eq!(next_due_time(&md, now, false), Some(now + ChronoDuration::hours(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_on_old_policy_without_history_does_not_fire_at_once() {
        let now = Utc::now();
        let mut md = metadata(hourly());
        md.policy_update_time = now - ChronoDuration::hours(3);
        let md = Arc::new(RwLock::new(md));
        let timer = PeriodicBackupTimer::new(md, Duration::ZERO, Handle::current());

        assert_eq!(timer.compute_due(now, true, false), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn weekly_due_time_is_never_in_the_past() {
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        let md = metadata(BackupSchedule::Weekly {
            run_days: vec![Weekday::Mon],
            run_times: vec![NaiveTime::from_hms_opt(1, 0, 0).unwrap()],
        });
        let due = next_due_time(&md, now, false).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2024, 3, 11, 1, 0, 0).unwrap());
    }

    #[test]
    fn jitter_is_clamped_to_due_time() {
        assert_eq!(apply_jitter(Duration::ZERO, -5_000), (Duration::ZERO, 0));
        assert_eq!(apply_jitter(Duration::from_secs(2), -5_000), (Duration::ZERO, -2_000));
        assert_eq!(apply_jitter(Duration::from_secs(60), 3_000), (Duration::from_secs(63), 3_000));
        assert_eq!(random_jitter_millis(Duration::ZERO), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_arm_without_history_waits_one_interval() {
        let md = Arc::new(RwLock::new(metadata(hourly())));
        let timer =
            PeriodicBackupTimer::new(md.clone(), Duration::from_secs(10), Handle::current());

        let delay = timer.arm(true, false, || {}).unwrap();
        let jitter = md.read().jitter_in_millis_used_in_last_backup;
        assert!((-10_000..=10_000).contains(&jitter));
        let hour = Duration::from_secs(3600).as_millis() as i64;
        let delay = delay.as_millis() as i64;
        assert!((hour - 10_100..=hour + 10_000).contains(&delay), "delay {delay}");
        assert!(timer.is_pending());
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_backup_fires_immediately() {
        let now = Utc::now();
        let mut md = metadata(hourly());
        md.policy_update_time = now - ChronoDuration::hours(4);
        md.last_recovery_point = Some(recovery_point(now - ChronoDuration::hours(3)));
        let md = Arc::new(RwLock::new(md));
        let timer = PeriodicBackupTimer::new(md, Duration::from_secs(10), Handle::current());

        assert_eq!(timer.compute_due(now, true, false), Some(Duration::ZERO));
        let delay = timer.arm(true, false, || {}).unwrap();
        assert!(delay <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn disabled_policy_does_not_arm() {
        let md = Arc::new(RwLock::new(BackupMetadata::new(Uuid::new_v4(), None)));
        let timer = PeriodicBackupTimer::new(md, Duration::from_secs(10), Handle::current());
        assert!(timer.arm(true, false, || {}).is_none());
        assert!(!timer.is_pending());
    }
}
