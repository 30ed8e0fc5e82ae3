//! Backup scheduler
//!
//! Combines the periodic and reschedule timers and guarantees the owner's
//! callback runs at most once per arm cycle.
//!
//! State transitions:
//!
//! ```text
//! Idle   --arm-->   Armed
//! Armed  --arm-->   Armed
//! Armed  --fire-->  Firing
//! Firing --rearm--> Armed
//! *      --stop-->  Stopped   (terminal)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::backoff::RescheduleBackoffTimer;
use super::periodic::PeriodicBackupTimer;
use crate::metadata::BackupMetadata;
use crate::metrics::BackupMetrics;

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    /// Created, nothing armed
    Idle = 0,
    /// A timer is pending
    Armed = 1,
    /// The callback is running for the current cycle
    Firing = 2,
    /// Stopped for good
    Stopped = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Armed,
            2 => Self::Firing,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Firing => "firing",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Callback invoked when a backup is due
pub type ScheduleCallback = Arc<dyn Fn() + Send + Sync>;

struct SchedulerInner {
    state: AtomicU8,
    periodic: PeriodicBackupTimer,
    backoff: RescheduleBackoffTimer,
    callback: ScheduleCallback,
}

impl SchedulerInner {
    fn load(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `Armed` unless stopped
    fn enter_armed(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != SchedulerState::Stopped as u8).then_some(SchedulerState::Armed as u8)
            })
            .is_ok()
    }

    fn fire(&self) {
        match self.state.compare_exchange(
            SchedulerState::Armed as u8,
            SchedulerState::Firing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => (self.callback)(),
            Err(current) => match SchedulerState::from_u8(current) {
                SchedulerState::Stopped => debug!("Timer fired after stop, ignoring"),
                state => error!(
                    %state,
                    "Backup timer fired outside an armed cycle, callback suppressed"
                ),
            },
        }
    }

    fn fire_handle(weak: Weak<SchedulerInner>) -> impl FnOnce() + Send + 'static {
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.fire();
            }
        }
    }
}

/// Periodic and reschedule timers behind one re-entrancy guard
#[derive(Clone)]
pub struct BackupScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupScheduler").field("state", &self.state()).finish()
    }
}

impl BackupScheduler {
    /// Scheduler for the policy in `metadata`
    pub fn new(
        metadata: Arc<RwLock<BackupMetadata>>,
        jitter_window: Duration,
        handle: Handle,
        callback: ScheduleCallback,
    ) -> Self {
        Self::with_backoff(
            metadata,
            jitter_window,
            RescheduleBackoffTimer::new(handle.clone()),
            handle,
            callback,
        )
    }

    /// Scheduler with a custom reschedule timer
    pub fn with_backoff(
        metadata: Arc<RwLock<BackupMetadata>>,
        jitter_window: Duration,
        backoff: RescheduleBackoffTimer,
        handle: Handle,
        callback: ScheduleCallback,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: AtomicU8::new(SchedulerState::Idle as u8),
                periodic: PeriodicBackupTimer::new(metadata, jitter_window, handle),
                backoff,
                callback,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> SchedulerState {
        self.inner.load()
    }

    /// Start a new cycle on the periodic timer.
    ///
    /// Returns the delay armed, `None` when stopped or protection is disabled.
    pub fn arm(&self, check_for_missed_backups: bool) -> Option<Duration> {
        self.inner.backoff.reset();
        self.arm_periodic(check_for_missed_backups, false)
    }

    /// Start the next cycle after a backup attempt.
    ///
    /// A failed attempt is retried on the reschedule timer until its budget
    /// is spent, after which the periodic timer is armed from now.
    pub fn rearm(&self, previous_backup_failed: bool) -> Option<Duration> {
        if self.state() == SchedulerState::Stopped {
            return None;
        }

        if !previous_backup_failed {
            self.inner.backoff.reset();
            return self.arm_periodic(false, false);
        }

        if !self.inner.enter_armed() {
            return None;
        }
        let on_fire = SchedulerInner::fire_handle(Arc::downgrade(&self.inner));
        match self.inner.backoff.reschedule(on_fire) {
            Ok(interval) => {
                BackupMetrics::record_reschedule("backoff");
                Some(interval)
            }
            Err(_) => {
                warn!("Backup retries exhausted, resuming periodic schedule");
                BackupMetrics::record_reschedule("exhausted");
                self.inner.backoff.reset();
                self.arm_periodic(false, true)
            }
        }
    }

    /// Cancel both timers; every later call is a no-op
    pub fn stop(&self) {
        let previous = self.inner.state.swap(SchedulerState::Stopped as u8, Ordering::SeqCst);
        if previous != SchedulerState::Stopped as u8 {
            info!("Backup scheduler stopped");
        }
        self.inner.periodic.cancel();
        self.inner.backoff.reset();
    }

    fn arm_periodic(&self, check_for_missed_backups: bool, force: bool) -> Option<Duration> {
        if !self.inner.enter_armed() {
            return None;
        }
        let on_fire = SchedulerInner::fire_handle(Arc::downgrade(&self.inner));
        let delay = self.inner.periodic.arm(check_for_missed_backups, force, on_fire);
        if delay.is_none() {
            let _ = self.inner.state.compare_exchange(
                SchedulerState::Armed as u8,
                SchedulerState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        delay
    }

    #[cfg(test)]
    fn fire_now(&self) {
        self.inner.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BackupPolicy, BackupSchedule, FrequencyInterval};
    use crate::store::BackupStoreInformation;
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    fn metadata() -> Arc<RwLock<BackupMetadata>> {
        let policy = BackupPolicy::new(
            "minutes",
            BackupSchedule::Frequency { interval: FrequencyInterval::Minutes(10) },
            2,
            BackupStoreInformation::FileShare { path: "/share".into() },
        );
        Arc::new(RwLock::new(BackupMetadata::new(Uuid::new_v4(), Some(policy))))
    }

    fn scheduler(counter: Arc<AtomicU32>) -> BackupScheduler {
        let callback: ScheduleCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        BackupScheduler::with_backoff(
            metadata(),
            Duration::ZERO,
            RescheduleBackoffTimer::with_base_interval(Handle::current(), Duration::from_secs(30)),
            Handle::current(),
            callback,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_cycle() {
        let fired = Arc::new(AtomicU32::new(0));
        let scheduler = scheduler(fired.clone());

        let delay = scheduler.arm(false).unwrap();
        assert!(delay <= Duration::from_secs(600));
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Firing);

        // A duplicate fire in the same cycle is suppressed
        scheduler.fire_now();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        scheduler.rearm(false).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_use_backoff_then_resume_schedule() {
        let fired = Arc::new(AtomicU32::new(0));
        let scheduler = scheduler(fired.clone());
        scheduler.arm(false).unwrap();

        for _ in 0..5 {
            let delay = scheduler.rearm(true).unwrap();
            assert!(delay <= Duration::from_millis(31_500));
        }
        // Budget exhausted: periodic timer armed from now
        let delay = scheduler.rearm(true).unwrap();
        assert!(delay >= Duration::from_secs(599));
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_terminal() {
        let fired = Arc::new(AtomicU32::new(0));
        let scheduler = scheduler(fired.clone());
        scheduler.arm(false).unwrap();
        scheduler.stop();
        scheduler.stop();

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.arm(true).is_none());
        assert!(scheduler.rearm(true).is_none());
        scheduler.fire_now();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stop_and_fire_never_double_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let scheduler = scheduler(fired.clone());
        scheduler.arm(false).unwrap();

        let racers: Vec<_> = (0..8)
            .map(|i| {
                let s = scheduler.clone();
                tokio::spawn(async move {
                    if i == 4 {
                        s.stop();
                    } else {
                        s.fire_now();
                    }
                })
            })
            .collect();
        for racer in racers {
            racer.await.unwrap();
        }
        assert!(fired.load(Ordering::SeqCst) <= 1);
    }
}
