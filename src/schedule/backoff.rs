//! Reschedule timer used after a failed scheduled backup

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::timer::OneShotTimer;
use crate::error::{BackupRestoreError, Result};

/// Reschedules allowed before falling back to the periodic timer
pub const MAX_RESCHEDULE_ATTEMPTS: u32 = 5;

/// Base wait between reschedules
pub const DEFAULT_RESCHEDULE_INTERVAL: Duration = Duration::from_secs(60);

const MIN_MULTIPLIER: f64 = 0.95;
const MAX_MULTIPLIER: f64 = 1.05;

/// Bounded retry timer for failed scheduled backups.
///
/// Each reschedule waits about one base interval, spread by ±5%.
#[derive(Debug)]
pub struct RescheduleBackoffTimer {
    attempts: AtomicU32,
    base_interval: Duration,
    timer: OneShotTimer,
}

impl RescheduleBackoffTimer {
    /// Timer with the default one minute base interval
    pub fn new(handle: Handle) -> Self {
        Self::with_base_interval(handle, DEFAULT_RESCHEDULE_INTERVAL)
    }

    /// Timer with a custom base interval
    pub fn with_base_interval(handle: Handle, base_interval: Duration) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            base_interval,
            timer: OneShotTimer::new(handle),
        }
    }

    /// Interval for a random multiplier in `[0.95, 1.05]`
    pub fn interval_for(&self, multiplier: f64) -> Duration {
        self.base_interval.mul_f64(multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER))
    }

    /// Arm another attempt.
    ///
    /// Returns [`BackupRestoreError::Cancelled`] without arming once
    /// [`MAX_RESCHEDULE_ATTEMPTS`] have been used.
    pub fn reschedule<F>(&self, on_fire: F) -> Result<Duration>
    where
        F: FnOnce() + Send + 'static,
    {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > MAX_RESCHEDULE_ATTEMPTS {
            warn!(attempt, "Reschedule attempts exhausted");
            return Err(BackupRestoreError::Cancelled);
        }

        let multiplier = rand::thread_rng().gen_range(MIN_MULTIPLIER..=MAX_MULTIPLIER);
        let interval = self.interval_for(multiplier);
        debug!(attempt, interval_ms = interval.as_millis() as u64, "Rescheduling backup");
        self.timer.arm(interval, on_fire);
        Ok(interval)
    }

    /// Zero the attempt counter and drop any pending attempt
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.timer.cancel();
    }

    /// Reschedules used since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst).min(MAX_RESCHEDULE_ATTEMPTS + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn budget_is_capped() {
        let timer = RescheduleBackoffTimer::new(Handle::current());
        for _ in 0..MAX_RESCHEDULE_ATTEMPTS {
            let interval = timer.reschedule(|| {}).unwrap();
            assert!(interval >= Duration::from_secs(57) && interval <= Duration::from_secs(63));
        }
        assert!(matches!(timer.reschedule(|| {}), Err(BackupRestoreError::Cancelled)));

        timer.reset();
        assert_eq!(timer.attempts(), 0);
        assert!(timer.reschedule(|| {}).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduled_attempt_fires() {
        let timer =
            RescheduleBackoffTimer::with_base_interval(Handle::current(), Duration::from_secs(10));
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        timer
            .reschedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interval_multiplier_is_bounded() {
        let timer = RescheduleBackoffTimer::new(Handle::current());
        let low = timer.interval_for(0.5);
        let high = timer.interval_for(2.0);
        assert!(low > Duration::from_millis(56_999) && low <= Duration::from_millis(57_001));
        assert!(high >= Duration::from_millis(62_999) && high < Duration::from_millis(63_001));
    }
}
