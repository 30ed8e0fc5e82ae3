//! Single-shot timer on the tokio runtime

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Runs a callback once after a delay.
///
/// Arming again replaces the pending callback; a fire that lost the race
/// against `arm` or `cancel` is dropped by its generation check.
#[derive(Debug)]
pub struct OneShotTimer {
    handle: Handle,
    generation: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OneShotTimer {
    /// Timer spawning on `handle`
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            generation: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Invoke `on_fire` after `delay`, replacing any pending callback
    pub fn arm<F>(&self, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.generation.clone();

        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) == generation {
                on_fire();
            }
        }));
    }

    /// Drop the pending callback, if any
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Whether a callback is waiting to fire
    pub fn is_pending(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let timer = OneShotTimer::new(Handle::current());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();

        timer.arm(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_pending_callback() {
        let timer = OneShotTimer::new(Handle::current());
        let fired = Arc::new(Mutex::new(Vec::new()));

        let first = fired.clone();
        timer.arm(Duration::from_secs(1), move || first.lock().push("first"));
        let second = fired.clone();
        timer.arm(Duration::from_secs(3), move || second.lock().push("second"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*fired.lock(), vec!["second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_callback() {
        let timer = OneShotTimer::new(Handle::current());
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();

        timer.arm(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_pending());
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_pending());
    }
}
