//! In-memory object client

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ObjectClient, StoreError};

/// Object client keeping everything in a concurrent map.
///
/// Can be told to fail the next few calls with a transient error, or to
/// hold every upload for a while.
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    objects: DashMap<(String, String), Bytes>,
    pending_failures: AtomicU32,
    put_delay: Mutex<Duration>,
    puts_started: AtomicUsize,
}

impl MemoryObjectClient {
    /// Empty client
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with [`StoreError::Transient`]
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Hold every upload for `delay` before storing it
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    /// Uploads started so far, including failed ones
    pub fn puts_started(&self) -> usize {
        self.puts_started.load(Ordering::SeqCst)
    }

    /// Sorted keys stored in `container`
    pub fn keys(&self, container: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == container)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    fn maybe_fail(&self) -> Result<(), StoreError> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::Transient("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn put_object(&self, container: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.puts_started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.maybe_fail()?;
        self.objects.insert((container.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get_object(&self, container: &str, key: &str) -> Result<Bytes, StoreError> {
        self.maybe_fail()?;
        self.objects
            .get(&(container.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", container, key)))
    }

    async fn list_objects(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.maybe_fail()?;
        let mut keys: Vec<String> = self
            .keys(container)
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
