//! In-memory collaborators
//!
//! A replica, a partition and a coordination client that keep everything in
//! process. They are what the integration tests run the coordinator against
//! and a starting point for embedding the agent without a hosting runtime.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::coordination::{
    BackupOperationResult, BackupPartitionInfo, BackupRestoreHandler, CoordinationClient,
    CoordinationError, PolicyLookup, RestoreLookup, RestoreOperationResult,
};
use crate::error::{BackupRestoreError, Result};
use crate::health::HealthInformation;
use crate::metadata::{BackupVersion, Epoch};
use crate::replica::{
    BackupCallback, BackupInfo, BackupOption, BackupRestoreReplica, FaultType,
    PartitionAccessStatus, PartitionInfo, PartitionKind, ServicePartition,
};

/// Counter that async code can wait on
#[derive(Debug, Default)]
pub struct Signal {
    count: AtomicUsize,
    notify: Notify,
}

impl Signal {
    /// Increment and wake waiters
    pub fn raise(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Times raised
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until raised at least `target` times; false on timeout
    pub async fn wait_for(&self, target: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.count() >= target {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() >= target;
            }
        }
    }
}

/// Builds the error returned by an injected failure
pub type FailureFactory = fn() -> BackupRestoreError;

/// A restore the replica was asked to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Entries of the restore folder, sorted
    pub entries: Vec<String>,
    /// Force flag passed by the agent
    pub force: bool,
}

#[derive(Debug, Default)]
struct ReplicaChain {
    last_backup_id: Option<Uuid>,
    chain_id: Uuid,
    index: i64,
    lsn: i64,
}

struct ActiveBackup<'a>(&'a AtomicUsize);

impl Drop for ActiveBackup<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replica that writes small backup folders under a working directory
/// and keeps the metadata blob in memory
pub struct InMemoryReplica {
    work_dir: PathBuf,
    metadata: Mutex<Option<Vec<u8>>>,
    chain: Mutex<ReplicaChain>,
    backup_delay: Mutex<Duration>,
    backup_failures: Mutex<VecDeque<FailureFactory>>,
    parent_override: Mutex<Option<Uuid>>,
    requested: Mutex<Vec<BackupOption>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    committed: Signal,
    finished: Signal,
    restores: Mutex<Vec<RestoreRequest>>,
    restore_failure: Mutex<Option<String>>,
    save_failures: AtomicU32,
}

impl InMemoryReplica {
    /// Replica creating backup folders under `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            metadata: Mutex::new(None),
            chain: Mutex::new(ReplicaChain::default()),
            backup_delay: Mutex::new(Duration::ZERO),
            backup_failures: Mutex::new(VecDeque::new()),
            parent_override: Mutex::new(None),
            requested: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            committed: Signal::default(),
            finished: Signal::default(),
            restores: Mutex::new(Vec::new()),
            restore_failure: Mutex::new(None),
            save_failures: AtomicU32::new(0),
        }
    }

    /// Seed the persisted metadata blob
    pub fn set_metadata(&self, bytes: Option<Vec<u8>>) {
        *self.metadata.lock() = bytes;
    }

    /// Persisted metadata blob
    pub fn metadata(&self) -> Option<Vec<u8>> {
        self.metadata.lock().clone()
    }

    /// Hold every backup for `delay` before invoking the callback
    pub fn set_backup_delay(&self, delay: Duration) {
        *self.backup_delay.lock() = delay;
    }

    /// Fail the next backup request with the error built by `failure`
    pub fn push_backup_failure(&self, failure: FailureFactory) {
        self.backup_failures.lock().push_back(failure);
    }

    /// Declare `parent` as the parent of the next incremental backup
    pub fn override_next_parent(&self, parent: Uuid) {
        *self.parent_override.lock() = Some(parent);
    }

    /// Pretend a chain already exists on the replica
    pub fn seed_chain(&self, last_backup_id: Uuid, chain_id: Uuid, index: i64) {
        let mut chain = self.chain.lock();
        chain.last_backup_id = Some(last_backup_id);
        chain.chain_id = chain_id;
        chain.index = index;
    }

    /// Fail restores with `message`
    pub fn fail_restores(&self, message: impl Into<String>) {
        *self.restore_failure.lock() = Some(message.into());
    }

    /// Fail the next `count` metadata saves
    pub fn fail_next_saves(&self, count: u32) {
        self.save_failures.store(count, Ordering::SeqCst);
    }

    /// Options of every backup request, in order
    pub fn requested_backups(&self) -> Vec<BackupOption> {
        self.requested.lock().clone()
    }

    /// Most backups observed running at the same time
    pub fn max_concurrent_backups(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Raised whenever the agent commits a backup
    pub fn committed(&self) -> &Signal {
        &self.committed
    }

    /// Raised whenever a backup request returns, successful or not
    pub fn finished(&self) -> &Signal {
        &self.finished
    }

    /// Restores applied so far
    pub fn restores(&self) -> Vec<RestoreRequest> {
        self.restores.lock().clone()
    }

    fn next_backup_info(&self, option: BackupOption, directory: PathBuf) -> Result<BackupInfo> {
        let mut chain = self.chain.lock();
        let backup_id = Uuid::new_v4();
        let first_lsn = chain.lsn + 1;
        chain.lsn += 10;
        let epoch = Epoch::new(1, 1);

        let (parent_backup_id, backup_chain_id, backup_index) = match option {
            BackupOption::Full => (None, backup_id, 0),
            BackupOption::Incremental => {
                let Some(last) = chain.last_backup_id else {
                    return Err(BackupRestoreError::MissingFullBackup);
                };
                let parent = self.parent_override.lock().take().unwrap_or(last);
                (Some(parent), chain.chain_id, chain.index + 1)
            }
        };

        Ok(BackupInfo {
            directory,
            option,
            backup_id,
            parent_backup_id,
            index_backup_version: BackupVersion::new(epoch, first_lsn),
            last_backup_version: BackupVersion::new(epoch, chain.lsn),
            backup_chain_id,
            backup_index,
        })
    }

    fn commit(&self, info: &BackupInfo) {
        let mut chain = self.chain.lock();
        chain.last_backup_id = Some(info.backup_id);
        chain.chain_id = info.backup_chain_id;
        chain.index = info.backup_index;
    }

    async fn run_backup(
        &self,
        option: BackupOption,
        callback: Arc<dyn BackupCallback>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        if let Some(failure) = self.backup_failures.lock().pop_front() {
            return Err(failure());
        }

        let delay = *self.backup_delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => return Err(BackupRestoreError::Cancelled),
            }
        }

        let directory = self.work_dir.join(format!("replica-backup-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&directory).await?;
        let info = match self.next_backup_info(option, directory.clone()) {
            Ok(info) => info,
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&directory).await;
                return Err(err);
            }
        };
        tokio::fs::write(
            directory.join("records.log"),
            format!(
                "{} {}..{}",
                info.backup_id, info.index_backup_version, info.last_backup_version
            ),
        )
        .await?;

        let outcome = callback.on_backup_ready(info.clone(), cancellation).await;
        let _ = tokio::fs::remove_dir_all(&directory).await;

        if outcome? {
            self.commit(&info);
            self.committed.raise();
        } else {
            debug!(backup_id = %info.backup_id, "Backup was not committed by the callback");
        }
        Ok(())
    }
}

#[async_trait]
impl BackupRestoreReplica for InMemoryReplica {
    async fn backup(
        &self,
        option: BackupOption,
        callback: Arc<dyn BackupCallback>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        self.requested.lock().push(option);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);
        let outcome = {
            let _active = ActiveBackup(&self.active);
            self.run_backup(option, callback, cancellation).await
        };
        self.finished.raise();
        outcome
    }

    async fn restore(
        &self,
        folder: &Path,
        force: bool,
        _cancellation: CancellationToken,
    ) -> Result<()> {
        if let Some(message) = self.restore_failure.lock().clone() {
            return Err(BackupRestoreError::Replica(message));
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(folder).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        entries.sort();

        self.restores.lock().push(RestoreRequest { entries, force });
        Ok(())
    }

    async fn get_backup_metadata(
        &self,
        _timeout: Duration,
        _cancellation: CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.lock().clone())
    }

    async fn save_backup_metadata(
        &self,
        metadata: Vec<u8>,
        _timeout: Duration,
        _cancellation: CancellationToken,
    ) -> Result<()> {
        let failing = self
            .save_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackupRestoreError::Replica("metadata store unavailable".into()));
        }
        *self.metadata.lock() = Some(metadata);
        Ok(())
    }

    async fn clear_backup_metadata(&self, _timeout: Duration) -> Result<()> {
        *self.metadata.lock() = None;
        Ok(())
    }
}

/// Partition whose write status and lifetime are set by the caller
pub struct InMemoryPartition {
    info: PartitionInfo,
    write_status: Mutex<PartitionAccessStatus>,
    closed: AtomicBool,
    status_failure: Mutex<Option<String>>,
    health: Mutex<Vec<HealthInformation>>,
    faults: Mutex<Vec<FaultType>>,
}

impl InMemoryPartition {
    /// Singleton partition with write access granted
    pub fn new(partition_id: Uuid) -> Self {
        Self {
            info: PartitionInfo {
                id: partition_id,
                kind: PartitionKind::Singleton,
            },
            write_status: Mutex::new(PartitionAccessStatus::Granted),
            closed: AtomicBool::new(false),
            status_failure: Mutex::new(None),
            health: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Change the reported write status
    pub fn set_write_status(&self, status: PartitionAccessStatus) {
        *self.write_status.lock() = status;
    }

    /// Make write status reads fail with an unexpected error
    pub fn fail_write_status(&self, message: impl Into<String>) {
        *self.status_failure.lock() = Some(message.into());
    }

    /// Close the partition object
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Health reports published so far
    pub fn health_reports(&self) -> Vec<HealthInformation> {
        self.health.lock().clone()
    }

    /// Latest report for `property`
    pub fn last_health(&self, property: &str) -> Option<HealthInformation> {
        self.health.lock().iter().rev().find(|h| h.property == property).cloned()
    }

    /// Faults reported so far
    pub fn faults(&self) -> Vec<FaultType> {
        self.faults.lock().clone()
    }
}

impl ServicePartition for InMemoryPartition {
    fn partition_info(&self) -> PartitionInfo {
        self.info.clone()
    }

    fn write_status(&self) -> Result<PartitionAccessStatus> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackupRestoreError::ObjectClosed);
        }
        if let Some(message) = self.status_failure.lock().clone() {
            return Err(BackupRestoreError::Replica(message));
        }
        Ok(*self.write_status.lock())
    }

    fn report_fault(&self, fault: FaultType) {
        self.faults.lock().push(fault);
    }

    fn report_partition_health(&self, health: HealthInformation) -> Result<()> {
        self.health.lock().push(health);
        Ok(())
    }
}

/// Coordination service answering from preset responses
pub struct InMemoryCoordinationClient {
    policy: Mutex<PolicyLookup>,
    policy_failures: AtomicU32,
    policy_requests: AtomicU32,
    restore_responses: Mutex<VecDeque<std::result::Result<RestoreLookup, CoordinationError>>>,
    restore_default: Mutex<RestoreLookup>,
    report_failures: AtomicU32,
    backup_results: Mutex<Vec<BackupOperationResult>>,
    restore_results: Mutex<Vec<RestoreOperationResult>>,
    backup_reported: Signal,
    handlers: DashMap<(Uuid, i64), Arc<dyn BackupRestoreHandler>>,
}

impl Default for InMemoryCoordinationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationClient {
    /// Client with protection and restores not enabled
    pub fn new() -> Self {
        Self {
            policy: Mutex::new(PolicyLookup::NotEnabled),
            policy_failures: AtomicU32::new(0),
            policy_requests: AtomicU32::new(0),
            restore_responses: Mutex::new(VecDeque::new()),
            restore_default: Mutex::new(RestoreLookup::NotEnabled),
            report_failures: AtomicU32::new(0),
            backup_results: Mutex::new(Vec::new()),
            restore_results: Mutex::new(Vec::new()),
            backup_reported: Signal::default(),
            handlers: DashMap::new(),
        }
    }

    /// Answer policy lookups with `lookup`
    pub fn set_policy(&self, lookup: PolicyLookup) {
        *self.policy.lock() = lookup;
    }

    /// Fail the next `count` policy lookups as unavailable
    pub fn fail_next_policy_lookups(&self, count: u32) {
        self.policy_failures.store(count, Ordering::SeqCst);
    }

    /// Policy lookups received
    pub fn policy_requests(&self) -> u32 {
        self.policy_requests.load(Ordering::SeqCst)
    }

    /// Answer the next restore lookup with `response`
    pub fn push_restore_response(
        &self,
        response: std::result::Result<RestoreLookup, CoordinationError>,
    ) {
        self.restore_responses.lock().push_back(response);
    }

    /// Answer restore lookups with `lookup` once queued responses run out
    pub fn set_restore_default(&self, lookup: RestoreLookup) {
        *self.restore_default.lock() = lookup;
    }

    /// Fail the next `count` result reports as unavailable
    pub fn fail_next_reports(&self, count: u32) {
        self.report_failures.store(count, Ordering::SeqCst);
    }

    /// On-demand backup results received
    pub fn backup_results(&self) -> Vec<BackupOperationResult> {
        self.backup_results.lock().clone()
    }

    /// Restore results received
    pub fn restore_results(&self) -> Vec<RestoreOperationResult> {
        self.restore_results.lock().clone()
    }

    /// Raised for every accepted on-demand backup result
    pub fn backup_reported(&self) -> &Signal {
        &self.backup_reported
    }

    /// Handler registered for the partition, if any
    pub fn handler(&self, partition_id: Uuid) -> Option<Arc<dyn BackupRestoreHandler>> {
        self.handlers
            .iter()
            .find(|entry| entry.key().0 == partition_id)
            .map(|entry| entry.value().clone())
    }

    /// Number of registered replicas
    pub fn registered_replicas(&self) -> usize {
        self.handlers.len()
    }

    fn take_report_failure(&self) -> bool {
        self.report_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinationClient {
    async fn get_backup_scheduling_policy(
        &self,
        _partition: &BackupPartitionInfo,
        _timeout: Duration,
    ) -> std::result::Result<PolicyLookup, CoordinationError> {
        self.policy_requests.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .policy_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoordinationError::Unavailable("policy lookup failed".into()));
        }
        Ok(self.policy.lock().clone())
    }

    async fn get_restore_point_details(
        &self,
        _partition: &BackupPartitionInfo,
        _timeout: Duration,
    ) -> std::result::Result<RestoreLookup, CoordinationError> {
        if let Some(response) = self.restore_responses.lock().pop_front() {
            return response;
        }
        Ok(self.restore_default.lock().clone())
    }

    async fn report_backup_operation_result(
        &self,
        result: &BackupOperationResult,
        _timeout: Duration,
    ) -> std::result::Result<(), CoordinationError> {
        if self.take_report_failure() {
            return Err(CoordinationError::Unavailable("report rejected".into()));
        }
        self.backup_results.lock().push(result.clone());
        self.backup_reported.raise();
        Ok(())
    }

    async fn report_restore_operation_result(
        &self,
        result: &RestoreOperationResult,
        _timeout: Duration,
    ) -> std::result::Result<(), CoordinationError> {
        if self.take_report_failure() {
            return Err(CoordinationError::Unavailable("report rejected".into()));
        }
        self.restore_results.lock().push(result.clone());
        Ok(())
    }

    fn register_replica(
        &self,
        partition_id: Uuid,
        replica_id: i64,
        handler: Arc<dyn BackupRestoreHandler>,
    ) -> std::result::Result<(), CoordinationError> {
        self.handlers.insert((partition_id, replica_id), handler);
        Ok(())
    }

    fn unregister_replica(
        &self,
        partition_id: Uuid,
        replica_id: i64,
    ) -> std::result::Result<(), CoordinationError> {
        self.handlers.remove(&(partition_id, replica_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectingCallback;

    #[async_trait]
    impl BackupCallback for RejectingCallback {
        async fn on_backup_ready(
            &self,
            backup: BackupInfo,
            _cancellation: CancellationToken,
        ) -> Result<bool> {
            assert!(backup.directory.join("records.log").exists());
            Ok(false)
        }
    }

    #[tokio::test]
    async fn incremental_without_full_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let replica = InMemoryReplica::new(dir.path());

        let err = replica
            .backup(
                BackupOption::Incremental,
                Arc::new(RejectingCallback),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupRestoreError::MissingFullBackup));
        assert_eq!(replica.finished().count(), 1);
    }

    #[tokio::test]
    async fn uncommitted_backups_do_not_extend_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let replica = InMemoryReplica::new(dir.path());

        replica
            .backup(BackupOption::Full, Arc::new(RejectingCallback), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(replica.committed().count(), 0);
        assert!(replica.chain.lock().last_backup_id.is_none());
    }

    #[tokio::test]
    async fn closed_partition_reports_object_closed() {
        let partition = InMemoryPartition::new(Uuid::new_v4());
        assert_eq!(partition.write_status().unwrap(), PartitionAccessStatus::Granted);
        partition.close();
        assert!(matches!(partition.write_status(), Err(BackupRestoreError::ObjectClosed)));
    }

    #[tokio::test]
    async fn signal_wait_times_out() {
        let signal = Signal::default();
        assert!(!signal.wait_for(1, Duration::from_millis(20)).await);
        signal.raise();
        assert!(signal.wait_for(1, Duration::from_millis(20)).await);
    }
}
