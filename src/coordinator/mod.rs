//! Backup coordinator
//!
//! [`BackupCoordinator`] runs inside every replica of a protected partition
//! and is active while the replica is primary. On promotion it registers with
//! the coordination service and starts an initialization loop that loads or
//! fetches the backup policy and arms the [`BackupScheduler`]. Scheduled and
//! on-demand backups share one backup semaphore, so at most one backup runs
//! per replica. Metadata commits go through a second semaphore and are
//! dropped when a policy change made them stale. On data loss the
//! coordinator restores the partition from the backups the coordination
//! service points it at.
//!
//! Demotion, close and abort cancel every background task and drop all
//! per-primary state.

mod artifacts;
mod initialize;
mod on_demand;
mod policy;
mod restore;
mod scheduled;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{BackupRestoreConfig, ConfigError};
use crate::coordination::{
    BackupNowConfiguration, BackupPartitionInfo, BackupRestoreHandler, CoordinationClient,
};
use crate::error::{BackupRestoreError, Result};
use crate::health::HealthInformation;
use crate::metadata::{BackupMetadata, RecoveryPointInformation};
use crate::policy::BackupPolicy;
use crate::replica::{BackupRestoreReplica, PartitionInfo, ReplicaRole, ServicePartition};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::schedule::{BackupScheduler, ScheduleCallback, SchedulerState};
use crate::store::StoreFactory;
use crate::utils::backup_relative_path;

/// Application name of system services, which are never protected
pub const SYSTEM_APPLICATION_NAME: &str = "fabric:/System";

const WORK_FOLDER_PREFIX: &str = "brs_";
const LOCAL_BACKUP_FOLDER: &str = "B";
const LOCAL_RESTORE_FOLDER: &str = "R";

/// Identity of the hosting replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRestoreParameters {
    /// Application name URI, e.g. `fabric:/app`
    pub application_name: String,
    /// Service name URI, e.g. `fabric:/app/svc`
    pub service_name: String,
    /// Replica identifier
    pub replica_id: i64,
    /// Version of the service manifest, recorded with every backup
    pub service_manifest_version: String,
}

impl BackupRestoreParameters {
    /// Whether the replica belongs to a system service
    pub fn is_system_service(&self) -> bool {
        self.application_name == SYSTEM_APPLICATION_NAME
    }
}

/// Snapshot of the coordinator state
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStatus {
    /// Current replica role
    pub role: ReplicaRole,
    /// Whether a policy is active
    pub protection_enabled: bool,
    /// Active policy
    pub policy_id: Option<Uuid>,
    /// State of the scheduler, if one exists
    pub scheduler_state: Option<SchedulerState>,
    /// Backups in the current chain
    pub number_of_backups_in_chain: Option<u32>,
    /// Last committed recovery point
    pub last_recovery_point: Option<RecoveryPointInformation>,
    /// On-demand backup in flight
    pub on_demand_operation_id: Option<Uuid>,
}

#[derive(Clone, Copy)]
enum WorkFolder {
    Backup,
    Restore,
}

struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Cancel and wait for the task; panics inside it are logged
    async fn cancel(self, name: &str) {
        self.token.cancel();
        match self.handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(task = name, "Background task failed: {}", e),
        }
    }

    fn detach(self) {
        self.token.cancel();
    }
}

/// Latest on-demand operation; kept after it finishes so a repeated id
/// does not run a second backup
struct OnDemandBackup {
    operation_id: Uuid,
    task: Option<BackgroundTask>,
    finished: bool,
}

#[derive(Default)]
struct PrimaryState {
    metadata: Option<Arc<RwLock<BackupMetadata>>>,
    scheduler: Option<BackupScheduler>,
    init: Option<BackgroundTask>,
    scheduled: Vec<BackgroundTask>,
    registered: bool,
}

pub(crate) struct CoordinatorInner {
    config: BackupRestoreConfig,
    replica: Arc<dyn BackupRestoreReplica>,
    client: Arc<dyn CoordinationClient>,
    store_factory: StoreFactory,
    retry: RetryExecutor,
    handle: Handle,
    parameters: RwLock<Option<BackupRestoreParameters>>,
    partition: RwLock<Option<Arc<dyn ServicePartition>>>,
    role: RwLock<ReplicaRole>,
    state: Mutex<PrimaryState>,
    on_demand: Mutex<Option<OnDemandBackup>>,
    metadata_semaphore: Semaphore,
    backup_semaphore: Semaphore,
    weak_self: Weak<CoordinatorInner>,
}

impl CoordinatorInner {
    fn is_enabled(&self) -> bool {
        if !self.config.is_service_configured() {
            return false;
        }
        !self
            .parameters
            .read()
            .as_ref()
            .is_some_and(BackupRestoreParameters::is_system_service)
    }

    fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    fn ensure_primary(&self) -> Result<()> {
        if self.role() == ReplicaRole::Primary {
            Ok(())
        } else {
            Err(BackupRestoreError::NotPrimary)
        }
    }

    fn parameters(&self) -> Result<BackupRestoreParameters> {
        self.parameters
            .read()
            .clone()
            .ok_or_else(|| {
                ConfigError::Invalid("coordinator has not been initialized".into()).into()
            })
    }

    fn partition(&self) -> Result<Arc<dyn ServicePartition>> {
        self.partition.read().clone().ok_or(BackupRestoreError::ObjectClosed)
    }

    fn partition_info(&self) -> Result<PartitionInfo> {
        Ok(self.partition()?.partition_info())
    }

    fn partition_id(&self) -> Result<Uuid> {
        Ok(self.partition_info()?.id)
    }

    fn backup_partition_info(&self) -> Result<BackupPartitionInfo> {
        Ok(BackupPartitionInfo {
            partition_id: self.partition_id()?,
            service_name: self.parameters()?.service_name,
        })
    }

    fn backup_relative_path(&self) -> Result<String> {
        let parameters = self.parameters()?;
        Ok(backup_relative_path(
            &parameters.application_name,
            &parameters.service_name,
            self.partition_id()?,
        ))
    }

    fn work_folder(&self, kind: WorkFolder) -> Result<PathBuf> {
        let leaf = match kind {
            WorkFolder::Backup => LOCAL_BACKUP_FOLDER,
            WorkFolder::Restore => LOCAL_RESTORE_FOLDER,
        };
        Ok(self
            .config
            .work_folder()
            .join(format!("{}{}", WORK_FOLDER_PREFIX, self.partition_id()?))
            .join(leaf))
    }

    fn live_metadata(&self) -> Option<Arc<RwLock<BackupMetadata>>> {
        self.state.lock().metadata.clone()
    }

    fn scheduler(&self) -> Option<BackupScheduler> {
        self.state.lock().scheduler.clone()
    }

    async fn lock_metadata(&self) -> Result<SemaphorePermit<'_>> {
        self.metadata_semaphore
            .acquire()
            .await
            .map_err(|_| BackupRestoreError::ObjectClosed)
    }

    fn report_health(&self, health: HealthInformation) {
        let outcome = self.partition().and_then(|p| p.report_partition_health(health));
        if let Err(e) = outcome {
            warn!("Failed to report partition health: {}", e);
        }
    }

    fn new_scheduler(&self, metadata: Arc<RwLock<BackupMetadata>>) -> BackupScheduler {
        let weak = self.weak_self.clone();
        let callback: ScheduleCallback = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.start_scheduled_backup();
            }
        });
        BackupScheduler::new(
            metadata,
            self.config.jitter_window(),
            self.handle.clone(),
            callback,
        )
    }

    fn start_scheduled_backup(self: Arc<Self>) {
        let token = CancellationToken::new();
        let handle = self
            .handle
            .spawn(self.clone().run_scheduled_backup(token.clone()));
        let mut state = self.state.lock();
        state.scheduled.retain(|task| !task.handle.is_finished());
        state.scheduled.push(BackgroundTask { token, handle });
    }

    /// Install a new live record and scheduler, stopping the previous one
    fn install(
        &self,
        metadata: Option<Arc<RwLock<BackupMetadata>>>,
        scheduler: Option<BackupScheduler>,
    ) {
        let previous = {
            let mut state = self.state.lock();
            state.metadata = metadata;
            std::mem::replace(&mut state.scheduler, scheduler)
        };
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn register(&self) -> Result<()> {
        let parameters = self.parameters()?;
        let partition_id = self.partition_id()?;
        let handler: Arc<dyn BackupRestoreHandler> = Arc::new(RegisteredHandler {
            inner: self.weak_self.clone(),
        });
        info!(
            %partition_id,
            replica_id = parameters.replica_id,
            "Registering replica with the coordination service"
        );
        self.client
            .register_replica(partition_id, parameters.replica_id, handler)?;
        self.state.lock().registered = true;
        Ok(())
    }

    fn start_initialize(&self) {
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        let token = CancellationToken::new();
        let handle = self.handle.spawn(inner.run_initialize(token.clone()));
        if let Some(previous) = self.state.lock().init.replace(BackgroundTask { token, handle }) {
            previous.detach();
        }
    }

    async fn cancel_initialize(&self) {
        let task = self.state.lock().init.take();
        if let Some(task) = task {
            task.cancel("initialize").await;
        }
    }

    async fn cancel_on_demand(&self) {
        let task = self.on_demand.lock().as_mut().and_then(|b| b.task.take());
        if let Some(task) = task {
            task.cancel("on_demand_backup").await;
        }
    }

    async fn cancel_scheduled_backups(&self) {
        let tasks = std::mem::take(&mut self.state.lock().scheduled);
        for task in tasks {
            task.cancel("scheduled_backup").await;
        }
    }

    fn stop_scheduler(&self) {
        if let Some(scheduler) = self.scheduler() {
            scheduler.stop();
        }
    }

    /// Drop all per-primary state. Idempotent.
    fn cleanup(&self) {
        let (registered, scheduler) = {
            let mut state = self.state.lock();
            state.metadata = None;
            (std::mem::take(&mut state.registered), state.scheduler.take())
        };

        if registered {
            let unregistered = self.parameters().and_then(|parameters| {
                let partition_id = self.partition_id()?;
                info!(%partition_id, replica_id = parameters.replica_id, "Unregistering replica");
                self.client
                    .unregister_replica(partition_id, parameters.replica_id)
                    .map_err(BackupRestoreError::from)
            });
            if let Err(e) = unregistered {
                warn!("Failed to unregister replica: {}", e);
            }
        }

        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }

        *self.on_demand.lock() = None;
    }

    /// Stop every background task and wait for it before dropping state.
    /// The role must already be non-primary.
    async fn teardown(&self) {
        self.stop_scheduler();
        self.cancel_initialize().await;
        self.cancel_on_demand().await;
        self.cancel_scheduled_backups().await;
        self.cleanup();
    }

    fn abort(&self) {
        self.stop_scheduler();
        let (init, scheduled) = {
            let mut state = self.state.lock();
            (state.init.take(), std::mem::take(&mut state.scheduled))
        };
        let on_demand = self.on_demand.lock().as_mut().and_then(|b| b.task.take());
        init.into_iter()
            .chain(on_demand)
            .chain(scheduled)
            .for_each(BackgroundTask::detach);
        self.cleanup();
    }

    fn status(&self) -> CoordinatorStatus {
        let (metadata, scheduler) = {
            let state = self.state.lock();
            (state.metadata.clone(), state.scheduler.clone())
        };
        let metadata = metadata.map(|m| m.read().clone());

        CoordinatorStatus {
            role: self.role(),
            protection_enabled: metadata.as_ref().is_some_and(|m| m.policy.is_some()),
            policy_id: metadata.as_ref().and_then(|m| m.policy.as_ref()).map(|p| p.policy_id),
            scheduler_state: scheduler.map(|s| s.state()),
            number_of_backups_in_chain: metadata.as_ref().map(|m| m.number_of_backups_in_chain),
            last_recovery_point: metadata.and_then(|m| m.last_recovery_point),
            on_demand_operation_id: self
                .on_demand
                .lock()
                .as_ref()
                .filter(|b| !b.finished)
                .map(|b| b.operation_id),
        }
    }
}

/// Handler registered with the coordination service.
///
/// Holds the coordinator weakly so a registration left behind never keeps
/// it alive.
struct RegisteredHandler {
    inner: Weak<CoordinatorInner>,
}

impl RegisteredHandler {
    fn upgrade(&self) -> Result<Arc<CoordinatorInner>> {
        self.inner.upgrade().ok_or(BackupRestoreError::ObjectClosed)
    }
}

#[async_trait]
impl BackupRestoreHandler for RegisteredHandler {
    async fn update_backup_scheduling_policy(
        &self,
        policy: Option<BackupPolicy>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Result<()> {
        self.upgrade()?
            .update_scheduling_policy(policy, timeout, cancellation)
            .await
    }

    async fn backup_partition(
        &self,
        operation_id: Uuid,
        configuration: BackupNowConfiguration,
        _timeout: Duration,
        _cancellation: CancellationToken,
    ) -> Result<()> {
        self.upgrade()?.backup_partition(operation_id, configuration)
    }
}

/// Builder for [`BackupCoordinator`]
pub struct BackupCoordinatorBuilder {
    config: BackupRestoreConfig,
    replica: Arc<dyn BackupRestoreReplica>,
    client: Arc<dyn CoordinationClient>,
    store_factory: Option<StoreFactory>,
    handle: Option<Handle>,
}

impl BackupCoordinatorBuilder {
    /// Use a custom store factory
    pub fn store_factory(mut self, factory: StoreFactory) -> Self {
        self.store_factory = Some(factory);
        self
    }

    /// Spawn timers and background tasks on `handle`
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Build the coordinator.
    ///
    /// Without an explicit runtime handle this must be called from within a
    /// tokio runtime.
    pub fn build(self) -> Result<BackupCoordinator> {
        self.config.validate()?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|e| ConfigError::Invalid(format!("no tokio runtime available: {}", e)))?,
        };
        let store_factory = self
            .store_factory
            .unwrap_or_else(|| StoreFactory::new(&self.config));
        let retry = RetryExecutor::new(RetryConfig::from_config(&self.config));
        let config = self.config;
        let replica = self.replica;
        let client = self.client;

        let inner = Arc::new_cyclic(|weak_self| CoordinatorInner {
            config,
            replica,
            client,
            store_factory,
            retry,
            handle,
            parameters: RwLock::new(None),
            partition: RwLock::new(None),
            role: RwLock::new(ReplicaRole::Unknown),
            state: Mutex::new(PrimaryState::default()),
            on_demand: Mutex::new(None),
            metadata_semaphore: Semaphore::new(1),
            backup_semaphore: Semaphore::new(1),
            weak_self: weak_self.clone(),
        });

        Ok(BackupCoordinator { inner })
    }
}

/// Backup/restore controller of one replica
#[derive(Clone)]
pub struct BackupCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for BackupCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupCoordinator")
            .field("status", &self.inner.status())
            .finish()
    }
}

impl BackupCoordinator {
    /// Start building a coordinator
    pub fn builder(
        config: BackupRestoreConfig,
        replica: Arc<dyn BackupRestoreReplica>,
        client: Arc<dyn CoordinationClient>,
    ) -> BackupCoordinatorBuilder {
        BackupCoordinatorBuilder {
            config,
            replica,
            client,
            store_factory: None,
            handle: None,
        }
    }

    /// Record the identity of the hosting replica
    pub fn initialize(&self, parameters: BackupRestoreParameters) {
        if !self.inner.config.is_service_configured() {
            return;
        }
        *self.inner.parameters.write() = Some(parameters);
    }

    /// The replica opened with `partition`
    pub fn open(&self, partition: Arc<dyn ServicePartition>) {
        if !self.inner.is_enabled() {
            return;
        }
        info!(partition_id = %partition.partition_info().id, "Backup coordinator opened");
        *self.inner.partition.write() = Some(partition);
    }

    /// Handle a role change.
    ///
    /// Promotion registers with the coordination service and starts the
    /// initialization loop; any other role tears everything down. The new
    /// role is visible before teardown starts, so no backup commits once
    /// this returns.
    #[instrument(skip(self))]
    pub async fn change_role(&self, new_role: ReplicaRole) -> Result<()> {
        *self.inner.role.write() = new_role;
        if !self.inner.is_enabled() {
            return Ok(());
        }

        info!(role = ?new_role, "Changing role");
        if new_role == ReplicaRole::Primary {
            self.inner.register()?;
            self.inner.start_initialize();
        } else {
            self.inner.teardown().await;
        }
        Ok(())
    }

    /// Gracefully stop all activity, waiting for background tasks
    pub async fn close(&self) {
        *self.inner.role.write() = ReplicaRole::Closed;
        if !self.inner.is_enabled() {
            return;
        }
        info!("Closing backup coordinator");
        self.inner.teardown().await;
    }

    /// Stop all activity without waiting for background tasks
    pub fn abort(&self) {
        *self.inner.role.write() = ReplicaRole::Closed;
        if !self.inner.is_enabled() {
            return;
        }
        info!("Aborting backup coordinator");
        self.inner.abort();
    }

    /// Restore after data loss.
    ///
    /// Returns whether the partition state was changed; `false` lets the
    /// hosting runtime run its own recovery.
    pub async fn on_data_loss(&self, cancellation: CancellationToken) -> Result<bool> {
        if !self.inner.is_enabled() {
            return Ok(false);
        }
        self.inner.on_data_loss(cancellation).await
    }

    /// Apply a policy pushed by the coordination service
    pub async fn update_scheduling_policy(
        &self,
        policy: Option<BackupPolicy>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Result<()> {
        self.inner
            .update_scheduling_policy(policy, timeout, cancellation)
            .await
    }

    /// Queue an on-demand backup identified by `operation_id`
    pub fn backup_partition(
        &self,
        operation_id: Uuid,
        configuration: BackupNowConfiguration,
    ) -> Result<()> {
        self.inner.backup_partition(operation_id, configuration)
    }

    /// Current state snapshot
    pub fn status(&self) -> CoordinatorStatus {
        self.inner.status()
    }
}

#[async_trait]
impl BackupRestoreHandler for BackupCoordinator {
    async fn update_backup_scheduling_policy(
        &self,
        policy: Option<BackupPolicy>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Result<()> {
        self.update_scheduling_policy(policy, timeout, cancellation).await
    }

    async fn backup_partition(
        &self,
        operation_id: Uuid,
        configuration: BackupNowConfiguration,
        _timeout: Duration,
        _cancellation: CancellationToken,
    ) -> Result<()> {
        BackupCoordinator::backup_partition(self, operation_id, configuration)
    }
}
