//! # Replica Backup
//!
//! Periodic and on-demand backup/restore for the primary replica of a
//! partitioned stateful service.
//!
//! ## Overview
//!
//! Every replica hosts a [`BackupCoordinator`]. While the replica is primary
//! the coordinator registers with the coordination service, loads or fetches
//! the partition's backup policy and schedules full and incremental backups.
//! Each backup is described by a recovery point file, optionally archived,
//! and uploaded to the policy's artifact store. After data loss the
//! coordinator downloads the backups the coordination service points it at
//! and hands them to the replica to restore.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_backup::memory::{InMemoryCoordinationClient, InMemoryPartition, InMemoryReplica};
//! use replica_backup::{
//!     BackupCoordinator, BackupRestoreConfig, BackupRestoreParameters, ReplicaRole,
//! };
//! use uuid::Uuid;
//!
//! # async fn example() -> replica_backup::Result<()> {
//! let config = BackupRestoreConfig {
//!     target_replica_set_size: 3,
//!     ..Default::default()
//! };
//! let replica = Arc::new(InMemoryReplica::new("/var/lib/orders/backups"));
//! let client = Arc::new(InMemoryCoordinationClient::new());
//!
//! let coordinator = BackupCoordinator::builder(config, replica, client).build()?;
//! coordinator.initialize(BackupRestoreParameters {
//!     application_name: "fabric:/shop".into(),
//!     service_name: "fabric:/shop/orders".into(),
//!     replica_id: 1,
//!     service_manifest_version: "1.0.0".into(),
//! });
//! coordinator.open(Arc::new(InMemoryPartition::new(Uuid::new_v4())));
//! coordinator.change_role(ReplicaRole::Primary).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: lifecycle, scheduled and on-demand backups, restore
//! - [`schedule`]: periodic, reschedule and one-shot timers
//! - [`metadata`]: persisted protection state and recovery point files
//! - [`store`]: file share and object storage artifact stores
//! - [`retry`]: bounded exponential retry with error classification

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Error types and failure classification
pub mod error;

/// Agent configuration
pub mod config;

/// Tracing setup
pub mod logging;

/// Prometheus metrics
pub mod metrics;

/// Retry with exponential backoff
pub mod retry;

/// Backup policies and schedules
pub mod policy;

/// Persisted metadata and recovery point files
pub mod metadata;

/// Backup timers
pub mod schedule;

/// Artifact stores
pub mod store;

/// Backup folder archiving
pub mod archive;

/// Contracts with the hosting replica
pub mod replica;

/// Contracts with the coordination service
pub mod coordination;

/// Partition health reports
pub mod health;

/// The per-replica backup coordinator
pub mod coordinator;

/// In-process collaborators
pub mod memory;

/// Utility functions and helpers
pub mod utils;

pub use config::{BackupRestoreConfig, ConfigError};
pub use coordinator::{
    BackupCoordinator, BackupCoordinatorBuilder, BackupRestoreParameters, CoordinatorStatus,
};
pub use error::{BackupRestoreError, FailureKind, Result};
pub use metadata::{BackupMetadata, RecoveryPointInformation};
pub use policy::{BackupPolicy, BackupSchedule, FrequencyInterval};
pub use replica::{BackupOption, ReplicaRole};
pub use store::BackupStoreInformation;
