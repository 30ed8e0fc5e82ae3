//! Utility functions for backup/restore operations

/// Timeout bookkeeping
pub mod time {
    use std::time::Duration;
    use tokio::time::Instant;

    /// Remaining-time budget for a sequence of calls sharing one timeout.
    ///
    /// Each call in the sequence gets `timeout - elapsed`.
    #[derive(Debug, Clone, Copy)]
    pub struct TimeoutBudget {
        timeout: Duration,
        started: Instant,
    }

    impl TimeoutBudget {
        /// Start a budget now
        pub fn start(timeout: Duration) -> Self {
            Self {
                timeout,
                started: Instant::now(),
            }
        }

        /// Time left, zero once spent
        pub fn remaining(&self) -> Duration {
            self.timeout.saturating_sub(self.started.elapsed())
        }

        /// Whether the budget is spent
        pub fn is_exhausted(&self) -> bool {
            self.remaining().is_zero()
        }

        /// Time since the budget started
        pub fn elapsed(&self) -> Duration {
            self.started.elapsed()
        }
    }
}

/// Text helpers
pub mod text {
    /// Truncate to at most `max_chars` characters on a char boundary
    pub fn trim_to_length(value: &str, max_chars: usize) -> String {
        match value.char_indices().nth(max_chars) {
            Some((byte_index, _)) => value[..byte_index].to_string(),
            None => value.to_string(),
        }
    }
}

/// Store layout naming
pub mod paths {
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    /// Format of backup folder names
    pub const BACKUP_FOLDER_NAME_FORMAT: &str = "%Y-%m-%d %H.%M.%S";
    /// Extension of archived backups
    pub const ARCHIVE_EXTENSION: &str = ".tgz";
    /// Extension of recovery point metadata files
    pub const METADATA_FILE_EXTENSION: &str = ".bkmetadata";

    fn uri_segments(uri: &str) -> Vec<&str> {
        uri.split('/').skip(1).filter(|s| !s.is_empty()).collect()
    }

    /// Store relative folder of a partition:
    /// `<application>/<service>/<partition-id>`, with nested name
    /// segments joined by `$`.
    ///
    /// Service and application names are URIs such as `fabric:/app/svc`.
    pub fn backup_relative_path(
        application_name: &str,
        service_name: &str,
        partition_id: Uuid,
    ) -> String {
        let application = uri_segments(application_name).join("$");
        let service = service_name
            .strip_prefix(application_name)
            .unwrap_or(service_name)
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("$");
        format!("{}/{}/{}", application, service, partition_id)
    }

    /// Folder name of a backup taken at `time`
    pub fn backup_folder_name(time: DateTime<Utc>) -> String {
        time.format(BACKUP_FOLDER_NAME_FORMAT).to_string()
    }
}

pub use paths::{backup_folder_name, backup_relative_path};
pub use text::trim_to_length;
pub use time::TimeoutBudget;
