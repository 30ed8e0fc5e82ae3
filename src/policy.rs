//! Backup policies and schedule arithmetic

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::store::BackupStoreInformation;

/// Backup policy assigned to a partition by the coordination service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPolicy {
    /// Policy identifier
    pub policy_id: Uuid,
    /// Human readable policy name
    pub name: String,
    /// When backups run
    pub schedule: BackupSchedule,
    /// Incremental backups allowed after a full backup before the chain restarts
    pub max_incremental_backups: u32,
    /// Where artifacts are uploaded
    pub store_information: BackupStoreInformation,
}

impl BackupPolicy {
    /// Create a policy with a normalized schedule
    pub fn new(
        name: impl Into<String>,
        schedule: BackupSchedule,
        max_incremental_backups: u32,
        store_information: BackupStoreInformation,
    ) -> Self {
        Self {
            policy_id: Uuid::new_v4(),
            name: name.into(),
            schedule: schedule.normalized(),
            max_incremental_backups,
            store_information,
        }
    }

    /// Same policy with its schedule sorted for lookups
    pub fn normalized(self) -> Self {
        Self {
            schedule: self.schedule.normalized(),
            ..self
        }
    }

    /// Reject policies that can never fire
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.schedule {
            BackupSchedule::Frequency { interval } if interval.as_minutes() == 0 => Err(
                ConfigError::Invalid(format!("policy {}: frequency must be non-zero", self.name)),
            ),
            BackupSchedule::Daily { run_times } if run_times.is_empty() => Err(ConfigError::Invalid(
                format!("policy {}: daily schedule has no run times", self.name),
            )),
            BackupSchedule::Weekly { run_days, run_times }
                if run_days.is_empty() || run_times.is_empty() =>
            {
                Err(ConfigError::Invalid(format!(
                    "policy {}: weekly schedule needs run days and run times",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Interval of a frequency based schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyInterval {
    /// Every N hours
    Hours(u32),
    /// Every N minutes
    Minutes(u32),
}

impl FrequencyInterval {
    /// Interval length in minutes
    pub fn as_minutes(&self) -> i64 {
        match *self {
            Self::Hours(h) => i64::from(h) * 60,
            Self::Minutes(m) => i64::from(m),
        }
    }

    /// Interval length
    pub fn as_duration(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.as_minutes())
    }
}

/// When scheduled backups run.
///
/// Run days and times are sorted whenever a schedule is deserialized, so
/// policies received from the coordination service or read back from disk
/// are ready for lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ScheduleRepr")]
pub enum BackupSchedule {
    /// Fixed interval since the last backup
    Frequency {
        /// Interval between backups
        interval: FrequencyInterval,
    },
    /// Every day at the given UTC times
    Daily {
        /// Times of day
        run_times: Vec<NaiveTime>,
    },
    /// On the given days at the given UTC times
    Weekly {
        /// Days of week
        run_days: Vec<Weekday>,
        /// Times of day
        run_times: Vec<NaiveTime>,
    },
}

/// Wire shape of [`BackupSchedule`] before normalization
#[derive(Deserialize)]
enum ScheduleRepr {
    Frequency { interval: FrequencyInterval },
    Daily { run_times: Vec<NaiveTime> },
    Weekly { run_days: Vec<Weekday>, run_times: Vec<NaiveTime> },
}

impl From<ScheduleRepr> for BackupSchedule {
    fn from(repr: ScheduleRepr) -> Self {
        let schedule = match repr {
            ScheduleRepr::Frequency { interval } => Self::Frequency { interval },
            ScheduleRepr::Daily { run_times } => Self::Daily { run_times },
            ScheduleRepr::Weekly { run_days, run_times } => Self::Weekly { run_days, run_times },
        };
        schedule.normalized()
    }
}

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl BackupSchedule {
    /// Sort and deduplicate run times and days
    pub fn normalized(self) -> Self {
        fn sort_times(mut times: Vec<NaiveTime>) -> Vec<NaiveTime> {
            times.sort();
            times.dedup();
            times
        }

        match self {
            Self::Frequency { interval } => Self::Frequency { interval },
            Self::Daily { run_times } => Self::Daily { run_times: sort_times(run_times) },
            Self::Weekly { mut run_days, run_times } => {
                run_days.sort_by_key(|d| d.num_days_from_monday());
                run_days.dedup();
                Self::Weekly { run_days, run_times: sort_times(run_times) }
            }
        }
    }

    /// Interval for frequency based schedules
    pub fn frequency(&self) -> Option<ChronoDuration> {
        match self {
            Self::Frequency { interval } => Some(interval.as_duration()),
            _ => None,
        }
    }

    fn run_days(&self) -> &[Weekday] {
        match self {
            Self::Weekly { run_days, .. } => run_days,
            _ => &ALL_DAYS,
        }
    }

    fn run_times(&self) -> &[NaiveTime] {
        match self {
            Self::Daily { run_times } | Self::Weekly { run_times, .. } => run_times,
            Self::Frequency { .. } => &[],
        }
    }

    /// Earliest scheduled instant at or after `now`.
    ///
    /// Returns `None` for frequency based schedules and for schedules
    /// without run times or days.
    pub fn next_scheduled_run_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let times = self.run_times();
        let days = self.run_days();
        if times.is_empty() || days.is_empty() {
            return None;
        }

        let today = now.date_naive();
        let now_time = now.time();

        // Offset 7 covers a single run day equal to today whose times all passed
        for offset in 0..=7 {
            let date = today + ChronoDuration::days(offset);
            if !days.contains(&date.weekday()) {
                continue;
            }
            let time = if offset == 0 {
                times.iter().find(|t| **t >= now_time)
            } else {
                times.first()
            };
            if let Some(time) = time {
                return Some(Utc.from_utc_datetime(&date.and_time(*time)));
            }
        }
        None
    }

    /// Most recent scheduled instant at or before `now`
    pub fn last_scheduled_run_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let times = self.run_times();
        let days = self.run_days();
        if times.is_empty() || days.is_empty() {
            return None;
        }

        let today = now.date_naive();
        let now_time = now.time();

        for offset in 0..=7 {
            let date = today - ChronoDuration::days(offset);
            if !days.contains(&date.weekday()) {
                continue;
            }
            let time = if offset == 0 {
                times.iter().rev().find(|t| **t <= now_time)
            } else {
                times.last()
            };
            if let Some(time) = time {
                return Some(Utc.from_utc_datetime(&date.and_time(*time)));
            }
        }
        None
    }
}
