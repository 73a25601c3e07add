//! Pipeline schedule domain types
//!
//! A schedule decides when a new pipeline run is due. Every recurring
//! interval maps the current time onto the logical `execution_date` of the
//! period it falls in; a schedule is due when no run exists for that date yet.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::run::PipelineRun;

/// Recurring trigger definition for a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSchedule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub pipeline_uuid: String,
    /// `@once`, `@hourly`, `@daily`, `@weekly`, `@monthly` or a cron expression
    pub schedule_interval: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: ScheduleStatus,
    /// Overrides applied over the pipeline's default variables
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    /// Last time the scheduler created a run from this schedule
    #[serde(default)]
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    #[default]
    Active,
    Inactive,
}

/// Parsed form of `PipelineSchedule::schedule_interval`
#[derive(Debug, Clone)]
pub enum ScheduleInterval {
    Once,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Cron(Box<cron::Schedule>),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {source}")]
    InvalidCron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("cron expression '{0}' has no fire time in the past year")]
    NoFireTime(String),
}

impl FromStr for ScheduleInterval {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "@once" => Ok(Self::Once),
            "@hourly" => Ok(Self::Hourly),
            "@daily" => Ok(Self::Daily),
            "@weekly" => Ok(Self::Weekly),
            "@monthly" => Ok(Self::Monthly),
            expression => parse_cron(expression)
                .map(|schedule| Self::Cron(Box::new(schedule)))
                .map_err(|source| ScheduleError::InvalidCron {
                    expression: expression.to_string(),
                    source,
                }),
        }
    }
}

impl ScheduleInterval {
    /// Logical execution date of the period containing `now`
    ///
    /// Hourly/daily/weekly/monthly periods start at the top of the hour,
    /// midnight, Monday midnight and the first of the month (UTC). Cron
    /// periods start at the latest fire time at or before `now`. `@once`
    /// has no period, so its execution date is `now` itself.
    pub fn execution_date(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let midnight = |date: NaiveDate| date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());

        let date = match self {
            Self::Once => Some(now),
            Self::Hourly => now
                .date_naive()
                .and_hms_opt(now.hour(), 0, 0)
                .map(|dt| dt.and_utc()),
            Self::Daily => midnight(now.date_naive()),
            Self::Weekly => now
                .date_naive()
                .checked_sub_days(Days::new(now.weekday().num_days_from_monday() as u64))
                .and_then(midnight),
            Self::Monthly => NaiveDate::from_ymd_opt(now.year(), now.month(), 1).and_then(midnight),
            Self::Cron(schedule) => {
                return latest_fire_time(schedule, now)
                    .ok_or_else(|| ScheduleError::NoFireTime(schedule.to_string()));
            }
        };

        // Every truncation above is a valid calendar date
        Ok(date.unwrap_or(now))
    }
}

impl PipelineSchedule {
    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }

    pub fn interval(&self) -> Result<ScheduleInterval, ScheduleError> {
        self.schedule_interval.parse()
    }

    /// Decides whether a new run is due at `now`
    ///
    /// `existing_runs` are the runs already created from this schedule; they
    /// are the bookkeeping that keeps a period from being scheduled twice.
    pub fn should_schedule(
        &self,
        now: DateTime<Utc>,
        existing_runs: &[PipelineRun],
    ) -> Result<bool, ScheduleError> {
        if !self.is_active() {
            return Ok(false);
        }

        if self.start_time.is_some_and(|start| start > now) {
            return Ok(false);
        }

        let interval = self.interval()?;
        if let ScheduleInterval::Once = interval {
            return Ok(existing_runs.is_empty());
        }

        let execution_date = interval.execution_date(now)?;
        if self.start_time.is_some_and(|start| execution_date < start) {
            return Ok(false);
        }

        Ok(!existing_runs
            .iter()
            .any(|run| run.execution_date == execution_date))
    }
}

/// Parses a cron expression, prepending a seconds field to 5-field expressions
fn parse_cron(expression: &str) -> Result<cron::Schedule, cron::error::Error> {
    if expression.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {}", expression))
    } else {
        cron::Schedule::from_str(expression)
    }
}

/// Latest fire time at or before `now`, searching progressively wider windows
fn latest_fire_time(schedule: &cron::Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lookback_windows = [
        Duration::hours(1),
        Duration::days(1),
        Duration::days(32),
        Duration::days(366),
    ];

    lookback_windows.iter().find_map(|window| {
        let from = now - *window;
        schedule
            .after(&from)
            .take_while(|fire| *fire <= now)
            .last()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::RunStatus;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn schedule(interval: &str) -> PipelineSchedule {
        PipelineSchedule {
            id: Uuid::new_v4(),
            name: "nightly".to_string(),
            pipeline_uuid: "etl".to_string(),
            schedule_interval: interval.to_string(),
            start_time: None,
            status: ScheduleStatus::Active,
            variables: HashMap::new(),
            last_enqueued_at: None,
        }
    }

    fn run_at(execution_date: DateTime<Utc>) -> PipelineRun {
        PipelineRun {
            id: Uuid::new_v4(),
            pipeline_uuid: "etl".to_string(),
            pipeline_schedule_id: None,
            execution_date,
            status: RunStatus::Completed,
            variables: HashMap::new(),
            created_at: execution_date,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_execution_dates() {
        // Thursday
        let now = at(2024, 3, 14, 15, 42);

        let date = |s: &str| s.parse::<ScheduleInterval>().unwrap().execution_date(now).unwrap();

        assert_eq!(date("@once"), now);
        assert_eq!(date("@hourly"), at(2024, 3, 14, 15, 0));
        assert_eq!(date("@daily"), at(2024, 3, 14, 0, 0));
        assert_eq!(date("@weekly"), at(2024, 3, 11, 0, 0));
        assert_eq!(date("@monthly"), at(2024, 3, 1, 0, 0));
        assert_eq!(date("*/15 * * * *"), at(2024, 3, 14, 15, 30));
        assert_eq!(date("0 0 6 * * *"), at(2024, 3, 14, 6, 0));
    }

    #[test]
    fn test_cron_fire_time_found_in_wider_window() {
        let now = at(2024, 3, 14, 15, 42);
        let interval: ScheduleInterval = "0 4 1 * *".parse().unwrap();
        assert_eq!(interval.execution_date(now).unwrap(), at(2024, 3, 1, 4, 0));
    }

    #[test]
    fn test_invalid_cron() {
        assert!(matches!(
            "not a cron".parse::<ScheduleInterval>(),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_should_schedule_once_only_without_runs() {
        let s = schedule("@once");
        let now = at(2024, 3, 14, 15, 42);

        assert!(s.should_schedule(now, &[]).unwrap());
        assert!(!s.should_schedule(now, &[run_at(now)]).unwrap());
    }

    #[test]
    fn test_should_schedule_once_per_period() {
        let s = schedule("@daily");
        let now = at(2024, 3, 14, 15, 42);

        assert!(s.should_schedule(now, &[]).unwrap());

        let runs = vec![run_at(at(2024, 3, 14, 0, 0))];
        assert!(!s.should_schedule(now, &runs).unwrap());
        assert!(!s.should_schedule(at(2024, 3, 14, 23, 59), &runs).unwrap());
        assert!(s.should_schedule(at(2024, 3, 15, 0, 1), &runs).unwrap());
    }

    #[test]
    fn test_should_schedule_respects_status_and_start_time() {
        let now = at(2024, 3, 14, 15, 42);

        let mut inactive = schedule("@hourly");
        inactive.status = ScheduleStatus::Inactive;
        assert!(!inactive.should_schedule(now, &[]).unwrap());

        let mut future = schedule("@hourly");
        future.start_time = Some(at(2024, 3, 15, 0, 0));
        assert!(!future.should_schedule(now, &[]).unwrap());

        // Started mid-day: today's daily period began before the start time
        let mut mid_day = schedule("@daily");
        mid_day.start_time = Some(at(2024, 3, 14, 12, 0));
        assert!(!mid_day.should_schedule(now, &[]).unwrap());
        assert!(mid_day.should_schedule(at(2024, 3, 15, 0, 0), &[]).unwrap());
    }

    #[test]
    fn test_deserialize_schedule_defaults() {
        let s: PipelineSchedule = serde_json::from_str(
            r#"{"name": "hourly etl", "pipeline_uuid": "etl", "schedule_interval": "@hourly"}"#,
        )
        .unwrap();

        assert!(s.is_active());
        assert!(s.start_time.is_none());
        assert!(s.last_enqueued_at.is_none());
    }
}
