//! Scheduled backup timing
//!
//! A schedule is an interval (hourly, daily, weekly) anchored at
//! `backup_time` (`HH:MM`) and, for weekly runs, `backup_day` (0 = Monday).
//! Hourly runs use only the minute of `backup_time`.
//!
//! The next due time is persisted in `next_backup` as `%Y-%m-%d %H:%M`
//! local time. A backup is due once the current time reaches it.

use crate::error::{BackupError, Result};
use crate::settings::SettingsStore;
use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Timelike, Weekday};
use std::fmt;
use tracing::{debug, warn};

/// Format of `last_backup` and `next_backup`
pub const SCHEDULE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// How often scheduled backups run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleInterval {
    /// Every hour at the configured minute
    Hourly,
    /// Every day at the configured time
    Daily,
    /// Once a week on the configured day and time
    Weekly,
}

impl ScheduleInterval {
    /// Map `backup_interval` (1-3); 0 and unknown values mean no schedule
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            1 => Some(ScheduleInterval::Hourly),
            2 => Some(ScheduleInterval::Daily),
            3 => Some(ScheduleInterval::Weekly),
            _ => None,
        }
    }
}

impl fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleInterval::Hourly => "hourly",
            ScheduleInterval::Daily => "daily",
            ScheduleInterval::Weekly => "weekly",
        };
        f.write_str(name)
    }
}

/// An active backup schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Repeat interval
    pub interval: ScheduleInterval,
    /// Time of day (minute only for hourly)
    pub time: NaiveTime,
    /// Day of week for weekly runs
    pub weekday: Weekday,
}

/// Parse an `HH:MM` time of day
pub fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| BackupError::config(format!("backup_time must be HH:MM, got {:?}", raw)))
}

/// Parse a persisted schedule timestamp
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), SCHEDULE_FORMAT).ok()
}

fn weekday_from_index(index: i64) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

impl Schedule {
    /// Read the schedule settings
    ///
    /// Returns `Ok(None)` when scheduling is disabled or the interval is off.
    ///
    /// # Errors
    ///
    /// [`BackupError::InvalidConfiguration`] for a malformed time, or a day
    /// outside 0-6 on a weekly schedule.
    pub fn from_settings(store: &dyn SettingsStore) -> Result<Option<Self>> {
        if !store.get_bool("enable_schedule") {
            return Ok(None);
        }
        let Some(interval) = ScheduleInterval::from_index(store.get_int("backup_interval")) else {
            return Ok(None);
        };

        let time = parse_time(&store.get_string("backup_time"))?;
        let day = store.get_int("backup_day");
        let weekday = match (interval, weekday_from_index(day)) {
            (_, Some(weekday)) => weekday,
            (ScheduleInterval::Weekly, None) => {
                return Err(BackupError::config(format!("backup_day must be 0-6, got {}", day)));
            }
            // the day only matters for weekly runs
            (_, None) => Weekday::Mon,
        };

        Ok(Some(Self {
            interval,
            time,
            weekday,
        }))
    }

    /// First scheduled time strictly after `now`
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match self.interval {
            ScheduleInterval::Hourly => {
                let candidate = now
                    .date()
                    .and_hms_opt(now.hour(), self.time.minute(), 0)
                    .unwrap_or(now);
                if candidate <= now {
                    candidate + Duration::hours(1)
                } else {
                    candidate
                }
            }
            ScheduleInterval::Daily => {
                let candidate = now.date().and_time(self.time);
                if candidate <= now {
                    candidate + Duration::days(1)
                } else {
                    candidate
                }
            }
            ScheduleInterval::Weekly => {
                let days_ahead = (self.weekday.num_days_from_monday() as i64
                    - now.weekday().num_days_from_monday() as i64)
                    .rem_euclid(7);
                let candidate = (now.date() + Duration::days(days_ahead)).and_time(self.time);
                if candidate <= now {
                    candidate + Duration::days(7)
                } else {
                    candidate
                }
            }
        }
    }
}

/// Whether a scheduled backup should run at `now`
///
/// When no valid `next_backup` is stored yet, the next time is computed and
/// persisted and nothing runs.
pub fn is_due(store: &dyn SettingsStore, now: NaiveDateTime) -> Result<bool> {
    let Some(schedule) = Schedule::from_settings(store)? else {
        return Ok(false);
    };

    match parse_timestamp(&store.get_string("next_backup")) {
        Some(next) => {
            debug!("Next {} backup at {}", schedule.interval, next);
            Ok(now >= next)
        }
        None => {
            let next = schedule.next_after(now);
            store.set("next_backup", &next.format(SCHEDULE_FORMAT).to_string())?;
            debug!("Scheduled first {} backup for {}", schedule.interval, next);
            Ok(false)
        }
    }
}

/// Record a finished backup and persist the next due time
pub fn record_run(store: &dyn SettingsStore, now: NaiveDateTime) -> Result<Option<NaiveDateTime>> {
    store.set("last_backup", &now.format(SCHEDULE_FORMAT).to_string())?;
    refresh(store, now)
}

/// Recompute `next_backup` from the current settings
///
/// Clears it when scheduling is off or misconfigured.
pub fn refresh(store: &dyn SettingsStore, now: NaiveDateTime) -> Result<Option<NaiveDateTime>> {
    let next = match Schedule::from_settings(store) {
        Ok(Some(schedule)) => Some(schedule.next_after(now)),
        Ok(None) => None,
        Err(e) => {
            warn!("Not scheduling the next backup: {}", e);
            None
        }
    };
    let value = next
        .map(|next| next.format(SCHEDULE_FORMAT).to_string())
        .unwrap_or_default();
    store.set("next_backup", &value)?;
    Ok(next)
}
