//! The single periodic backup job: what is persisted about it and when it fires.

pub mod scheduler;
pub mod trigger;

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::validate::{describe, validate_day_of_week, validate_time_of_day};
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::str::FromStr;

pub static DEFAULT_TIME_OF_DAY: &str = "02:00";
pub static DEFAULT_DAY_OF_WEEK: &str = "sun";

fn default_time_of_day() -> String {
    DEFAULT_TIME_OF_DAY.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePreset {
    #[default]
    #[display("disabled")]
    Disabled,
    #[serde(rename = "every_6_hours")]
    #[display("every_6_hours")]
    Every6Hours,
    #[serde(rename = "every_12_hours")]
    #[display("every_12_hours")]
    Every12Hours,
    #[display("daily")]
    Daily,
    #[display("weekly")]
    Weekly,
}

impl SchedulePreset {
    pub const ALL: [SchedulePreset; 5] = [
        SchedulePreset::Disabled,
        SchedulePreset::Every6Hours,
        SchedulePreset::Every12Hours,
        SchedulePreset::Daily,
        SchedulePreset::Weekly,
    ];
}

impl FromStr for SchedulePreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SchedulePreset::ALL
            .into_iter()
            .find(|p| p.to_string() == s)
            .ok_or_else(|| {
                Error::validation(format!(
                    "preset must be one of {}, got {s:?}",
                    itertools::join(SchedulePreset::ALL, ", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

/// Persisted schedule, stored as one JSON blob.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder, Getters)]
#[getset(get = "pub")]
pub struct ScheduleConfig {
    #[builder(default)]
    enabled: bool,
    #[serde(default)]
    #[builder(default)]
    preset: SchedulePreset,
    #[serde(default = "default_time_of_day")]
    #[builder(into, default = default_time_of_day())]
    time_of_day: String,
    /// Only meaningful for weekly schedules
    #[builder(into)]
    day_of_week: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    last_run_status: Option<RunStatus>,
    #[builder(into)]
    last_run_error: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ScheduleConfig {
    /// Checks the inputs and derives `enabled` from the preset. Weekly schedules without a
    /// day run on Sunday; other presets drop the day.
    pub fn validated(
        preset: SchedulePreset,
        time_of_day: Option<&str>,
        day_of_week: Option<&str>,
    ) -> Result<Self> {
        let time_of_day = time_of_day.unwrap_or(DEFAULT_TIME_OF_DAY);
        validate_time_of_day(time_of_day).map_err(|e| Error::validation(describe(&e)))?;

        let day_of_week = match preset {
            SchedulePreset::Weekly => {
                let day = day_of_week.unwrap_or(DEFAULT_DAY_OF_WEEK);
                validate_day_of_week(day).map_err(|e| Error::validation(describe(&e)))?;
                Some(day.to_ascii_lowercase())
            }
            _ => None,
        };

        Ok(Self::builder()
            .enabled(preset != SchedulePreset::Disabled)
            .preset(preset)
            .time_of_day(time_of_day)
            .maybe_day_of_week(day_of_week)
            .build())
    }

    /// Replaces the trigger part, keeping the last-run bookkeeping.
    pub fn with_last_run_of(mut self, previous: &ScheduleConfig) -> Self {
        self.last_run_at = previous.last_run_at;
        self.last_run_status = previous.last_run_status;
        self.last_run_error = previous.last_run_error.clone();
        self
    }

    pub fn record_run(&mut self, at: DateTime<Utc>, outcome: std::result::Result<(), String>) {
        self.last_run_at = Some(at);
        match outcome {
            Ok(()) => {
                self.last_run_status = Some(RunStatus::Success);
                self.last_run_error = None;
            }
            Err(e) => {
                self.last_run_status = Some(RunStatus::Failed);
                self.last_run_error = Some(e);
            }
        }
    }

    /// `(hour, minute)` of `time_of_day`.
    pub fn hour_minute(&self) -> Result<(u32, u32)> {
        validate_time_of_day(&self.time_of_day).map_err(|e| Error::validation(describe(&e)))?;
        let (hour, minute) = self
            .time_of_day
            .split_once(':')
            .ok_or_else(|| Error::validation("time_of_day must be HH:MM"))?;
        Ok((
            hour.parse()
                .map_err(|_| Error::validation("time_of_day hour is not a number"))?,
            minute
                .parse()
                .map_err(|_| Error::validation("time_of_day minute is not a number"))?,
        ))
    }
}

/// The schedule together with its next fire time, `None` when nothing is armed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleView {
    pub config: ScheduleConfig,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_names() {
        assert_eq!(
            serde_json::to_string(&SchedulePreset::Every6Hours).unwrap(),
            "\"every_6_hours\""
        );
        assert_eq!(
            "every_12_hours".parse::<SchedulePreset>().unwrap(),
            SchedulePreset::Every12Hours
        );
        assert!(matches!(
            "hourly".parse::<SchedulePreset>().unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn test_validated_derives_enabled() {
        let daily = ScheduleConfig::validated(SchedulePreset::Daily, Some("03:00"), Some("mon"))
            .unwrap();
        assert!(*daily.enabled());
        assert_eq!(daily.day_of_week(), &None);

        let disabled = ScheduleConfig::validated(SchedulePreset::Disabled, None, None).unwrap();
        assert!(!*disabled.enabled());
        assert_eq!(disabled.time_of_day(), DEFAULT_TIME_OF_DAY);
    }

    #[test]
    fn test_validated_weekly_day() {
        let weekly = ScheduleConfig::validated(SchedulePreset::Weekly, None, Some("FRI")).unwrap();
        assert_eq!(weekly.day_of_week().as_deref(), Some("fri"));

        let defaulted = ScheduleConfig::validated(SchedulePreset::Weekly, None, None).unwrap();
        assert_eq!(defaulted.day_of_week().as_deref(), Some("sun"));

        assert!(ScheduleConfig::validated(SchedulePreset::Weekly, None, Some("funday")).is_err());
    }

    #[test]
    fn test_validated_rejects_bad_time() {
        for time in ["3:00", "24:00", "12:60", "noon"] {
            let err = ScheduleConfig::validated(SchedulePreset::Daily, Some(time), None)
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{time}");
        }
    }

    #[test]
    fn test_record_run_overwrites_outcome() {
        let mut config = ScheduleConfig::default();
        let at = Utc::now();

        config.record_run(at, Err("pg_dump exited with code 1".into()));
        assert_eq!(config.last_run_status(), &Some(RunStatus::Failed));

        config.record_run(at, Ok(()));
        assert_eq!(config.last_run_status(), &Some(RunStatus::Success));
        assert_eq!(config.last_run_error(), &None);
        assert_eq!(config.last_run_at(), &Some(at));
    }

    #[test]
    fn test_hour_minute() {
        let config = ScheduleConfig::builder().time_of_day("07:45").build();
        assert_eq!(config.hour_minute().unwrap(), (7, 45));
    }
}
