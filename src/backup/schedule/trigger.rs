use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDebugObjectAndFnName;
use crate::backup::schedule::{ScheduleConfig, SchedulePreset, DEFAULT_DAY_OF_WEEK};
use chrono::{DateTime, Duration, Utc};
use function_name::named;

/// When the armed job fires. All times are UTC.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Every `every`, counted from `anchor`
    Interval {
        every: Duration,
        anchor: DateTime<Utc>,
    },
    /// Five-field cron expression
    Cron(String),
}

impl Trigger {
    /// `None` for a disabled schedule. Interval presets are anchored at `now`.
    #[named]
    pub fn from_config(config: &ScheduleConfig, now: DateTime<Utc>) -> Result<Option<Trigger>> {
        let interval = |hours: i64| -> Result<Option<Trigger>> {
            Ok(Some(Trigger::Interval {
                every: Duration::hours(hours),
                anchor: now,
            }))
        };
        match config.preset() {
            SchedulePreset::Disabled => Ok(None),
            SchedulePreset::Every6Hours => interval(6),
            SchedulePreset::Every12Hours => interval(12),
            SchedulePreset::Daily => {
                let (hour, minute) = config.hour_minute()?;
                Self::cron(format!("{minute} {hour} * * *"), now)
                    .add_debug_object_and_fn_name(config.clone(), function_path!())
            }
            SchedulePreset::Weekly => {
                let (hour, minute) = config.hour_minute()?;
                let day = config
                    .day_of_week()
                    .as_deref()
                    .unwrap_or(DEFAULT_DAY_OF_WEEK);
                Self::cron(format!("{minute} {hour} * * {}", cron_weekday(day)?), now)
                    .add_debug_object_and_fn_name(config.clone(), function_path!())
            }
        }
    }

    fn cron(expression: String, now: DateTime<Utc>) -> Result<Option<Trigger>> {
        tracing::debug!("Building cron trigger {:?}", expression);
        if let Err(e) = cron_parser::parse(&expression, &now) {
            return Err(Error::validation(format!(
                "Invalid cron expression {expression:?}: {e:?}"
            )));
        }
        Ok(Some(Trigger::Cron(expression)))
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { every, anchor } => {
                let first = *anchor + *every;
                if after < first {
                    return Some(first);
                }
                let period = every.num_seconds().max(1);
                let elapsed_periods = (after - *anchor).num_seconds() / period + 1;
                Some(*anchor + Duration::seconds(elapsed_periods * period))
            }
            Trigger::Cron(expression) => cron_parser::parse(expression, &after).ok(),
        }
    }
}

fn cron_weekday(day: &str) -> Result<u8> {
    match day.to_ascii_lowercase().as_str() {
        "sun" => Ok(0),
        "mon" => Ok(1),
        "tue" => Ok(2),
        "wed" => Ok(3),
        "thu" => Ok(4),
        "fri" => Ok(5),
        "sat" => Ok(6),
        other => Err(Error::validation(format!("unknown day_of_week {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn now() -> DateTime<Utc> {
        // a Sunday
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn trigger(preset: SchedulePreset, time: &str, day: Option<&str>) -> Trigger {
        let config = ScheduleConfig::validated(preset, Some(time), day).unwrap();
        Trigger::from_config(&config, now()).unwrap().unwrap()
    }

    #[test]
    fn test_disabled_has_no_trigger() {
        let config = ScheduleConfig::validated(SchedulePreset::Disabled, None, None).unwrap();
        assert!(Trigger::from_config(&config, now()).unwrap().is_none());
    }

    #[test]
    fn test_interval_counts_from_anchor() {
        let t = trigger(SchedulePreset::Every6Hours, "02:00", None);

        assert_eq!(t.next_after(now()), Some(now() + Duration::hours(6)));
        assert_eq!(
            t.next_after(now() + Duration::hours(6)),
            Some(now() + Duration::hours(12))
        );
        assert_eq!(
            t.next_after(now() + Duration::minutes(13 * 60 + 5)),
            Some(now() + Duration::hours(18))
        );
    }

    #[test]
    fn test_daily_fires_at_time_of_day() {
        let t = trigger(SchedulePreset::Daily, "03:00", None);

        let next = t.next_after(now()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap());

        let same_day = trigger(SchedulePreset::Daily, "23:15", None)
            .next_after(now())
            .unwrap();
        assert_eq!((same_day.day(), same_day.hour(), same_day.minute()), (18, 23, 15));
    }

    #[test]
    fn test_weekly_fires_on_weekday() {
        let next = trigger(SchedulePreset::Weekly, "04:30", Some("wed"))
            .next_after(now())
            .unwrap();

        assert_eq!(next.weekday(), Weekday::Wed);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 21, 4, 30, 0).unwrap());
    }
}
