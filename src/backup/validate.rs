//! Validation functions for configuration values.
//!
//! Provides custom validation functions for directories, file names and the
//! schedule's time-of-day / weekday fields.

use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

/// Three-letter weekday names accepted by weekly schedules, Monday first.
pub static WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

pub fn validate_sanitized_file_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    if name.as_ref().is_empty() || !is_sanitized(name.as_ref()) {
        return Err(ValidationError::new("InvalidFileName").with_message(
            format!(
                "Invalid file name, try sanitizing like {:?}",
                sanitize(name)
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access directory {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

/// Accepts 24-hour `HH:MM` with exactly two digits on each side.
pub fn validate_time_of_day<S: AsRef<str>>(time: S) -> Result<(), ValidationError> {
    let time = time.as_ref();
    let invalid = || {
        ValidationError::new("InvalidTimeOfDay")
            .with_message(format!("time_of_day must be HH:MM (24h), got {time:?}").into())
    };

    let (hour, minute) = time.split_once(':').ok_or_else(invalid)?;
    if hour.len() != 2 || minute.len() != 2 {
        return Err(invalid());
    }
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }

    Ok(())
}

pub fn validate_day_of_week<S: AsRef<str>>(day: S) -> Result<(), ValidationError> {
    let day = day.as_ref();
    if !WEEKDAYS.contains(&day.to_ascii_lowercase().as_str()) {
        return Err(ValidationError::new("InvalidDayOfWeek").with_message(
            format!(
                "day_of_week must be one of {}, got {day:?}",
                WEEKDAYS.join(", ")
            )
            .into(),
        ));
    }

    Ok(())
}

/// Human readable message of a `ValidationError`, falling back to its code.
pub fn describe(error: &ValidationError) -> String {
    error
        .message
        .as_ref()
        .map(|m| m.to_string())
        .unwrap_or_else(|| error.code.to_string())
}
