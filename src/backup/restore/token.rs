//! Confirmation tokens for restores.
//!
//! A token is derived from the backup id and the UTC calendar day, so it is stable for a day
//! and stops matching at midnight. It guards against accidental or replayed restores and is
//! not a secret.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

pub fn confirmation_token(backup_id: i64, day: NaiveDate) -> String {
    let digest = Sha256::digest(format!("restore-{}-{}", backup_id, day.format("%Y-%m-%d")));
    let hex = format!("{:x}", digest);
    format!("RESTORE-{}-{}", backup_id, &hex[..8])
}

pub fn check_token(backup_id: i64, token: &str, day: NaiveDate) -> Result<()> {
    if token.trim() == confirmation_token(backup_id, day) {
        Ok(())
    } else {
        tracing::warn!("Rejected restore of backup {} with a stale or wrong token", backup_id);
        Err(Error::validation(format!(
            "Invalid confirmation token for backup {backup_id}, request a new one with preview"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[test]
    fn test_token_is_stable_within_a_day() {
        let token = confirmation_token(7, day(18));

        assert_eq!(token, confirmation_token(7, day(18)));
        assert!(token.starts_with("RESTORE-7-"));
        assert_eq!(token.len(), "RESTORE-7-".len() + 8);
    }

    #[test]
    fn test_token_changes_with_day_and_id() {
        assert_ne!(confirmation_token(7, day(18)), confirmation_token(7, day(19)));
        assert_ne!(confirmation_token(7, day(18)), confirmation_token(8, day(18)));
    }

    #[test]
    fn test_check_token() {
        let token = confirmation_token(3, day(18));

        assert!(check_token(3, &token, day(18)).is_ok());
        assert!(check_token(3, &format!(" {token}\n"), day(18)).is_ok());
        assert!(matches!(
            check_token(3, &token, day(19)),
            Err(Error::Validation(_))
        ));
        assert!(check_token(4, &token, day(18)).is_err());
    }
}
