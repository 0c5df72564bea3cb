//! Ports to the application database.
//!
//! The backup core only needs two capabilities from the database: producing a plain-SQL
//! dump ([`DatabaseDumper`]) and the handful of catalog, drop and replay operations a
//! restore performs ([`DatabaseHandle`]). [`postgres::PgClient`] implements both by driving
//! `pg_dump` and `psql`.

pub mod postgres;

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use derive_more::Display;
use std::path::Path;

/// Longest identifier PostgreSQL keeps without truncating.
pub const MAX_TABLE_NAME_LEN: usize = 63;

pub trait DatabaseDumper: Send + Sync {
    /// Writes a plain-SQL dump of the application database to `dest`, excluding the
    /// backup-tracking table.
    fn dump_to(&self, dest: &Path) -> Result<()>;
}

pub trait DatabaseHandle: Send + Sync {
    /// Name of the table holding backup records, which restores must leave alone.
    fn tracking_table(&self) -> &str;

    /// User tables currently present, as reported by the catalog.
    fn list_tables(&self) -> Result<Vec<String>>;

    /// Row count per table for the given tables.
    fn row_counts(&self, tables: &[TableName]) -> Result<Vec<(String, u64)>>;

    fn drop_table(&self, table: &TableName) -> Result<()>;

    /// Replays a plain-SQL dump as one all-or-nothing transaction.
    fn replay_dump(&self, dump: &Path) -> Result<()>;

    /// Rolls back whatever transaction the handle still has open.
    fn rollback(&self) -> Result<()>;
}

/// A table name that passed the identifier allow-list: ASCII letters, digits and
/// underscores, not starting with a digit, at most [`MAX_TABLE_NAME_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub struct TableName(String);

impl TableName {
    pub fn parse<S: AsRef<str>>(name: S) -> Result<Self> {
        let name = name.as_ref();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if valid_start && valid_rest && name.len() <= MAX_TABLE_NAME_LEN {
            Ok(Self(name.to_string()))
        } else {
            Err(Error::validation(format!(
                "Table name {:?} is not a plain identifier",
                name
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for interpolation into SQL.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_allow_list() {
        for ok in ["users", "_migrations", "Order_Items2", "a".repeat(63).as_str()] {
            assert!(TableName::parse(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "1users",
            "users; DROP TABLE x",
            "users\"",
            "public.users",
            "名前",
            "a".repeat(64).as_str(),
        ] {
            assert!(
                matches!(TableName::parse(bad), Err(Error::Validation(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_table_name_quoted() {
        assert_eq!(TableName::parse("users").unwrap().quoted(), "\"users\"");
    }
}
