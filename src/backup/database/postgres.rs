use crate::backup::database::{DatabaseDumper, DatabaseHandle, TableName};
use crate::backup::function_path;
use crate::backup::process::{ToolInvocation, ToolOutput};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::{Validate, ValidationError};

static PASSWORD_ENV: &str = "PGPASSWORD";

static CONNECTION_FAILURE_MARKERS: [&str; 4] = [
    "could not connect",
    "connection to server",
    "connection refused",
    "could not translate host name",
];

fn default_port() -> u16 {
    5432
}

fn default_pg_dump_path() -> PathBuf {
    PathBuf::from("pg_dump")
}

fn default_psql_path() -> PathBuf {
    PathBuf::from("psql")
}

fn default_tracking_table() -> String {
    "backups".to_string()
}

fn default_dump_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_restore_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(60)
}

fn validate_tracking_table<S: AsRef<str>>(name: S) -> std::result::Result<(), ValidationError> {
    TableName::parse(name.as_ref())
        .map(|_| ())
        .map_err(|_| ValidationError::new("tracking table must be a plain identifier"))
}

/// Connection and tool settings for the PostgreSQL application database.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct PostgresConfig {
    #[validate(length(min = 1))]
    #[builder(into)]
    host: String,
    #[serde(default = "default_port")]
    #[builder(default = default_port())]
    port: u16,
    #[validate(length(min = 1))]
    #[builder(into)]
    username: String,
    #[validate(length(min = 1))]
    #[builder(into)]
    dbname: String,
    #[builder(into)]
    password: Option<RedactedString>,
    #[serde(default = "default_pg_dump_path")]
    #[builder(default = default_pg_dump_path(), into)]
    pg_dump_path: PathBuf,
    #[serde(default = "default_psql_path")]
    #[builder(default = default_psql_path(), into)]
    psql_path: PathBuf,
    /// Table holding backup records, excluded from dumps and never dropped by a restore
    #[serde(default = "default_tracking_table")]
    #[validate(custom(function = validate_tracking_table))]
    #[builder(default = default_tracking_table(), into)]
    tracking_table: String,
    #[serde(default = "default_dump_timeout", with = "humantime_serde")]
    #[builder(default = default_dump_timeout())]
    dump_timeout: Duration,
    #[serde(default = "default_restore_timeout", with = "humantime_serde")]
    #[builder(default = default_restore_timeout())]
    restore_timeout: Duration,
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    #[builder(default = default_query_timeout())]
    query_timeout: Duration,
}

/// Drives `pg_dump` and `psql` as child processes.
#[derive(Debug, Clone)]
pub struct PgClient {
    config: PostgresConfig,
}

impl PgClient {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    fn connection_args(&self) -> Vec<OsString> {
        vec![
            "--host".into(),
            self.config.host.as_str().into(),
            "--port".into(),
            self.config.port.to_string().into(),
            "--username".into(),
            self.config.username.as_str().into(),
            "--dbname".into(),
            self.config.dbname.as_str().into(),
            "--no-password".into(),
        ]
    }

    fn secret_envs(&self) -> Vec<(String, RedactedString)> {
        self.config
            .password
            .iter()
            .map(|p| (PASSWORD_ENV.to_string(), p.clone()))
            .collect()
    }

    fn dump_args(&self, dest: &Path) -> Vec<OsString> {
        let mut args = self.connection_args();
        args.extend([
            "--format=plain".into(),
            format!("--exclude-table={}", self.config.tracking_table).into(),
            "--file".into(),
            dest.as_os_str().to_os_string(),
        ]);
        args
    }

    fn psql(&self, extra_args: Vec<OsString>, timeout: Duration) -> Result<ToolOutput> {
        let mut args = self.connection_args();
        args.push("--no-psqlrc".into());
        args.extend(extra_args);
        ToolInvocation::builder()
            .program(self.config.psql_path.clone())
            .args(args)
            .secret_envs(self.secret_envs())
            .timeout(timeout)
            .build()
            .run()
            .map_err(classify_failure)
    }

    fn query(&self, sql: &str) -> Result<Vec<String>> {
        let output = self.psql(
            vec![
                "--tuples-only".into(),
                "--no-align".into(),
                "--field-separator=|".into(),
                "--command".into(),
                sql.into(),
            ],
            self.config.query_timeout,
        )?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Turns spawn failures and refused connections into [`Error::Connection`].
fn classify_failure(error: Error) -> Error {
    let unreachable = match error.root() {
        Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        Error::ToolExecution { stderr, .. } => {
            let stderr = stderr.to_lowercase();
            CONNECTION_FAILURE_MARKERS
                .iter()
                .any(|marker| stderr.contains(marker))
        }
        _ => false,
    };
    if unreachable {
        Error::connection(error.to_string())
    } else {
        error
    }
}

impl DatabaseDumper for PgClient {
    #[named]
    fn dump_to(&self, dest: &Path) -> Result<()> {
        tracing::info!(
            "Dumping database {:?} on {}:{} to {:?}",
            self.config.dbname,
            self.config.host,
            self.config.port,
            dest
        );
        ToolInvocation::builder()
            .program(self.config.pg_dump_path.clone())
            .args(self.dump_args(dest))
            .secret_envs(self.secret_envs())
            .timeout(self.config.dump_timeout)
            .build()
            .run()
            .map_err(classify_failure)
            .add_fn_name(function_path!())?;
        Ok(())
    }
}

impl DatabaseHandle for PgClient {
    fn tracking_table(&self) -> &str {
        &self.config.tracking_table
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        self.query(
            "SELECT tablename FROM pg_catalog.pg_tables \
             WHERE schemaname = current_schema() ORDER BY tablename",
        )
        .add_msg("Failed to list tables")
    }

    fn row_counts(&self, tables: &[TableName]) -> Result<Vec<(String, u64)>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let sql = tables
            .iter()
            .map(|t| format!("SELECT '{}', count(*) FROM {}", t.as_str(), t.quoted()))
            .join(" UNION ALL ");

        self.query(&sql)?
            .into_iter()
            .map(|line| {
                let (name, count) = line.split_once('|').ok_or_else(|| {
                    Error::validation(format!("Unexpected row count output {:?}", line))
                })?;
                let count = count.trim().parse::<u64>().map_err(|e| {
                    Error::validation(format!("Unexpected row count {:?}: {}", count, e))
                })?;
                Ok((name.to_string(), count))
            })
            .collect()
    }

    fn drop_table(&self, table: &TableName) -> Result<()> {
        tracing::info!("Dropping table {}", table);
        self.psql(
            vec![
                "--command".into(),
                format!("DROP TABLE IF EXISTS {} CASCADE", table.quoted()).into(),
            ],
            self.config.query_timeout,
        )
        .add_msg(format!("Failed to drop table {}", table))?;
        Ok(())
    }

    #[named]
    fn replay_dump(&self, dump: &Path) -> Result<()> {
        tracing::info!("Replaying {:?} into {:?}", dump, self.config.dbname);
        self.psql(
            vec![
                "--single-transaction".into(),
                "-v".into(),
                "ON_ERROR_STOP=1".into(),
                "--file".into(),
                dump.as_os_str().to_os_string(),
            ],
            self.config.restore_timeout,
        )
        .add_fn_name(function_path!())?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        // Every psql call is its own session; --single-transaction already aborts on error.
        tracing::debug!("No open transaction to roll back for {:?}", self.config.dbname);
        Ok(())
    }
}
