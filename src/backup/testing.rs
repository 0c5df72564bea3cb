//! Fakes and fixtures shared by unit tests.

use crate::backup::database::{DatabaseDumper, DatabaseHandle, TableName};
use crate::backup::orchestrator::BackupOrchestrator;
use crate::backup::record::store::SqliteRecordStore;
use crate::backup::restore::RestoreOrchestrator;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use mockable::Clock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub(crate) static DUMP_SQL: &str =
    "CREATE TABLE users (id integer, name text);\nINSERT INTO users VALUES (1, 'ada');\n";

pub(crate) struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for FixedClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()),
        }
    }
}

impl FixedClock {
    pub(crate) fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub(crate) fn advance_secs(&self, secs: i64) {
        *self.now.lock().unwrap() += Duration::seconds(secs);
    }

    pub(crate) fn advance_days(&self, days: i64) {
        *self.now.lock().unwrap() += Duration::days(days);
    }
}

impl Clock for FixedClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Writes a fixed SQL body where `pg_dump` would write its dump.
pub(crate) struct FakeDumper;

impl DatabaseDumper for FakeDumper {
    fn dump_to(&self, dest: &Path) -> Result<()> {
        std::fs::write(dest, DUMP_SQL)?;
        Ok(())
    }
}

pub(crate) struct FailingDumper;

impl DatabaseDumper for FailingDumper {
    fn dump_to(&self, _dest: &Path) -> Result<()> {
        Err(Error::ToolExecution {
            tool: "pg_dump".to_string(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "pg_dump: error: connection reset by peer".to_string(),
        })
    }
}

/// Records every destructive call instead of touching a database.
pub(crate) struct FakeDatabase {
    pub(crate) tables: Mutex<Vec<String>>,
    pub(crate) dropped: Mutex<Vec<String>>,
    pub(crate) replayed: Mutex<Vec<String>>,
    pub(crate) rollbacks: AtomicUsize,
    pub(crate) fail_replay: AtomicBool,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self {
            tables: Mutex::new(vec![
                "users".to_string(),
                "orders".to_string(),
                "backups".to_string(),
            ]),
            dropped: Mutex::new(vec![]),
            replayed: Mutex::new(vec![]),
            rollbacks: AtomicUsize::new(0),
            fail_replay: AtomicBool::new(false),
        }
    }
}

impl DatabaseHandle for FakeDatabase {
    fn tracking_table(&self) -> &str {
        "backups"
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.lock().unwrap().clone())
    }

    fn row_counts(&self, tables: &[TableName]) -> Result<Vec<(String, u64)>> {
        Ok(tables
            .iter()
            .map(|t| (t.as_str().to_string(), 10))
            .collect())
    }

    fn drop_table(&self, table: &TableName) -> Result<()> {
        self.tables.lock().unwrap().retain(|t| t != table.as_str());
        self.dropped.lock().unwrap().push(table.as_str().to_string());
        Ok(())
    }

    fn replay_dump(&self, dump: &Path) -> Result<()> {
        if self.fail_replay.load(Ordering::SeqCst) {
            return Err(Error::ToolExecution {
                tool: "psql".to_string(),
                exit_code: Some(3),
                stdout: String::new(),
                stderr: "ERROR:  syntax error at or near \"CREAT\"".to_string(),
            });
        }
        self.replayed
            .lock()
            .unwrap()
            .push(std::fs::read_to_string(dump)?);
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub(crate) temp_dir: TempDir,
    pub(crate) clock: Arc<FixedClock>,
    pub(crate) records: Arc<SqliteRecordStore>,
    pub(crate) database: Arc<FakeDatabase>,
    pub(crate) orchestrator: Arc<BackupOrchestrator>,
}

/// Empty backup and upload directories, an in-memory record store and a working dumper.
pub(crate) fn fixture() -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    std::fs::create_dir(temp_dir.path().join("backups")).unwrap();
    std::fs::create_dir(temp_dir.path().join("uploads")).unwrap();
    let clock = Arc::new(FixedClock::default());
    let records = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    let orchestrator = build(&temp_dir, records.clone(), Arc::new(FakeDumper), clock.clone());
    Fixture {
        temp_dir,
        clock,
        records,
        database: Arc::new(FakeDatabase::default()),
        orchestrator,
    }
}

fn build(
    temp_dir: &TempDir,
    records: Arc<SqliteRecordStore>,
    dumper: Arc<dyn DatabaseDumper>,
    clock: Arc<FixedClock>,
) -> Arc<BackupOrchestrator> {
    Arc::new(
        BackupOrchestrator::builder()
            .backup_dir(temp_dir.path().join("backups"))
            .upload_dir(temp_dir.path().join("uploads"))
            .records(records)
            .dumper(dumper)
            .clock(clock)
            .build(),
    )
}

impl Fixture {
    pub(crate) fn backup_dir(&self) -> PathBuf {
        self.temp_dir.path().join("backups")
    }

    pub(crate) fn upload_dir(&self) -> PathBuf {
        self.temp_dir.path().join("uploads")
    }

    pub(crate) fn with_dumper(mut self, dumper: Arc<dyn DatabaseDumper>) -> Self {
        self.orchestrator = build(
            &self.temp_dir,
            self.records.clone(),
            dumper,
            self.clock.clone(),
        );
        self
    }

    pub(crate) fn restorer(&self) -> RestoreOrchestrator {
        RestoreOrchestrator::new(self.orchestrator.clone(), self.database.clone())
    }
}
