use crate::backup::function_path;
use crate::backup::record::{BackupRecord, BackupStatus, NewBackupRecord};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::schedule::ScheduleConfig;
use function_name::named;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

static SCHEDULE_SETTINGS_KEY: &str = "backup_schedule";

static CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_type TEXT NOT NULL,
    status TEXT NOT NULL,
    file_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    checksum TEXT,
    description TEXT,
    compression_used INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS backup_records_created_at ON backup_records (created_at);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

static SELECT_RECORD_SQL: &str = "SELECT id, backup_type, status, file_path, size_bytes, checksum, \
     description, compression_used, created_at, error_message FROM backup_records";

/// Persistence for backup records.
pub trait RecordStore: Send + Sync {
    fn insert(&self, record: NewBackupRecord) -> Result<BackupRecord>;

    fn get(&self, id: i64) -> Result<Option<BackupRecord>>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<BackupRecord>>;

    fn update_status(&self, id: i64, status: BackupStatus) -> Result<()>;

    /// Returns false when no record had this id.
    fn delete(&self, id: i64) -> Result<bool>;
}

/// Persistence for the single stored schedule configuration.
pub trait ScheduleStore: Send + Sync {
    fn load_schedule(&self) -> Result<Option<ScheduleConfig>>;

    fn save_schedule(&self, config: &ScheduleConfig) -> Result<()>;
}

pub struct SqliteRecordStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    #[named]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(Error::from)
            .add_msg(format!("Failed to open record database {:?}", path))
            .add_fn_name(function_path!())?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
        let file_path: String = row.get(3)?;
        let size_bytes: i64 = row.get(4)?;
        Ok(BackupRecord::builder()
            .id(row.get(0)?)
            .backup_type(row.get(1)?)
            .status(row.get(2)?)
            .file_path(file_path)
            .size_bytes(u64::try_from(size_bytes).unwrap_or_default())
            .maybe_checksum(row.get::<_, Option<String>>(5)?)
            .maybe_description(row.get::<_, Option<String>>(6)?)
            .compression_used(row.get(7)?)
            .created_at(row.get(8)?)
            .maybe_error_message(row.get::<_, Option<String>>(9)?)
            .build())
    }
}

impl RecordStore for SqliteRecordStore {
    #[named]
    fn insert(&self, record: NewBackupRecord) -> Result<BackupRecord> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO backup_records (backup_type, status, file_path, size_bytes, checksum, \
             description, compression_used, created_at, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.backup_type,
                record.status,
                record.file_path.to_string_lossy(),
                i64::try_from(record.size_bytes).unwrap_or(i64::MAX),
                record.checksum,
                record.description,
                record.compression_used,
                record.created_at,
                record.error_message,
            ],
        )
        .map_err(Error::from)
        .add_fn_name(function_path!())?;
        let id = conn.last_insert_rowid();
        Ok(record.into_record(id))
    }

    fn get(&self, id: i64) -> Result<Option<BackupRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!("{SELECT_RECORD_SQL} WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?)
    }

    fn list(&self) -> Result<Vec<BackupRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_RECORD_SQL} ORDER BY created_at DESC, id DESC"
        ))?;
        let records = stmt
            .query_map([], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn update_status(&self, id: i64, status: BackupStatus) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE backup_records SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(id));
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM backup_records WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

impl ScheduleStore for SqliteRecordStore {
    #[named]
    fn load_schedule(&self) -> Result<Option<ScheduleConfig>> {
        let value: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SCHEDULE_SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|v| {
                serde_json::from_str::<ScheduleConfig>(&v)
                    .map_err(Error::from)
                    .add_msg("Stored backup schedule is not valid JSON")
                    .add_fn_name(function_path!())
            })
            .transpose()
    }

    fn save_schedule(&self, config: &ScheduleConfig) -> Result<()> {
        let value = serde_json::to_string(config)?;
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEDULE_SETTINGS_KEY, value],
        )?;
        Ok(())
    }
}
