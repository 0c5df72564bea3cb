//! Restoring backups, always behind a fresh safety backup.
//!
//! `execute_restore` runs in a fixed order: token check, upload validation, integrity check,
//! safety backup, then the destructive step. Nothing is touched before the safety backup
//! exists, and any failure after it comes back as [`Error::RestoreFailed`] carrying its id.

pub mod preview;
pub mod token;
pub mod upload;

use crate::backup::archive::extract::{extract_entry_to, extract_prefixed, ExtractionSummary};
use crate::backup::archive_validator::ArchiveValidator;
use crate::backup::database::postgres::PgClient;
use crate::backup::database::{DatabaseHandle, TableName};
use crate::backup::function_path;
use crate::backup::manifest::{BackupManifest, DATABASE_ENTRY_NAME, MANIFEST_FILE_NAME, UPLOADS_PREFIX};
use crate::backup::orchestrator::{default_clock, BackupOrchestrator, TIMESTAMP_FORMAT};
use crate::backup::record::store::SqliteRecordStore;
use crate::backup::record::{BackupRecord, BackupStatus, BackupType};
use crate::backup::restore::token::{check_token, confirmation_token};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::settings::Settings;
use function_name::named;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zip::ZipArchive;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreResult {
    pub backup_id: i64,
    pub backup_type: BackupType,
    pub safety_backup_id: i64,
    pub tables_dropped: Vec<String>,
    pub database_restored: bool,
    pub files_restored: usize,
    pub bytes_restored: u64,
    /// Where the upload directory was moved before extraction
    pub snapshot_dir: Option<PathBuf>,
    pub skipped_entries: Vec<String>,
    pub warnings: Vec<String>,
}

impl RestoreResult {
    fn new(record: &BackupRecord, safety_backup_id: i64) -> Self {
        Self {
            backup_id: *record.id(),
            backup_type: *record.backup_type(),
            safety_backup_id,
            tables_dropped: vec![],
            database_restored: false,
            files_restored: 0,
            bytes_restored: 0,
            snapshot_dir: None,
            skipped_entries: vec![],
            warnings: vec![],
        }
    }

    fn absorb(&mut self, summary: ExtractionSummary) {
        self.files_restored += summary.files_extracted;
        self.bytes_restored += summary.bytes_written;
        self.skipped_entries.extend(summary.skipped);
    }
}

pub struct RestoreOrchestrator {
    backups: Arc<BackupOrchestrator>,
    database: Arc<dyn DatabaseHandle>,
    validator: ArchiveValidator,
}

impl RestoreOrchestrator {
    pub fn new(backups: Arc<BackupOrchestrator>, database: Arc<dyn DatabaseHandle>) -> Self {
        let validator = ArchiveValidator::new(backups.limits().clone());
        Self {
            backups,
            database,
            validator,
        }
    }

    /// One PostgreSQL client serves both the safety dump and the restore.
    #[named]
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let records = SqliteRecordStore::open(settings.record_db_path())
            .add_fn_name(function_path!())?;
        let pg = Arc::new(PgClient::new(settings.database().clone()));
        let backups = BackupOrchestrator::with_collaborators(
            settings,
            Arc::new(records),
            pg.clone(),
            default_clock(),
        );
        Ok(Self::new(Arc::new(backups), pg))
    }

    pub fn backups(&self) -> &BackupOrchestrator {
        &self.backups
    }

    pub fn validator(&self) -> &ArchiveValidator {
        &self.validator
    }

    /// Token for today, UTC.
    pub fn generate_confirmation_token(&self, backup_id: i64) -> String {
        confirmation_token(backup_id, self.backups.clock().utc().date_naive())
    }

    #[named]
    pub fn execute_restore(&self, backup_id: i64, token: &str) -> Result<RestoreResult> {
        check_token(backup_id, token, self.backups.clock().utc().date_naive())
            .add_fn_name(function_path!())?;
        let record = self.backups.get_backup(backup_id)?;

        if *record.status() == BackupStatus::Uploaded && record.backup_type().is_archive() {
            self.validator
                .validate_zip(record.file_path())
                .into_result()
                .add_msg(format!("Uploaded backup {} failed validation", backup_id))?;
        }
        self.backups
            .ensure_intact(&record)
            .add_fn_name(function_path!())?;

        tracing::info!("Creating safety backup before restoring backup {}", backup_id);
        let safety = self
            .backups
            .create_backup(
                *record.backup_type(),
                Some(format!("Safety backup before restoring backup {}", backup_id).as_str()),
            )
            .add_msg(format!(
                "Safety backup failed, restore of backup {} not started",
                backup_id
            ))?;
        let safety_backup_id = *safety.id();
        tracing::info!(
            "Safety backup {} created, restoring {} backup {}",
            safety_backup_id,
            record.backup_type(),
            backup_id
        );

        let mut result = RestoreResult::new(&record, safety_backup_id);
        let outcome = match record.backup_type() {
            BackupType::Database => self.restore_database(record.file_path(), &mut result),
            BackupType::Files => self.restore_files(record.file_path(), &mut result),
            BackupType::Full => self.restore_full(record.file_path(), &mut result),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    "Restored backup {}: {} table(s) dropped, {} file(s) extracted",
                    backup_id,
                    result.tables_dropped.len(),
                    result.files_restored
                );
                Ok(result)
            }
            Err(error) => {
                tracing::error!(
                    "Restore of backup {} failed, safety backup {} holds the previous state: {}",
                    backup_id,
                    safety_backup_id,
                    error
                );
                if let Err(e) = self.database.rollback() {
                    tracing::warn!("Rollback after failed restore also failed: {}", e);
                }
                Err(Error::RestoreFailed {
                    safety_backup_id,
                    error: Box::new(error),
                })
            }
        }
    }

    /// Drops every catalog table except the tracking table, then replays the dump.
    ///
    /// All names must pass the allow-list before the first drop is issued.
    fn restore_database(&self, dump: &Path, result: &mut RestoreResult) -> Result<()> {
        let tracking_table = self.database.tracking_table();
        let tables: Vec<TableName> = self
            .database
            .list_tables()?
            .into_iter()
            .filter(|name| {
                let keep = name != tracking_table;
                if !keep {
                    tracing::debug!("Keeping tracking table {:?}", name);
                }
                keep
            })
            .map(|name| TableName::parse(&name))
            .collect::<Result<Vec<_>>>()
            .add_msg("Refusing to drop tables, database left untouched")?;
        for table in tables {
            tracing::debug!("Dropping table {}", table);
            self.database.drop_table(&table)?;
            result.tables_dropped.push(table.as_str().to_string());
        }
        self.database.replay_dump(dump)?;
        result.database_restored = true;
        Ok(())
    }

    fn restore_files(&self, archive_path: &Path, result: &mut RestoreResult) -> Result<()> {
        let mut archive = open_archive(archive_path)?;
        self.replace_uploads(&mut archive, result)
    }

    /// Moves the upload directory aside, then extracts `uploads/` into a fresh one.
    #[named]
    fn replace_uploads(
        &self,
        archive: &mut ZipArchive<BufReader<File>>,
        result: &mut RestoreResult,
    ) -> Result<()> {
        let upload_dir = self.backups.upload_dir();
        if upload_dir.exists() {
            let snapshot = self.snapshot_path()?;
            std::fs::rename(upload_dir, &snapshot)
                .map_err(Error::from)
                .add_msg(format!("Failed to move {:?} to {:?}", upload_dir, snapshot))
                .add_fn_name(function_path!())?;
            tracing::info!("Moved current uploads to {:?}", snapshot);
            result.snapshot_dir = Some(snapshot);
        }
        std::fs::create_dir_all(upload_dir)?;

        let summary = extract_prefixed(archive, UPLOADS_PREFIX, upload_dir, self.backups.limits())
            .add_fn_name(function_path!())?;
        if !summary.skipped.is_empty() {
            result.warnings.push(format!(
                "Skipped {} symlink entr(ies)",
                summary.skipped.len()
            ));
        }
        result.absorb(summary);
        Ok(())
    }

    fn snapshot_path(&self) -> Result<PathBuf> {
        let upload_dir = self.backups.upload_dir();
        let name = upload_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                Error::validation(format!("Upload directory {:?} has no name", upload_dir))
            })?;
        let snapshot_name = format!(
            "{}_pre_restore_{}",
            name,
            self.backups.clock().utc().format(TIMESTAMP_FORMAT)
        );
        Ok(upload_dir.with_file_name(snapshot_name))
    }

    /// Database first, then files, from one archive staged next to the backups.
    #[named]
    fn restore_full(&self, archive_path: &Path, result: &mut RestoreResult) -> Result<()> {
        let mut archive = open_archive(archive_path)?;

        match archive.by_name(MANIFEST_FILE_NAME) {
            Ok(entry) => {
                let manifest = BackupManifest::from_reader(entry)
                    .add_msg("Failed to read backup manifest")?;
                if *manifest.backup_type() != BackupType::Full {
                    result.warnings.push(format!(
                        "Manifest declares a {} backup",
                        manifest.backup_type()
                    ));
                }
            }
            Err(zip::result::ZipError::FileNotFound) => {
                result
                    .warnings
                    .push("Backup has no manifest".to_string());
            }
            Err(e) => return Err(Error::from(e).add_fn_name(function_path!())),
        }

        let staging = tempfile::Builder::new()
            .prefix(".restore_")
            .tempdir_in(self.backups.backup_dir())?;
        let dump = staging.path().join(DATABASE_ENTRY_NAME);
        if extract_entry_to(&mut archive, DATABASE_ENTRY_NAME, &dump, self.backups.limits())?
            .is_none()
        {
            return Err(Error::validation(format!(
                "Full backup {:?} has no {}",
                archive_path, DATABASE_ENTRY_NAME
            ))
            .add_fn_name(function_path!()));
        }

        self.restore_database(&dump, result)
            .add_msg("Database part of full restore failed")?;
        self.replace_uploads(&mut archive, result)
            .add_msg("Files part of full restore failed")
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path)
        .map_err(Error::from)
        .add_msg(format!("Failed to open backup {:?}", path))?;
    Ok(ZipArchive::new(BufReader::new(file))?)
}
