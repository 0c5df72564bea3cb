//! Creating, verifying and expiring backups.

use crate::backup::archive::upload_tree::UploadTreeSource;
use crate::backup::archive::zip_builder::ZipBuilder;
use crate::backup::archive::{ArchiveEntry, ArchiveEntryIterable};
use crate::backup::archive_validator::ArchiveLimits;
use crate::backup::checksum::{fingerprint, Fingerprint};
use crate::backup::database::postgres::PgClient;
use crate::backup::database::DatabaseDumper;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::function_path;
use crate::backup::manifest::{BackupManifest, Component, DATABASE_ENTRY_NAME, MANIFEST_FILE_NAME};
use crate::backup::record::store::{RecordStore, SqliteRecordStore};
use crate::backup::record::{BackupRecord, BackupStatus, BackupType, NewBackupRecord};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDebugObjectAndFnName, AddFunctionName, AddMsg};
use crate::backup::retention::{
    artifact_globset, is_backup_artifact_name, DeletionReason, ItemWithDateTime, RetentionPolicy,
    RetentionReason,
};
use crate::backup::settings::Settings;
use bon::Builder;
use chrono::{DateTime, Utc};
use function_name::named;
use getset::Getters;
use mockable::{Clock, DefaultClock};
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub static TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// Outcome of re-hashing a backup artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    pub backup_id: i64,
    pub verified: bool,
    pub status: BackupStatus,
    pub file_exists: bool,
    pub size_matches: bool,
    pub checksum_matches: bool,
    pub expected_size: u64,
    pub actual_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub backup_id: i64,
    /// False when the artifact was already gone and only the record was removed
    pub file_existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedBackup {
    pub backup_id: i64,
    pub file_path: PathBuf,
    pub reason: DeletionReason,
    pub file_existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetainedBackup {
    pub backup_id: i64,
    pub created_at: DateTime<Utc>,
    pub reason: RetentionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tracked_deleted: Vec<DeletedBackup>,
    pub orphans_deleted: Vec<PathBuf>,
    pub retained: Vec<RetainedBackup>,
    /// Deletions that failed; the rest of the sweep still ran
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> usize {
        self.tracked_deleted.len() + self.orphans_deleted.len()
    }
}

/// Dry run of the retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionStatus {
    pub total: usize,
    pub protected_by_count: usize,
    pub within_retention_window: usize,
    pub eligible_for_deletion: usize,
    pub eligible_ids: Vec<i64>,
    pub cutoff: DateTime<Utc>,
    pub policy: RetentionPolicy,
}

#[derive(Builder, Getters)]
#[getset(get = "pub")]
pub struct BackupOrchestrator {
    #[builder(into)]
    backup_dir: PathBuf,
    #[builder(into)]
    upload_dir: PathBuf,
    #[builder(into, default = "trash".to_string())]
    trash_dir_name: String,
    #[builder(default)]
    retention: RetentionPolicy,
    #[builder(default)]
    limits: ArchiveLimits,
    records: Arc<dyn RecordStore>,
    dumper: Arc<dyn DatabaseDumper>,
    #[builder(default = default_clock())]
    clock: Arc<dyn Clock>,
}

impl BackupOrchestrator {
    /// Wires the SQLite record store and the PostgreSQL client named by the settings.
    #[named]
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let records = SqliteRecordStore::open(settings.record_db_path())
            .add_fn_name(function_path!())?;
        Ok(Self::with_collaborators(
            settings,
            Arc::new(records),
            Arc::new(PgClient::new(settings.database().clone())),
            default_clock(),
        ))
    }

    pub fn with_collaborators(
        settings: &Settings,
        records: Arc<dyn RecordStore>,
        dumper: Arc<dyn DatabaseDumper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::builder()
            .backup_dir(settings.backup_dir())
            .upload_dir(settings.upload_dir())
            .trash_dir_name(settings.trash_dir_name())
            .retention(settings.retention().clone())
            .limits(settings.archive_limits().clone())
            .records(records)
            .dumper(dumper)
            .clock(clock)
            .build()
    }

    pub fn create_database_backup(&self, description: Option<&str>) -> Result<BackupRecord> {
        self.create_backup(BackupType::Database, description)
    }

    pub fn create_files_backup(&self, description: Option<&str>) -> Result<BackupRecord> {
        self.create_backup(BackupType::Files, description)
    }

    pub fn create_full_backup(&self, description: Option<&str>) -> Result<BackupRecord> {
        self.create_backup(BackupType::Full, description)
    }

    /// Writes the artifact under a temporary name, renames it into place and records it.
    /// A failed attempt is recorded too, with the error text, before the error is returned.
    #[named]
    pub fn create_backup(
        &self,
        backup_type: BackupType,
        description: Option<&str>,
    ) -> Result<BackupRecord> {
        let created_at = self.clock.utc();
        let final_path = self.artifact_path(backup_type, created_at);
        let tmp_path = tmp_path_for(&final_path);
        tracing::info!("Creating {} backup {:?}", backup_type, final_path);

        let outcome = self
            .write_artifact(backup_type, description, created_at, &tmp_path)
            .and_then(|compression_used| {
                std::fs::rename(&tmp_path, &final_path)
                    .map_err(Error::from)
                    .add_msg(format!("Failed to move {:?} into place", tmp_path))?;
                let fp = fingerprint(&final_path)?;
                Ok((compression_used, fp))
            });

        match outcome {
            Ok((compression_used, Fingerprint { size_bytes, sha256 })) => {
                let record = self
                    .records
                    .insert(
                        NewBackupRecord::builder()
                            .backup_type(backup_type)
                            .status(BackupStatus::Created)
                            .file_path(final_path.clone())
                            .size_bytes(size_bytes)
                            .checksum(sha256)
                            .maybe_description(description)
                            .compression_used(compression_used)
                            .created_at(created_at)
                            .build(),
                    )
                    .add_fn_name(function_path!())?;
                tracing::info!(
                    "Created {} backup {} at {:?} ({} bytes)",
                    backup_type,
                    record.id(),
                    final_path,
                    size_bytes
                );
                Ok(record)
            }
            Err(error) => {
                tracing::error!("{} backup failed: {}", backup_type, error);
                for leftover in [&tmp_path, &final_path] {
                    if leftover.exists() {
                        if let Err(e) = std::fs::remove_file(leftover) {
                            tracing::warn!("Failed to remove {:?}: {}", leftover, e);
                        }
                    }
                }
                let failed = self.records.insert(
                    NewBackupRecord::builder()
                        .backup_type(backup_type)
                        .status(BackupStatus::Failed)
                        .file_path(final_path)
                        .maybe_description(description)
                        .compression_used(backup_type.is_archive())
                        .created_at(created_at)
                        .error_message(error.to_string())
                        .build(),
                );
                let error = error.add_fn_name(function_path!());
                match failed {
                    Ok(_) => Err(error),
                    Err(record_error) => Err(error.chain(record_error)),
                }
            }
        }
    }

    fn write_artifact(
        &self,
        backup_type: BackupType,
        description: Option<&str>,
        created_at: DateTime<Utc>,
        tmp_path: &Path,
    ) -> Result<bool> {
        match backup_type {
            BackupType::Database => {
                self.dumper.dump_to(tmp_path)?;
                Ok(false)
            }
            BackupType::Files => {
                let mut builder = ZipBuilder::create(tmp_path)?;
                builder.add_entries(self.upload_tree().archive_entry_iterator()?)?;
                builder.finish()?;
                Ok(true)
            }
            BackupType::Full => {
                let staging = tempfile::Builder::new()
                    .prefix(".staging_")
                    .tempdir_in(&self.backup_dir)?;
                let dump_path = staging.path().join(DATABASE_ENTRY_NAME);
                self.dumper.dump_to(&dump_path)?;

                let manifest = BackupManifest::builder()
                    .backup_type(BackupType::Full)
                    .created_at(created_at)
                    .maybe_description(description)
                    .components(vec![Component::Database, Component::Uploads])
                    .build();

                let mut builder = ZipBuilder::create(tmp_path)?;
                builder.add_bytes(MANIFEST_FILE_NAME, manifest.to_json()?.as_bytes())?;
                builder.add_file(&ArchiveEntry::new(dump_path, DATABASE_ENTRY_NAME))?;
                builder.add_entries(self.upload_tree().archive_entry_iterator()?)?;
                builder.finish()?;
                Ok(true)
            }
        }
    }

    pub fn upload_tree(&self) -> UploadTreeSource {
        UploadTreeSource::builder()
            .src_dir(self.upload_dir.clone())
            .trash_dir_name(self.trash_dir_name.clone())
            .build()
    }

    /// `<prefix>_<timestamp>.<ext>`, with a counter appended if that name is already taken.
    pub fn artifact_path(&self, backup_type: BackupType, created_at: DateTime<Utc>) -> PathBuf {
        let stem = format!(
            "{}_{}",
            backup_type.artifact_prefix(),
            created_at.format(TIMESTAMP_FORMAT)
        );
        let ext = backup_type.file_ext();
        let mut path = self.backup_dir.join(format!("{stem}.{ext}"));
        let mut counter = 1;
        while path.exists() || tmp_path_for(&path).exists() {
            path = self.backup_dir.join(format!("{stem}_{counter}.{ext}"));
            counter += 1;
        }
        path
    }

    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.records.list()
    }

    pub fn get_backup(&self, id: i64) -> Result<BackupRecord> {
        self.records.get(id)?.ok_or_else(|| Error::not_found(id))
    }

    /// Re-hashes the artifact and demotes the record on drift. A demoted record is never
    /// promoted back, even when the file matches again.
    #[named]
    pub fn verify_backup(&self, id: i64) -> Result<VerifyResult> {
        let record = self.get_backup(id).add_fn_name(function_path!())?;
        let expected_size = *record.size_bytes();

        let mut result = VerifyResult {
            backup_id: id,
            verified: false,
            status: *record.status(),
            file_exists: record.file_path().is_file(),
            size_matches: false,
            checksum_matches: false,
            expected_size,
            actual_size: None,
        };

        if *record.status() == BackupStatus::Failed {
            tracing::warn!("Backup {} is a failed attempt, nothing to verify", id);
            return Ok(result);
        }

        let drifted_to = if result.file_exists {
            let fp = fingerprint(record.file_path())
                .add_debug_object_and_fn_name(record.file_path().clone(), function_path!())?;
            result.actual_size = Some(fp.size_bytes);
            result.size_matches = fp.size_bytes == expected_size;
            result.checksum_matches = record.checksum().as_deref() == Some(fp.sha256.as_str());
            match (result.size_matches, result.checksum_matches) {
                (false, false) => Some(BackupStatus::Corrupted),
                (false, true) => Some(BackupStatus::SizeMismatch),
                (true, false) => Some(BackupStatus::ChecksumFailed),
                (true, true) => None,
            }
        } else {
            Some(BackupStatus::Missing)
        };

        match drifted_to {
            Some(status) => {
                tracing::warn!("Backup {} failed verification: {}", id, status);
                if status != *record.status() {
                    self.records.update_status(id, status)?;
                }
                result.status = status;
            }
            None => result.verified = true,
        }
        Ok(result)
    }

    /// Size and checksum must both match the record.
    pub fn ensure_intact(&self, record: &BackupRecord) -> Result<()> {
        if *record.status() == BackupStatus::Failed {
            return Err(Error::integrity(*record.id(), "backup attempt failed, no artifact"));
        }
        if !record.file_path().is_file() {
            return Err(Error::integrity(
                *record.id(),
                format!("artifact {:?} is missing", record.file_path()),
            ));
        }
        let fp = fingerprint(record.file_path())?;
        if fp.size_bytes != *record.size_bytes() {
            return Err(Error::integrity(
                *record.id(),
                format!(
                    "size is {} bytes, recorded {} bytes",
                    fp.size_bytes,
                    record.size_bytes()
                ),
            ));
        }
        if record.checksum().as_deref() != Some(fp.sha256.as_str()) {
            return Err(Error::integrity(*record.id(), "checksum does not match"));
        }
        Ok(())
    }

    /// Removes the artifact if present, then the record.
    #[named]
    pub fn delete_backup(&self, id: i64) -> Result<DeleteOutcome> {
        let record = self.get_backup(id).add_fn_name(function_path!())?;
        let file_existed = record.file_path().exists();
        if file_existed {
            std::fs::remove_file(record.file_path())
                .map_err(Error::from)
                .add_debug_object_and_fn_name(record.file_path().clone(), function_path!())?;
        }
        self.records.delete(id)?;
        tracing::info!(
            "Deleted backup {} ({:?}, file existed: {})",
            id,
            record.file_path(),
            file_existed
        );
        Ok(DeleteOutcome {
            backup_id: id,
            file_existed,
        })
    }

    pub fn retention_status(&self) -> Result<RetentionStatus> {
        let records = self.records.list()?;
        let total = records.len();
        let plan = self.retention.plan(
            records.into_iter().map(|r| ItemWithDateTime {
                date_time: *r.created_at(),
                item: *r.id(),
            }),
            self.clock.utc(),
        );
        let protected_by_count = plan
            .keep
            .iter()
            .filter(|(_, reason)| *reason == RetentionReason::ProtectedByCount)
            .count();

        Ok(RetentionStatus {
            total,
            protected_by_count,
            within_retention_window: plan.keep.len() - protected_by_count,
            eligible_for_deletion: plan.delete.len(),
            eligible_ids: plan.delete.iter().map(|(i, _)| i.item).collect(),
            cutoff: plan.cutoff,
            policy: self.retention.clone(),
        })
    }

    /// Applies the retention policy, then sweeps unrecorded artifacts older than the cutoff.
    #[named]
    pub fn cleanup_old_backups(&self) -> Result<CleanupReport> {
        let records = self.records.list().add_fn_name(function_path!())?;
        let known_paths: HashSet<PathBuf> = records.iter().map(|r| r.file_path().clone()).collect();
        let plan = self.retention.plan(
            records.into_iter().map(|r| ItemWithDateTime {
                date_time: *r.created_at(),
                item: r,
            }),
            self.clock.utc(),
        );

        let mut report = CleanupReport {
            retained: plan
                .keep
                .iter()
                .map(|(i, reason)| RetainedBackup {
                    backup_id: *i.item.id(),
                    created_at: i.date_time,
                    reason: *reason,
                })
                .collect(),
            ..Default::default()
        };

        for (item, reason) in plan.delete {
            let record = item.item;
            match self.delete_backup(*record.id()) {
                Ok(outcome) => report.tracked_deleted.push(DeletedBackup {
                    backup_id: outcome.backup_id,
                    file_path: record.file_path().clone(),
                    reason,
                    file_existed: outcome.file_existed,
                }),
                Err(e) => {
                    tracing::warn!("Failed to delete backup {}: {}", record.id(), e);
                    report.failures.push(e.to_string());
                }
            }
        }

        self.sweep_orphans(&known_paths, plan.cutoff, &mut report)
            .add_fn_name(function_path!())?;

        tracing::info!(
            "Cleanup removed {} tracked and {} orphaned backups, kept {}",
            report.tracked_deleted.len(),
            report.orphans_deleted.len(),
            report.retained.len()
        );
        Ok(report)
    }

    fn sweep_orphans(
        &self,
        known_paths: &HashSet<PathBuf>,
        cutoff: DateTime<Utc>,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let globset = artifact_globset()?;
        for dir_entry in std::fs::read_dir(&self.backup_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if !dir_entry.file_type()?.is_file()
                || !is_backup_artifact_name(&globset, &path)
                || known_paths.contains(&path)
            {
                continue;
            }
            let modified: DateTime<Utc> = dir_entry.metadata()?.modified()?.into();
            if modified >= cutoff {
                tracing::debug!("Keeping recent unrecorded file {:?}", path);
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!("Removed orphaned backup file {:?}", path);
                    report.orphans_deleted.push(path);
                }
                Err(e) => {
                    tracing::warn!("Failed to remove orphan {:?}: {}", path, e);
                    report.failures.push(format!("{:?}: {}", path, e));
                }
            }
        }
        Ok(())
    }
}

pub fn default_clock() -> Arc<dyn Clock> {
    Arc::new(DefaultClock)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
