use crate::backup::database::TableName;
use crate::backup::function_path;
use crate::backup::manifest::{DATABASE_ENTRY_NAME, UPLOADS_PREFIX};
use crate::backup::record::{BackupStatus, BackupType};
use crate::backup::restore::RestoreOrchestrator;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDebugObjectAndFnName, AddFunctionName};
use chrono::{DateTime, Duration, Utc};
use function_name::named;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use zip::ZipArchive;

/// Backups older than this get an age warning.
pub const STALE_AFTER_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRows {
    pub name: String,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabasePreview {
    pub current_table_count: usize,
    pub current_tables: Vec<TableRows>,
    pub current_total_rows: u64,
    pub dump_size_bytes: u64,
    pub dump_line_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesPreview {
    pub archive_file_count: usize,
    pub archive_uncompressed_bytes: u64,
    pub current_file_count: usize,
}

/// What a restore of one backup would replace. Building it changes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePreview {
    pub backup_id: i64,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub age_days: i64,
    pub size_bytes: u64,
    pub database: Option<DatabasePreview>,
    pub files: Option<FilesPreview>,
    pub warnings: Vec<String>,
    pub confirmation_token: String,
}

impl RestoreOrchestrator {
    #[named]
    pub fn preview_restore(&self, backup_id: i64) -> Result<RestorePreview> {
        let record = self
            .backups
            .get_backup(backup_id)
            .add_fn_name(function_path!())?;
        let now = self.backups.clock().utc();
        let age = now - *record.created_at();
        let age_days = age.num_days();

        let mut preview = RestorePreview {
            backup_id,
            backup_type: *record.backup_type(),
            status: *record.status(),
            created_at: *record.created_at(),
            age_days,
            size_bytes: *record.size_bytes(),
            database: None,
            files: None,
            warnings: vec![],
            confirmation_token: self.generate_confirmation_token(backup_id),
        };

        if age > Duration::days(STALE_AFTER_DAYS) {
            preview
                .warnings
                .push(format!("Backup is {} days old", age_days));
        }
        if !record.status().is_healthy() {
            preview.warnings.push(format!(
                "Backup status is {}, the restore will refuse it unless it verifies",
                record.status()
            ));
        }
        if !record.file_path().is_file() {
            preview
                .warnings
                .push(format!("Backup file {:?} is missing", record.file_path()));
            return Ok(preview);
        }

        let path = record.file_path();
        match record.backup_type() {
            BackupType::Database => {
                let file = File::open(path)?;
                let size = file.metadata()?.len();
                let lines = count_lines(file)?;
                preview.database = Some(self.database_preview(size, lines)?);
            }
            BackupType::Files => {
                preview.files = Some(self.files_preview(path)?);
            }
            BackupType::Full => {
                let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
                let (size, lines) = match archive.by_name(DATABASE_ENTRY_NAME) {
                    Ok(entry) => (entry.size(), count_lines(entry)?),
                    Err(_) => {
                        preview
                            .warnings
                            .push(format!("Archive has no {}", DATABASE_ENTRY_NAME));
                        (0, 0)
                    }
                };
                preview.database = Some(self.database_preview(size, lines)?);
                preview.files = Some(self.files_preview(path)?);
            }
        }

        if let Some(database) = &preview.database {
            preview.warnings.push(format!(
                "Current database data will be replaced: {} table(s), {} row(s)",
                database.current_table_count, database.current_total_rows
            ));
        }
        if let Some(files) = &preview.files {
            preview.warnings.push(format!(
                "Current upload directory will be replaced: {} file(s) now, {} in backup",
                files.current_file_count, files.archive_file_count
            ));
        }
        Ok(preview)
    }

    fn database_preview(&self, dump_size_bytes: u64, dump_line_count: u64) -> Result<DatabasePreview> {
        let tracking_table = self.database.tracking_table();
        let tables: Vec<TableName> = self
            .database
            .list_tables()?
            .into_iter()
            .filter(|name| name != tracking_table)
            .filter_map(|name| match TableName::parse(&name) {
                Ok(table) => Some(table),
                Err(e) => {
                    tracing::warn!("Not counting rows of {:?}: {}", name, e);
                    None
                }
            })
            .collect();
        let current_tables: Vec<TableRows> = self
            .database
            .row_counts(&tables)?
            .into_iter()
            .map(|(name, rows)| TableRows { name, rows })
            .collect();

        Ok(DatabasePreview {
            current_table_count: current_tables.len(),
            current_total_rows: current_tables.iter().map(|t| t.rows).sum(),
            current_tables,
            dump_size_bytes,
            dump_line_count,
        })
    }

    #[named]
    fn files_preview(&self, archive_path: &Path) -> Result<FilesPreview> {
        let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))
            .map_err(Error::from)
            .add_debug_object_and_fn_name(archive_path.to_path_buf(), function_path!())?;
        let mut archive_file_count = 0;
        let mut archive_uncompressed_bytes = 0;
        for i in 0..archive.len() {
            let Some(entry) = archive.by_index_raw(i).ok() else {
                continue;
            };
            if entry.name().starts_with(UPLOADS_PREFIX) && !entry.is_dir() {
                archive_file_count += 1;
                archive_uncompressed_bytes += entry.size();
            }
        }

        let uploads = self.backups.upload_tree();
        let current_file_count = if uploads.src_dir().is_dir() {
            uploads.count_files()?
        } else {
            0
        };

        Ok(FilesPreview {
            archive_file_count,
            archive_uncompressed_bytes,
            current_file_count,
        })
    }
}

fn count_lines<R: Read>(reader: R) -> Result<u64> {
    let mut reader = BufReader::new(reader);
    let mut lines = 0;
    let mut buf = Vec::new();
    while reader.read_until(b'\n', &mut buf)? > 0 {
        lines += 1;
        buf.clear();
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::fixture;

    #[test]
    fn test_database_preview_counts_current_rows() {
        let fx = fixture();
        let backup = fx.orchestrator.create_database_backup(None).unwrap();

        let preview = fx.restorer().preview_restore(*backup.id()).unwrap();

        let database = preview.database.unwrap();
        assert_eq!(database.current_table_count, 2);
        assert_eq!(database.current_total_rows, 20);
        assert_eq!(database.dump_line_count, 2);
        assert_eq!(database.dump_size_bytes, *backup.size_bytes());
        assert!(preview.files.is_none());
        assert!(preview
            .warnings
            .iter()
            .any(|w| w.starts_with("Current database data will be replaced")));
        assert!(fx.database.dropped.lock().unwrap().is_empty());
        assert_eq!(
            preview.confirmation_token,
            fx.restorer().generate_confirmation_token(*backup.id())
        );
    }

    #[test]
    fn test_full_preview_compares_file_counts() {
        let fx = fixture();
        std::fs::write(fx.upload_dir().join("a.txt"), "0123456789").unwrap();
        std::fs::write(fx.upload_dir().join("b.txt"), "b").unwrap();
        let backup = fx.orchestrator.create_full_backup(None).unwrap();
        std::fs::write(fx.upload_dir().join("c.txt"), "c").unwrap();

        let preview = fx.restorer().preview_restore(*backup.id()).unwrap();

        let files = preview.files.unwrap();
        assert_eq!(files.archive_file_count, 2);
        assert_eq!(files.archive_uncompressed_bytes, 11);
        assert_eq!(files.current_file_count, 3);
        assert_eq!(preview.database.unwrap().dump_line_count, 2);
    }

    #[test]
    fn test_age_warning_after_a_week() {
        let fx = fixture();
        let backup = fx.orchestrator.create_database_backup(None).unwrap();

        fx.clock.advance_days(STALE_AFTER_DAYS);
        let fresh = fx.restorer().preview_restore(*backup.id()).unwrap();
        assert!(!fresh.warnings.iter().any(|w| w.contains("days old")));

        fx.clock.advance_secs(3600);
        let just_over = fx.restorer().preview_restore(*backup.id()).unwrap();
        assert_eq!(just_over.age_days, 7);
        assert!(just_over.warnings.iter().any(|w| w == "Backup is 7 days old"));

        fx.clock.advance_days(1);
        let stale = fx.restorer().preview_restore(*backup.id()).unwrap();
        assert!(stale.warnings.iter().any(|w| w == "Backup is 8 days old"));
    }

    #[test]
    fn test_missing_file_reported_not_raised() {
        let fx = fixture();
        let backup = fx.orchestrator.create_files_backup(None).unwrap();
        std::fs::remove_file(backup.file_path()).unwrap();

        let preview = fx.restorer().preview_restore(*backup.id()).unwrap();

        assert!(preview.files.is_none());
        assert!(preview.warnings.iter().any(|w| w.contains("is missing")));
    }
}
