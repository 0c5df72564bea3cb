use crate::backup::archive_validator::{lowercase_extension, Violation};
use crate::backup::checksum::fingerprint;
use crate::backup::function_path;
use crate::backup::manifest::{BackupManifest, DATABASE_ENTRY_NAME, MANIFEST_FILE_NAME, UPLOADS_PREFIX};
use crate::backup::orchestrator::TIMESTAMP_FORMAT;
use crate::backup::record::{BackupRecord, BackupStatus, BackupType, NewBackupRecord};
use crate::backup::restore::RestoreOrchestrator;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDebugObjectAndFnName, AddMsg};
use function_name::named;
use sanitize_filename::sanitize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use zip::ZipArchive;

/// What a ZIP's central directory says about the backup inside it.
#[derive(Debug, Default)]
struct ArchiveContents {
    has_database: bool,
    has_uploads: bool,
    manifest_type: Option<BackupType>,
}

impl RestoreOrchestrator {
    /// Classifies, validates and stores an externally supplied backup file.
    ///
    /// `.sql` files are database backups. ZIPs must pass the archive validator first, then
    /// are full backups when they carry `database.sql` and files backups when they only
    /// carry `uploads/`.
    #[named]
    pub fn process_uploaded_backup(&self, file: &Path, uploaded_by: &str) -> Result<BackupRecord> {
        let original_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::validation(format!("{:?} is not a file name", file)))?;
        if !file.is_file() {
            return Err(Error::ArchiveRejected(Violation::Missing {
                path: file.to_string_lossy().to_string(),
            })
            .add_debug_object_and_fn_name(file.to_path_buf(), function_path!()));
        }

        let backup_type = self
            .classify(file, &original_name)
            .add_debug_object_and_fn_name(file.to_path_buf(), function_path!())?;

        let created_at = self.backups.clock().utc();
        let stored_path = self.backups.backup_dir().join(format!(
            "uploaded_{}_{}",
            created_at.format(TIMESTAMP_FORMAT),
            sanitize(&original_name)
        ));
        std::fs::copy(file, &stored_path)
            .map_err(Error::from)
            .add_msg(format!("Failed to copy {:?} to {:?}", file, stored_path))?;
        let fp = fingerprint(&stored_path)?;

        let record = self.backups.records().insert(
            NewBackupRecord::builder()
                .backup_type(backup_type)
                .status(BackupStatus::Uploaded)
                .file_path(stored_path.clone())
                .size_bytes(fp.size_bytes)
                .checksum(fp.sha256)
                .description(format!("Uploaded by {}: {}", uploaded_by, original_name))
                .compression_used(backup_type.is_archive())
                .created_at(created_at)
                .build(),
        );
        match record {
            Ok(record) => {
                tracing::info!(
                    "Stored uploaded {} backup {} from {} at {:?}",
                    backup_type,
                    record.id(),
                    uploaded_by,
                    stored_path
                );
                Ok(record)
            }
            Err(e) => {
                if let Err(remove_error) = std::fs::remove_file(&stored_path) {
                    tracing::warn!("Failed to remove {:?}: {}", stored_path, remove_error);
                }
                Err(e)
            }
        }
    }

    fn classify(&self, file: &Path, name: &str) -> Result<BackupType> {
        match lowercase_extension(name).as_deref() {
            Some("sql") => Ok(BackupType::Database),
            Some("zip") => {
                self.validator.validate_zip(file).into_result()?;
                let contents = inspect_zip(file)?;
                match (contents.has_database, contents.has_uploads, contents.manifest_type) {
                    (false, _, Some(BackupType::Full)) => Err(Error::validation(format!(
                        "Manifest declares a full backup but {} is missing",
                        DATABASE_ENTRY_NAME
                    ))),
                    (true, _, _) => Ok(BackupType::Full),
                    (false, true, _) => Ok(BackupType::Files),
                    (false, false, _) => Err(Error::validation(format!(
                        "{:?} holds neither {} nor {} entries",
                        name, DATABASE_ENTRY_NAME, UPLOADS_PREFIX
                    ))),
                }
            }
            other => Err(Error::ArchiveRejected(Violation::UnsupportedType {
                extension: other.unwrap_or_default().to_string(),
            })),
        }
    }
}

fn inspect_zip(file: &Path) -> Result<ArchiveContents> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(file)?))?;
    let mut contents = ArchiveContents {
        has_database: archive.index_for_name(DATABASE_ENTRY_NAME).is_some(),
        has_uploads: archive
            .file_names()
            .any(|n| n.starts_with(UPLOADS_PREFIX) && n.len() > UPLOADS_PREFIX.len()),
        ..Default::default()
    };
    if archive.index_for_name(MANIFEST_FILE_NAME).is_some() {
        match BackupManifest::from_reader(archive.by_name(MANIFEST_FILE_NAME)?) {
            Ok(manifest) => contents.manifest_type = Some(*manifest.backup_type()),
            Err(e) => tracing::warn!("Ignoring unreadable manifest in {:?}: {}", file, e),
        }
    }
    Ok(contents)
}
