//! Backup records: one row per backup attempt.

pub mod store;

use crate::backup::file_ext::FileExtProvider;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::Getters;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    #[display("database")]
    Database,
    #[display("files")]
    Files,
    #[display("full")]
    Full,
}

impl BackupType {
    pub const ALL: [BackupType; 3] = [BackupType::Database, BackupType::Files, BackupType::Full];

    /// File name prefix of artifacts created for this type.
    pub fn artifact_prefix(&self) -> &'static str {
        match self {
            BackupType::Database => "db_backup",
            BackupType::Files => "files_backup",
            BackupType::Full => "full_backup",
        }
    }

    pub fn is_archive(&self) -> bool {
        !matches!(self, BackupType::Database)
    }
}

impl FileExtProvider for BackupType {
    fn file_ext(&self) -> &'static str {
        match self {
            BackupType::Database => "sql",
            BackupType::Files | BackupType::Full => "zip",
        }
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(BackupType::Database),
            "files" => Ok(BackupType::Files),
            "full" => Ok(BackupType::Full),
            other => Err(format!(
                "unknown backup type {other:?}, expected database, files or full"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    #[display("created")]
    Created,
    #[display("failed")]
    Failed,
    #[display("missing")]
    Missing,
    #[display("corrupted")]
    Corrupted,
    #[display("size_mismatch")]
    SizeMismatch,
    #[display("checksum_failed")]
    ChecksumFailed,
    #[display("uploaded")]
    Uploaded,
}

impl BackupStatus {
    /// Statuses whose artifact was intact when last looked at.
    pub fn is_healthy(&self) -> bool {
        matches!(self, BackupStatus::Created | BackupStatus::Uploaded)
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BackupStatus::Created),
            "failed" => Ok(BackupStatus::Failed),
            "missing" => Ok(BackupStatus::Missing),
            "corrupted" => Ok(BackupStatus::Corrupted),
            "size_mismatch" => Ok(BackupStatus::SizeMismatch),
            "checksum_failed" => Ok(BackupStatus::ChecksumFailed),
            "uploaded" => Ok(BackupStatus::Uploaded),
            other => Err(format!("unknown backup status {other:?}")),
        }
    }
}

macro_rules! impl_text_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.to_string()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

impl_text_sql!(BackupType);
impl_text_sql!(BackupStatus);

/// A persisted backup attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder, Getters)]
#[getset(get = "pub")]
pub struct BackupRecord {
    id: i64,
    backup_type: BackupType,
    status: BackupStatus,
    #[builder(into)]
    file_path: PathBuf,
    size_bytes: u64,
    /// Hex SHA-256 of the artifact, absent for failed attempts
    #[builder(into)]
    checksum: Option<String>,
    #[builder(into)]
    description: Option<String>,
    compression_used: bool,
    created_at: DateTime<Utc>,
    #[builder(into)]
    error_message: Option<String>,
}

impl BackupRecord {
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// A backup attempt about to be persisted; the store assigns the id.
#[derive(Debug, Clone, Builder)]
pub struct NewBackupRecord {
    pub backup_type: BackupType,
    pub status: BackupStatus,
    #[builder(into)]
    pub file_path: PathBuf,
    #[builder(default)]
    pub size_bytes: u64,
    #[builder(into)]
    pub checksum: Option<String>,
    #[builder(into)]
    pub description: Option<String>,
    pub compression_used: bool,
    pub created_at: DateTime<Utc>,
    #[builder(into)]
    pub error_message: Option<String>,
}

impl NewBackupRecord {
    pub fn into_record(self, id: i64) -> BackupRecord {
        BackupRecord {
            id,
            backup_type: self.backup_type,
            status: self.status,
            file_path: self.file_path,
            size_bytes: self.size_bytes,
            checksum: self.checksum,
            description: self.description,
            compression_used: self.compression_used,
            created_at: self.created_at,
            error_message: self.error_message,
        }
    }
}
