//! Metadata-only inspection of untrusted archives.
//!
//! Nothing here extracts or buffers entry contents: ZIP checks read the central directory,
//! ISO checks read the volume descriptor set. A rejected archive carries the [`Violation`]
//! naming the rule it broke.

mod iso_image;
mod zip_archive;

pub(crate) use zip_archive::is_traversal;

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use validator::Validate;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Extensions rejected anywhere inside an uploaded archive.
pub static PROHIBITED_EXTENSIONS: [&str; 27] = [
    "exe", "dll", "com", "scr", "bat", "cmd", "msi", "msp", "cpl", "sh", "bash", "zsh", "ps1",
    "psm1", "psd1", "vbs", "vbe", "js", "jse", "wsf", "hta", "jar", "apk", "deb", "rpm", "pkg",
    "dmg",
];

/// Extensions reported as nested archives.
pub static NESTED_ARCHIVE_EXTENSIONS: [&str; 11] = [
    "zip", "tar", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "iso", "cab",
];

fn default_max_compression_ratio() -> f64 {
    10.0
}

fn default_max_uncompressed_size() -> u64 {
    10 * GIB
}

fn default_max_single_file_size() -> u64 {
    500 * MIB
}

fn default_max_files_in_archive() -> usize {
    10_000
}

fn default_max_iso_size() -> u64 {
    GIB
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct ArchiveLimits {
    #[serde(default = "default_max_compression_ratio")]
    #[validate(range(min = 1.0))]
    #[builder(default = default_max_compression_ratio())]
    max_compression_ratio: f64,
    #[serde(default = "default_max_uncompressed_size")]
    #[builder(default = default_max_uncompressed_size())]
    max_uncompressed_size: u64,
    /// Entries above this only produce a warning
    #[serde(default = "default_max_single_file_size")]
    #[builder(default = default_max_single_file_size())]
    max_single_file_size: u64,
    #[serde(default = "default_max_files_in_archive")]
    #[validate(range(min = 1))]
    #[builder(default = default_max_files_in_archive())]
    max_files_in_archive: usize,
    #[serde(default = "default_max_iso_size")]
    #[builder(default = default_max_iso_size())]
    max_iso_size: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The security rule an archive broke.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Violation {
    #[error("archive {path} does not exist")]
    Missing { path: String },
    #[error("invalid archive structure: {reason}")]
    InvalidStructure { reason: String },
    #[error("compression ratio {ratio:.1} exceeds limit {limit:.1}")]
    CompressionRatio { ratio: f64, limit: f64 },
    #[error("uncompressed size {total} bytes exceeds limit {limit} bytes")]
    UncompressedSize { total: u64, limit: u64 },
    #[error("file count {count} exceeds limit {limit}")]
    FileCount { count: usize, limit: usize },
    #[error("path traversal in entry {entry:?}")]
    PathTraversal { entry: String },
    #[error("prohibited extension .{extension} in entry {entry:?}")]
    ProhibitedExtension { entry: String, extension: String },
    #[error("image size {size} bytes exceeds limit {limit} bytes")]
    ImageSize { size: u64, limit: u64 },
    #[error("unsupported archive type {extension:?}")]
    UnsupportedType { extension: String },
}

impl Violation {
    pub fn rule(&self) -> &'static str {
        match self {
            Violation::Missing { .. } => "missing",
            Violation::InvalidStructure { .. } => "structure",
            Violation::CompressionRatio { .. } => "compression_ratio",
            Violation::UncompressedSize { .. } => "uncompressed_size",
            Violation::FileCount { .. } => "file_count",
            Violation::PathTraversal { .. } => "path_traversal",
            Violation::ProhibitedExtension { .. } => "prohibited_extension",
            Violation::ImageSize { .. } => "image_size",
            Violation::UnsupportedType { .. } => "unsupported_type",
        }
    }
}

/// Outcome of validating one archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Getters)]
#[getset(get = "pub")]
pub struct ArchiveReport {
    valid: bool,
    error_message: Option<String>,
    violation: Option<Violation>,
    warnings: Vec<String>,
    compression_ratio: f64,
    file_count: usize,
    total_uncompressed_size: u64,
}

impl ArchiveReport {
    fn passed(warnings: Vec<String>) -> Self {
        Self {
            valid: true,
            warnings,
            ..Default::default()
        }
    }

    fn rejected(violation: Violation) -> Self {
        Self {
            valid: false,
            error_message: Some(violation.to_string()),
            violation: Some(violation),
            ..Default::default()
        }
    }

    fn with_stats(mut self, ratio: f64, file_count: usize, total: u64) -> Self {
        self.compression_ratio = ratio;
        self.file_count = file_count;
        self.total_uncompressed_size = total;
        self
    }

    /// `Err(Error::ArchiveRejected)` for a failed report, the report itself otherwise.
    pub fn into_result(self) -> Result<Self> {
        match (self.valid, self.violation.clone()) {
            (false, Some(violation)) => Err(Error::ArchiveRejected(violation)),
            (false, None) => Err(Error::validation(
                self.error_message
                    .unwrap_or_else(|| "archive failed validation".to_string()),
            )),
            (true, _) => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveValidator {
    limits: ArchiveLimits,
}

impl ArchiveValidator {
    pub fn new(limits: ArchiveLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ArchiveLimits {
        &self.limits
    }

    pub fn validate_zip<P: AsRef<Path>>(&self, path: P) -> ArchiveReport {
        let path = path.as_ref();
        let report = zip_archive::validate(path, &self.limits);
        log_outcome(path, &report);
        report
    }

    pub fn validate_iso<P: AsRef<Path>>(&self, path: P) -> ArchiveReport {
        let path = path.as_ref();
        let report = iso_image::validate(path, &self.limits);
        log_outcome(path, &report);
        report
    }

    /// Picks the ZIP or ISO checks from the file extension.
    pub fn validate_path<P: AsRef<Path>>(&self, path: P) -> ArchiveReport {
        let path = path.as_ref();
        match lowercase_extension(path.to_string_lossy().as_ref()).as_deref() {
            Some("zip") => self.validate_zip(path),
            Some("iso") => self.validate_iso(path),
            other => {
                let report = ArchiveReport::rejected(Violation::UnsupportedType {
                    extension: other.unwrap_or_default().to_string(),
                });
                log_outcome(path, &report);
                report
            }
        }
    }
}

fn log_outcome(path: &Path, report: &ArchiveReport) {
    match &report.violation {
        Some(violation) => tracing::warn!(
            "Rejected archive {:?} by {} rule: {}",
            path,
            violation.rule(),
            violation
        ),
        None => tracing::debug!(
            "Archive {:?} passed with {} warning(s)",
            path,
            report.warnings.len()
        ),
    }
}

/// Extension of the last path segment, accepting both `/` and `\` separators.
pub(crate) fn lowercase_extension(name: &str) -> Option<String> {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    file_name
        .rsplit_once('.')
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercase_extension() {
        assert_eq!(lowercase_extension("a/b/Payload.EXE").as_deref(), Some("exe"));
        assert_eq!(lowercase_extension("dir\\x.tar.gz").as_deref(), Some("gz"));
        assert_eq!(lowercase_extension(".bashrc"), None);
        assert_eq!(lowercase_extension("README"), None);
        assert_eq!(lowercase_extension("uploads/"), None);
    }

    #[test]
    fn test_default_limits() {
        let limits = ArchiveLimits::default();
        assert_eq!(*limits.max_compression_ratio(), 10.0);
        assert_eq!(*limits.max_uncompressed_size(), 10 * GIB);
        assert_eq!(*limits.max_single_file_size(), 500 * MIB);
        assert_eq!(*limits.max_files_in_archive(), 10_000);
        assert_eq!(*limits.max_iso_size(), GIB);
    }

    #[test]
    fn test_into_result_names_violation() {
        let report = ArchiveReport::rejected(Violation::PathTraversal {
            entry: "../../etc/passwd".into(),
        });
        let err = report.into_result().unwrap_err();
        assert!(matches!(
            err,
            Error::ArchiveRejected(Violation::PathTraversal { .. })
        ));
        assert!(err.to_string().contains("path traversal"));
    }

    #[test]
    fn test_validate_path_rejects_unknown_type() {
        let report = ArchiveValidator::default().validate_path("/tmp/backup.rar");
        assert!(!report.valid());
        assert_eq!(report.violation().as_ref().map(Violation::rule), Some("unsupported_type"));
    }
}
