//! Streaming extraction with the same ceilings the validator enforces.

use crate::backup::archive_validator::{is_traversal, ArchiveLimits, Violation};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use function_name::named;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::Path;
use zip::read::ZipFile;
use zip::ZipArchive;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionSummary {
    pub files_extracted: usize,
    pub bytes_written: u64,
    pub skipped: Vec<String>,
}

/// Running totals checked against the limits as bytes arrive.
struct Budget<'a> {
    limits: &'a ArchiveLimits,
    files: usize,
    bytes: u64,
}

impl Budget<'_> {
    fn take_file(&mut self) -> Result<()> {
        self.files += 1;
        if self.files > *self.limits.max_files_in_archive() {
            return Err(Error::ArchiveRejected(Violation::FileCount {
                count: self.files,
                limit: *self.limits.max_files_in_archive(),
            }));
        }
        Ok(())
    }

    fn remaining_bytes(&self) -> u64 {
        self.limits.max_uncompressed_size().saturating_sub(self.bytes)
    }

    fn copy<R: Read, W: Write>(&mut self, reader: &mut R, writer: &mut W) -> Result<u64> {
        let remaining = self.remaining_bytes();
        let written = std::io::copy(&mut reader.take(remaining.saturating_add(1)), writer)?;
        self.bytes += written;
        if written > remaining {
            return Err(Error::ArchiveRejected(Violation::UncompressedSize {
                total: self.bytes,
                limit: *self.limits.max_uncompressed_size(),
            }));
        }
        Ok(written)
    }
}

fn is_symlink_entry<R: Read>(entry: &ZipFile<R>) -> bool {
    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;
    entry.is_symlink() || entry.unix_mode().is_some_and(|m| m & S_IFMT == S_IFLNK)
}

/// Extracts every entry under `prefix` into `dest`, dropping the prefix.
///
/// Entries outside the prefix are ignored, symlinks are skipped and reported, and any name
/// that could escape `dest` aborts the extraction.
#[named]
pub fn extract_prefixed<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    prefix: &str,
    dest: &Path,
    limits: &ArchiveLimits,
) -> Result<ExtractionSummary> {
    let mut summary = ExtractionSummary::default();
    let mut budget = Budget {
        limits,
        files: 0,
        bytes: 0,
    };

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let Some(relative) = name.strip_prefix(prefix) else {
            tracing::trace!("Ignoring {:?}, outside {:?}", name, prefix);
            continue;
        };
        if relative.is_empty() {
            continue;
        }
        if entry.enclosed_name().is_none() || is_traversal(relative) {
            return Err(
                Error::ArchiveRejected(Violation::PathTraversal { entry: name })
                    .add_fn_name(function_path!()),
            );
        }
        if is_symlink_entry(&entry) {
            tracing::warn!("Skipping symlink entry {:?}", name);
            summary.skipped.push(name);
            continue;
        }

        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        budget.take_file().add_fn_name(function_path!())?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(
            File::create(&target)
                .map_err(Error::from)
                .add_msg(format!("Failed to create {:?}", target))?,
        );
        summary.bytes_written += budget
            .copy(&mut entry, &mut out)
            .add_fn_name(function_path!())?;
        out.flush()?;
        summary.files_extracted += 1;
        tracing::trace!("Extracted {:?} to {:?}", name, target);
    }

    tracing::info!(
        "Extracted {} files ({} bytes) to {:?}, skipped {}",
        summary.files_extracted,
        summary.bytes_written,
        dest,
        summary.skipped.len()
    );
    Ok(summary)
}

/// Copies one named entry to `dest_file`, bounded by the uncompressed size limit.
///
/// Returns `Ok(None)` when the archive has no such entry.
pub fn extract_entry_to<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    dest_file: &Path,
    limits: &ArchiveLimits,
) -> Result<Option<u64>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut budget = Budget {
        limits,
        files: 0,
        bytes: 0,
    };
    let mut out = BufWriter::new(File::create(dest_file)?);
    let written = budget.copy(&mut entry, &mut out)?;
    out.flush()?;
    Ok(Some(written))
}
