use crate::backup::archive_validator::{
    lowercase_extension, ArchiveLimits, ArchiveReport, Violation, NESTED_ARCHIVE_EXTENSIONS,
    PROHIBITED_EXTENSIONS,
};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use zip::ZipArchive;

/// Central-directory facts about one entry.
struct EntryMeta {
    name: String,
    enclosed: bool,
    is_dir: bool,
    size: u64,
}

pub(super) fn validate(path: &Path, limits: &ArchiveLimits) -> ArchiveReport {
    let archive_size = match std::fs::metadata(path) {
        Ok(md) if md.is_file() => md.len(),
        Ok(_) => {
            return ArchiveReport::rejected(Violation::InvalidStructure {
                reason: format!("{:?} is not a regular file", path),
            })
        }
        Err(_) => {
            return ArchiveReport::rejected(Violation::Missing {
                path: path.to_string_lossy().to_string(),
            })
        }
    };

    let entries = match read_central_directory(path) {
        Ok(entries) => entries,
        Err(reason) => return ArchiveReport::rejected(Violation::InvalidStructure { reason }),
    };

    let total: u64 = entries.iter().map(|e| e.size).sum();
    let file_count = entries.iter().filter(|e| !e.is_dir).count();
    let ratio = if archive_size == 0 {
        0.0
    } else {
        total as f64 / archive_size as f64
    };

    check(&entries, limits, ratio, file_count, total).with_stats(ratio, file_count, total)
}

fn read_central_directory(path: &Path) -> Result<Vec<EntryMeta>, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| e.to_string())?;
    (0..archive.len())
        .map(|i| {
            let entry = archive.by_index_raw(i).map_err(|e| e.to_string())?;
            Ok(EntryMeta {
                name: entry.name().to_string(),
                enclosed: entry.enclosed_name().is_some(),
                is_dir: entry.is_dir(),
                size: entry.size(),
            })
        })
        .collect()
}

fn check(
    entries: &[EntryMeta],
    limits: &ArchiveLimits,
    ratio: f64,
    file_count: usize,
    total: u64,
) -> ArchiveReport {
    if ratio > *limits.max_compression_ratio() {
        return ArchiveReport::rejected(Violation::CompressionRatio {
            ratio,
            limit: *limits.max_compression_ratio(),
        });
    }
    if total > *limits.max_uncompressed_size() {
        return ArchiveReport::rejected(Violation::UncompressedSize {
            total,
            limit: *limits.max_uncompressed_size(),
        });
    }

    let mut warnings: Vec<String> = entries
        .iter()
        .filter(|e| e.size > *limits.max_single_file_size())
        .map(|e| {
            format!(
                "entry {:?} is {} bytes, above the {} byte single file limit",
                e.name,
                e.size,
                limits.max_single_file_size()
            )
        })
        .collect();

    if file_count > *limits.max_files_in_archive() {
        return ArchiveReport::rejected(Violation::FileCount {
            count: file_count,
            limit: *limits.max_files_in_archive(),
        });
    }

    if let Some(entry) = entries
        .iter()
        .find(|e| !e.enclosed || is_traversal(&e.name))
    {
        return ArchiveReport::rejected(Violation::PathTraversal {
            entry: entry.name.clone(),
        });
    }

    for entry in entries.iter().filter(|e| !e.is_dir) {
        if let Some(extension) = lowercase_extension(&entry.name) {
            if PROHIBITED_EXTENSIONS.contains(&extension.as_str()) {
                return ArchiveReport::rejected(Violation::ProhibitedExtension {
                    entry: entry.name.clone(),
                    extension,
                });
            }
            if NESTED_ARCHIVE_EXTENSIONS.contains(&extension.as_str()) {
                warnings.push(format!("entry {:?} is a nested archive", entry.name));
            }
        }
    }

    ArchiveReport::passed(warnings)
}

/// True when `name` is absolute, drive-qualified or contains `..` anywhere.
pub(crate) fn is_traversal(name: &str) -> bool {
    let bytes = name.as_bytes();
    let absolute = name.starts_with(['/', '\\']);
    let drive_letter = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    absolute || drive_letter || name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive_validator::ArchiveValidator;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn write_zip(
        dir: &TempDir,
        name: &str,
        method: CompressionMethod,
        entries: &[(&str, &[u8])],
    ) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default().compression_method(method);
        for (entry_name, data) in entries {
            writer.start_file(*entry_name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn rule(report: &ArchiveReport) -> Option<&'static str> {
        report.violation().as_ref().map(Violation::rule)
    }

    #[test]
    fn test_plain_text_zip_passes_without_warnings() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_zip(
            &temp_dir,
            "plain.zip",
            CompressionMethod::Stored,
            &[
                ("uploads/a.txt", b"alpha alpha"),
                ("uploads/b.txt", b"bravo"),
                ("uploads/c.txt", b"charlie"),
            ],
        );

        let report = ArchiveValidator::default().validate_zip(&path);

        assert!(*report.valid(), "{:?}", report);
        assert!(report.warnings().is_empty());
        assert_eq!(*report.file_count(), 3);
        assert_eq!(*report.total_uncompressed_size(), 23);
        assert!(*report.compression_ratio() < 1.0);
    }

    #[test]
    fn test_high_ratio_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let zeros = vec![0u8; 2 * 1024 * 1024];
        let path = write_zip(
            &temp_dir,
            "bomb.zip",
            CompressionMethod::Deflated,
            &[("zeros.bin", zeros.as_slice())],
        );

        let report = ArchiveValidator::default().validate_zip(&path);

        assert!(!*report.valid());
        assert_eq!(rule(&report), Some("compression_ratio"));
        assert!(report
            .error_message()
            .as_deref()
            .unwrap()
            .contains("compression ratio"));
    }

    #[test]
    fn test_uncompressed_total_limit() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_zip(
            &temp_dir,
            "big.zip",
            CompressionMethod::Stored,
            &[("a.txt", &[1u8; 4096])],
        );
        let validator = ArchiveValidator::new(
            ArchiveLimits::builder().max_uncompressed_size(1024).build(),
        );

        assert_eq!(rule(&validator.validate_zip(&path)), Some("uncompressed_size"));
    }

    #[test]
    fn test_parent_reference_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_zip(
            &temp_dir,
            "evil.zip",
            CompressionMethod::Stored,
            &[("ok.txt", b"fine"), ("../../etc/passwd", b"root:x:0:0")],
        );

        let report = ArchiveValidator::default().validate_zip(&path);

        assert_eq!(
            report.violation(),
            &Some(Violation::PathTraversal {
                entry: "../../etc/passwd".into()
            })
        );
    }

    #[test]
    fn test_executable_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_zip(
            &temp_dir,
            "exe.zip",
            CompressionMethod::Stored,
            &[("readme.txt", b"hello"), ("payload.exe", b"MZ")],
        );

        let report = ArchiveValidator::default().validate_zip(&path);

        assert_eq!(rule(&report), Some("prohibited_extension"));
        assert!(report.error_message().as_deref().unwrap().contains("payload.exe"));
    }

    #[test]
    fn test_file_count_ceiling() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_zip(
            &temp_dir,
            "many.zip",
            CompressionMethod::Stored,
            &[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c")],
        );
        let validator =
            ArchiveValidator::new(ArchiveLimits::builder().max_files_in_archive(2).build());

        let report = validator.validate_zip(&path);

        assert_eq!(
            report.violation(),
            &Some(Violation::FileCount { count: 3, limit: 2 })
        );
    }

    #[test]
    fn test_nested_archive_and_large_entry_are_warnings() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_zip(
            &temp_dir,
            "nested.zip",
            CompressionMethod::Stored,
            &[("inner.zip", b"PK not really"), ("big.txt", &[b'x'; 2048])],
        );
        let validator =
            ArchiveValidator::new(ArchiveLimits::builder().max_single_file_size(1024).build());

        let report = validator.validate_zip(&path);

        assert!(*report.valid());
        assert_eq!(report.warnings().len(), 2);
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let temp_dir = TempDir::new().unwrap();
        let validator = ArchiveValidator::default();

        let missing = validator.validate_zip(temp_dir.path().join("nope.zip"));
        assert_eq!(rule(&missing), Some("missing"));

        let garbage = temp_dir.path().join("garbage.zip");
        std::fs::write(&garbage, b"definitely not a zip file").unwrap();
        assert_eq!(rule(&validator.validate_zip(&garbage)), Some("structure"));
    }

    #[test]
    fn test_is_traversal() {
        assert!(is_traversal("../x"));
        assert!(is_traversal("a/../../x"));
        assert!(is_traversal("a\\..\\x"));
        assert!(is_traversal("/etc/passwd"));
        assert!(is_traversal("\\windows"));
        assert!(is_traversal("C:evil.txt"));
        assert!(is_traversal("uploads/notes..txt"));
        assert!(is_traversal("uploads/a..b.txt"));
        assert!(is_traversal("uploads/..hidden"));
        assert!(!is_traversal("uploads/notes.v2.txt"));
        assert!(!is_traversal("uploads/./a.txt"));
    }
}
