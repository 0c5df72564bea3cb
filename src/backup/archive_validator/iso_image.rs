use crate::backup::archive_validator::{ArchiveLimits, ArchiveReport, Violation};
use std::path::Path;

pub(super) fn validate(path: &Path, limits: &ArchiveLimits) -> ArchiveReport {
    let size = match std::fs::metadata(path) {
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

    if size > *limits.max_iso_size() {
        return ArchiveReport::rejected(Violation::ImageSize {
            size,
            limit: *limits.max_iso_size(),
        })
        .with_stats(0.0, 0, size);
    }

    structure::check(path).with_stats(1.0, 0, size)
}

#[cfg(feature = "iso9660")]
mod structure {
    use crate::backup::archive_validator::{ArchiveReport, Violation};
    use std::fs::File;
    use std::io::{ErrorKind, Read, Seek, SeekFrom};
    use std::path::Path;

    const SECTOR_SIZE: u64 = 2048;
    const FIRST_DESCRIPTOR_SECTOR: u64 = 16;
    /// Descriptor sets longer than this without a terminator are treated as malformed.
    const MAX_DESCRIPTORS: u64 = 64;
    const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";

    const BOOT_RECORD: u8 = 0;
    const PRIMARY: u8 = 1;
    const SUPPLEMENTARY: u8 = 2;
    const PARTITION: u8 = 3;
    const TERMINATOR: u8 = 255;

    pub(super) fn check(path: &Path) -> ArchiveReport {
        match read_descriptor_set(path) {
            Ok(()) => ArchiveReport::passed(Vec::new()),
            Err(reason) => ArchiveReport::rejected(Violation::InvalidStructure { reason }),
        }
    }

    fn read_descriptor_set(path: &Path) -> Result<(), String> {
        let mut file = File::open(path).map_err(|e| e.to_string())?;
        let mut sector = [0u8; SECTOR_SIZE as usize];
        let mut seen_primary = false;

        for index in 0..MAX_DESCRIPTORS {
            let offset = (FIRST_DESCRIPTOR_SECTOR + index) * SECTOR_SIZE;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| e.to_string())?;
            file.read_exact(&mut sector).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => {
                    format!("volume descriptor set truncated at byte {offset}")
                }
                _ => e.to_string(),
            })?;

            if &sector[1..6] != STANDARD_IDENTIFIER {
                return Err(format!(
                    "missing CD001 identifier in volume descriptor at byte {offset}"
                ));
            }
            if sector[6] != 1 {
                return Err(format!(
                    "unsupported volume descriptor version {} at byte {offset}",
                    sector[6]
                ));
            }

            match sector[0] {
                PRIMARY => seen_primary = true,
                BOOT_RECORD | SUPPLEMENTARY | PARTITION => {}
                TERMINATOR if seen_primary => return Ok(()),
                TERMINATOR => {
                    return Err("descriptor set ends before a primary volume descriptor".into())
                }
                other => {
                    return Err(format!(
                        "unknown volume descriptor type {other} at byte {offset}"
                    ))
                }
            }
        }

        Err(format!(
            "no set terminator within {MAX_DESCRIPTORS} volume descriptors"
        ))
    }
}

#[cfg(not(feature = "iso9660"))]
mod structure {
    use crate::backup::archive_validator::ArchiveReport;
    use std::path::Path;

    pub(super) fn check(_path: &Path) -> ArchiveReport {
        ArchiveReport::passed(vec![
            "ISO structure was not parsed; only the size limit was checked".to_string(),
        ])
    }
}
