//! Streaming SHA-256 over artifact bytes.

use crate::backup::result_error::result::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

/// Size and hex digest of a file, read in fixed-size chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub size_bytes: u64,
    pub sha256: String,
}

pub fn fingerprint<P: AsRef<Path>>(path: P) -> Result<Fingerprint> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(Fingerprint {
        size_bytes,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_known_digest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();

        let fp = fingerprint(&path).unwrap();
        assert_eq!(fp.size_bytes, 3);
        assert_eq!(
            fp.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fingerprint_spans_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.bin");
        let data = vec![7u8; CHUNK_SIZE * 3 + 17];
        std::fs::write(&path, &data).unwrap();

        let fp = fingerprint(&path).unwrap();
        assert_eq!(fp.size_bytes, data.len() as u64);
        assert_eq!(fp.sha256, format!("{:x}", Sha256::digest(&data)));
    }

    #[test]
    fn test_fingerprint_missing_file() {
        assert!(fingerprint("/nonexistent/file.sql").is_err());
    }
}
