use crate::backup::archive::ArchiveEntry;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use function_name::named;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const BUFFER_SIZE: usize = 64 * 1024;

/// Writes a DEFLATE ZIP to a fresh file, streaming each source file into its entry.
pub struct ZipBuilder {
    path: PathBuf,
    writer: ZipWriter<BufWriter<File>>,
    options: SimpleFileOptions,
    entry_count: usize,
}

impl ZipBuilder {
    /// Fails if `path` already exists.
    #[named]
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create_new(&path)
            .map_err(Error::from)
            .add_msg(format!("Failed to create archive {:?}", path))
            .add_fn_name(function_path!())?;
        Ok(Self {
            path,
            writer: ZipWriter::new(BufWriter::with_capacity(BUFFER_SIZE, file)),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            entry_count: 0,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    #[named]
    pub fn add_file(&mut self, entry: &ArchiveEntry) -> Result<()> {
        tracing::trace!("Adding {:?} as {}", entry.src, entry.dst);
        let file = File::open(&entry.src)
            .map_err(Error::from)
            .add_msg(format!("Failed to open {:?}", entry.src))
            .add_fn_name(function_path!())?;
        let large = file.metadata()?.len() >= u64::from(u32::MAX);

        self.writer
            .start_file(entry.dst.as_str(), self.options.large_file(large))?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
        std::io::copy(&mut reader, &mut self.writer)
            .map_err(Error::from)
            .add_msg(format!("Failed to write {:?} into {:?}", entry.src, self.path))
            .add_fn_name(function_path!())?;
        self.entry_count += 1;
        Ok(())
    }

    pub fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        self.writer.start_file(name, self.options)?;
        self.writer.write_all(bytes)?;
        self.entry_count += 1;
        Ok(())
    }

    /// Adds every entry, stopping at the first failure.
    pub fn add_entries<I>(&mut self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = Result<ArchiveEntry>>,
    {
        let before = self.entry_count;
        for entry in entries {
            self.add_file(&entry?)?;
        }
        Ok(self.entry_count - before)
    }

    /// Writes the central directory and syncs the file to disk.
    #[named]
    pub fn finish(self) -> Result<PathBuf> {
        let buffered = self
            .writer
            .finish()
            .map_err(Error::from)
            .add_msg(format!("Failed to finish archive {:?}", self.path))
            .add_fn_name(function_path!())?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        tracing::debug!("Wrote {} entries to {:?}", self.entry_count, self.path);
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    #[test]
    fn test_build_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("a.txt");
        std::fs::write(&src, "0123456789").unwrap();
        let path = temp_dir.path().join("out.zip");

        let mut builder = ZipBuilder::create(&path).unwrap();
        builder
            .add_entries(vec![Ok(ArchiveEntry::new(src, "uploads/a.txt"))])
            .unwrap();
        builder.add_bytes("database.sql", b"SELECT 1;").unwrap();
        assert_eq!(builder.entry_count(), 2);
        builder.finish().unwrap();

        let mut archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut content = String::new();
        let mut entry = archive.by_name("uploads/a.txt").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Deflated);
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "0123456789");
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("exists.zip");
        std::fs::write(&path, "x").unwrap();

        assert!(ZipBuilder::create(&path).is_err());
    }

    #[test]
    fn test_missing_source_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = ZipBuilder::create(temp_dir.path().join("out.zip")).unwrap();

        let result = builder.add_entries(vec![Ok(ArchiveEntry::new(
            temp_dir.path().join("gone.txt"),
            "uploads/gone.txt",
        ))]);

        assert!(result.is_err());
    }
}
