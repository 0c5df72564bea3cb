//! ZIP artifacts: what goes into them and how they come back out.

pub mod extract;
pub mod upload_tree;
pub mod zip_builder;

use crate::backup::result_error::result::Result;
use itertools::Itertools;
use std::path::{Component, Path};
use std::sync::Arc;

/// A single file to be written into an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Source file on the filesystem
    pub src: Arc<Path>,
    /// Entry name inside the archive, always `/`-separated
    pub dst: String,
}

impl ArchiveEntry {
    pub fn new<A: Into<Arc<Path>>, S: Into<String>>(src: A, dst: S) -> ArchiveEntry {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

/// Produces the entries of one archive source.
pub trait ArchiveEntryIterable {
    fn archive_entry_iterator(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + Send>>;
}

/// Joins the normal components of a relative path with `/` below `prefix`.
pub fn archive_name<P: AsRef<Path>>(prefix: &str, relative: P) -> String {
    let tail = relative
        .as_ref()
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .join("/");
    format!("{prefix}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_archive_entry_creation() {
        let src = PathBuf::from("/srv/uploads/file.txt");

        let entry = ArchiveEntry::new(src.clone(), "uploads/file.txt");

        assert_eq!(entry.src.as_ref(), src.as_path());
        assert_eq!(entry.dst, "uploads/file.txt");
    }

    #[test]
    fn test_archive_name_uses_forward_slashes() {
        assert_eq!(
            archive_name("uploads/", Path::new("a").join("b").join("c.txt")),
            "uploads/a/b/c.txt"
        );
        assert_eq!(archive_name("uploads/", "./x.txt"), "uploads/x.txt");
    }
}
