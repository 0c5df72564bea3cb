use crate::backup::archive::{archive_name, ArchiveEntry, ArchiveEntryIterable};
use crate::backup::function_path;
use crate::backup::manifest::UPLOADS_PREFIX;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};

use bon::Builder;
use function_name::named;
use getset::Getters;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::{DirEntry, WalkDir};

use std::path::{Path, PathBuf};

/// Regular files of the upload directory, minus the trash subtree, placed under `uploads/`.
///
/// Symlinks are not followed, so nothing outside the upload directory ends up in a backup.
#[derive(Clone, Debug, Builder, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct UploadTreeSource {
    #[builder(into)]
    src_dir: PathBuf,
    #[builder(into, default = UPLOADS_PREFIX.to_string())]
    dst_prefix: String,
    #[builder(into)]
    trash_dir_name: String,
}

impl UploadTreeSource {
    fn exclusions(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in [
            self.trash_dir_name.clone(),
            format!("{}/**", self.trash_dir_name),
        ] {
            builder.add(
                GlobBuilder::new(&pattern)
                    .literal_separator(true)
                    .build()?,
            );
        }
        Ok(builder.build()?)
    }

    /// Number of regular files a backup of this tree would contain.
    pub fn count_files(&self) -> Result<usize> {
        self.archive_entry_iterator()?
            .try_fold(0usize, |count, entry| entry.map(|_| count + 1))
    }
}

impl ArchiveEntryIterable for UploadTreeSource {
    #[named]
    fn archive_entry_iterator(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + Send>> {
        if !self.src_dir.is_dir() {
            tracing::error!(
                "Upload directory does not exist or is not a directory: {:?}",
                self.src_dir
            );
            return Err(Error::from(std::io::Error::other(format!(
                "{:?} is not a directory",
                self.src_dir
            )))
            .add_fn_name(function_path!()));
        }

        tracing::debug!(
            "Scanning upload directory {:?}, excluding {:?}",
            self.src_dir,
            self.trash_dir_name
        );

        let exclusions = self.exclusions().add_fn_name(function_path!())?;
        let src_dir = self.src_dir.clone();
        let prune_dir = src_dir.clone();
        let prune_exclusions = exclusions.clone();
        let dst_prefix = self.dst_prefix.clone();

        let entries = WalkDir::new(&self.src_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |de| !is_excluded(de, &prune_dir, &prune_exclusions))
            .filter_map(move |res| match res {
                Ok(de) => process_dir_entry(de, &src_dir, &dst_prefix, &exclusions),
                Err(e) => Some(Err(e.into())),
            })
            .map(move |res| res.add_fn_name(function_path!()));

        Ok(Box::new(entries))
    }
}

fn is_excluded(de: &DirEntry, base_dir: &Path, exclusions: &GlobSet) -> bool {
    de.path()
        .strip_prefix(base_dir)
        .map(|relative| !relative.as_os_str().is_empty() && exclusions.is_match(relative))
        .unwrap_or(false)
}

fn process_dir_entry(
    de: DirEntry,
    base_dir: &Path,
    dst_prefix: &str,
    exclusions: &GlobSet,
) -> Option<Result<ArchiveEntry>> {
    if !de.file_type().is_file() {
        tracing::trace!("Skipping {:?}, not a regular file", de.path());
        return None;
    }

    let path = de.into_path();
    let res = match path.strip_prefix(base_dir) {
        Ok(relative) if exclusions.is_match(relative) => {
            tracing::trace!("Skipping {:?}, excluded", path);
            return None;
        }
        Ok(relative) => Ok(archive_name(dst_prefix, relative)),
        Err(e) => Err(Error::from(e).add_msg(format!(
            "Stripping {:?} from {:?} failed",
            base_dir, path
        ))),
    };

    Some(res.map(|dst| {
        tracing::trace!("Including file: {:?} -> {:?}", path, dst);
        ArchiveEntry::new(path, dst)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use tempfile::TempDir;

    fn create_test_files(dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir.join("avatars"))?;
        std::fs::create_dir_all(dir.join("trash/old"))?;
        std::fs::write(dir.join("a.txt"), "0123456789")?;
        std::fs::write(dir.join("avatars/me.png"), "png")?;
        std::fs::write(dir.join("trash/b.txt"), "trash")?;
        std::fs::write(dir.join("trash/old/c.txt"), "older")?;
        std::fs::write(dir.join("trashcan.txt"), "kept")?;
        Ok(())
    }

    fn source(dir: &Path) -> UploadTreeSource {
        UploadTreeSource::builder()
            .src_dir(dir)
            .trash_dir_name("trash")
            .build()
    }

    #[test]
    fn test_trash_subtree_excluded() {
        let temp_dir = TempDir::new().unwrap();
        create_test_files(temp_dir.path()).unwrap();

        let names: Vec<String> = source(temp_dir.path())
            .archive_entry_iterator()
            .unwrap()
            .map(|e| e.unwrap().dst)
            .sorted()
            .collect();

        assert_eq!(
            names,
            vec!["uploads/a.txt", "uploads/avatars/me.png", "uploads/trashcan.txt"]
        );
    }

    #[test]
    fn test_entry_sources_exist() {
        let temp_dir = TempDir::new().unwrap();
        create_test_files(temp_dir.path()).unwrap();

        for entry in source(temp_dir.path()).archive_entry_iterator().unwrap() {
            assert!(entry.unwrap().src.is_file());
        }
        assert_eq!(source(temp_dir.path()).count_files().unwrap(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "a").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link")).unwrap();

        let names: Vec<String> = source(temp_dir.path())
            .archive_entry_iterator()
            .unwrap()
            .map(|e| e.unwrap().dst)
            .collect();

        assert_eq!(names, vec!["uploads/a.txt"]);
    }

    #[test]
    fn test_nonexistent_directory() {
        assert!(source(Path::new("/nonexistent/uploads"))
            .archive_entry_iterator()
            .is_err());
    }
}
