use crate::backup::archive_validator::ArchiveLimits;
use crate::backup::database::postgres::PostgresConfig;
use crate::backup::function_path;
use crate::backup::notifications::NotificationConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::retention::RetentionPolicy;
use crate::backup::validate::{validate_sanitized_file_name, validate_writable_dir};
use bon::Builder;
use function_name::named;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

static DEFAULT_RECORD_DB_NAME: &str = "backups.sqlite3";

fn default_trash_dir_name() -> String {
    "trash".to_string()
}

/// Everything the backup core consumes from its host application.
///
/// Loaded from YAML; every nested section has defaults except the directories and the
/// database connection.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct Settings {
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    backup_dir: PathBuf,
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    upload_dir: PathBuf,
    /// SQLite file holding backup records and the schedule, defaults to `<backup_dir>/backups.sqlite3`
    #[builder(into)]
    record_db: Option<PathBuf>,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    retention: RetentionPolicy,
    #[validate(nested)]
    database: PostgresConfig,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    archive_limits: ArchiveLimits,
    /// Name of the upload subtree never included in backups
    #[serde(default = "default_trash_dir_name")]
    #[validate(custom(function = validate_sanitized_file_name))]
    #[builder(default = default_trash_dir_name(), into)]
    trash_dir_name: String,
    #[serde(default)]
    #[builder(default)]
    notifications: Vec<NotificationConfig>,
}

impl Settings {
    #[named]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = File::open(path)
            .map_err(Error::from)
            .and_then(|f| {
                serde_yml::from_reader::<_, Settings>(f)
                    .map_err(Error::from)
                    .add_msg(format!("Parse YAML settings failed: {:?}", path))
            })
            .add_fn_name(function_path!())?;

        settings
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Settings validation failed: {:?}", path))?;

        tracing::info!(
            "Loaded settings from {:?}: backup_dir={:?}, upload_dir={:?}",
            path,
            settings.backup_dir,
            settings.upload_dir
        );
        Ok(settings)
    }

    pub fn record_db_path(&self) -> PathBuf {
        self.record_db
            .clone()
            .unwrap_or_else(|| self.backup_dir.join(DEFAULT_RECORD_DB_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_settings(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("settings.yml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_minimal_settings_applies_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let yaml = format!(
            r#"
backup_dir: {backups:?}
upload_dir: {uploads:?}
database:
  host: db.internal
  port: 5433
  username: app
  dbname: app_production
  password: s3cret
"#,
            backups = temp_dir.path().join("backups"),
            uploads = temp_dir.path().join("uploads"),
        );
        let path = write_settings(&temp_dir, &yaml);

        let settings = Settings::load(&path).unwrap();

        assert!(temp_dir.path().join("backups").is_dir());
        assert_eq!(settings.trash_dir_name(), "trash");
        assert_eq!(*settings.retention().min_count(), 3);
        assert_eq!(*settings.retention().retention_days(), 30);
        assert_eq!(*settings.archive_limits().max_files_in_archive(), 10_000);
        assert_eq!(*settings.database().port(), 5433);
        assert_eq!(*settings.database().dump_timeout(), Duration::from_secs(600));
        assert_eq!(
            settings.record_db_path(),
            temp_dir.path().join("backups").join("backups.sqlite3")
        );
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let temp_dir = TempDir::new().unwrap();
        let yaml = format!(
            "backup_dir: {:?}\nupload_dir: {:?}\nbogus: 1\ndatabase: {{host: h, username: u, dbname: d}}\n",
            temp_dir.path(),
            temp_dir.path()
        );
        let path = write_settings(&temp_dir, &yaml);

        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_trash_name() {
        let temp_dir = TempDir::new().unwrap();
        let yaml = format!(
            "backup_dir: {:?}\nupload_dir: {:?}\ntrash_dir_name: \"a/b\"\ndatabase: {{host: h, username: u, dbname: d}}\n",
            temp_dir.path(),
            temp_dir.path()
        );
        let path = write_settings(&temp_dir, &yaml);

        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("Settings validation failed"));
    }
}
