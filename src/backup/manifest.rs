//! `backup_manifest.json`, the self-description stored inside full backups.

use crate::backup::record::BackupType;
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::io::Read;

pub static MANIFEST_FILE_NAME: &str = "backup_manifest.json";
pub static MANIFEST_VERSION: &str = "1.0";

/// Archive path of the SQL dump inside a full backup.
pub static DATABASE_ENTRY_NAME: &str = "database.sql";
/// Archive root of the upload tree.
pub static UPLOADS_PREFIX: &str = "uploads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Database,
    Uploads,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder, Getters)]
#[getset(get = "pub")]
pub struct BackupManifest {
    backup_type: BackupType,
    created_at: DateTime<Utc>,
    #[builder(into)]
    description: Option<String>,
    components: Vec<Component>,
    #[builder(default = MANIFEST_VERSION.to_string())]
    version: String,
}

impl BackupManifest {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_shape() {
        let manifest = BackupManifest::builder()
            .backup_type(BackupType::Full)
            .created_at(Utc::now())
            .description("before upgrade")
            .components(vec![Component::Database, Component::Uploads])
            .build();

        let value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();

        assert_eq!(value["backup_type"], "full");
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["components"], serde_json::json!(["database", "uploads"]));
        assert_eq!(
            BackupManifest::from_reader(manifest.to_json().unwrap().as_bytes()).unwrap(),
            manifest
        );
    }
}
