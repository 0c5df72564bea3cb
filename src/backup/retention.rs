use crate::backup::file_ext::FileExtProvider;
use crate::backup::record::BackupType;
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Duration, Utc};
use getset::Getters;
use globset::{Glob, GlobSet, GlobSetBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use validator::Validate;

fn default_min_count() -> usize {
    3
}

fn default_retention_days() -> u32 {
    30
}

/// Two-tier retention: the `min_count` newest backups are always kept, the rest expire
/// after `retention_days`. A nonzero `max_count` additionally caps how many are kept.
#[derive(Clone, Validate, Serialize, Deserialize, Debug, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct RetentionPolicy {
    #[serde(default = "default_min_count")]
    #[builder(default = default_min_count())]
    min_count: usize,
    #[serde(default = "default_retention_days")]
    #[validate(range(min = 1))]
    #[builder(default = default_retention_days())]
    retention_days: u32,
    /// 0 means unlimited
    #[serde(default)]
    #[builder(default)]
    max_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionReason {
    ProtectedByCount,
    WithinRetentionWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    OlderThanRetentionWindow,
    ExceedsMaxCount,
}

#[derive(Clone, Hash, Eq, PartialEq)]
pub struct ItemWithDateTime<R> {
    pub item: R,
    pub date_time: DateTime<Utc>,
}

impl<R> From<(R, DateTime<Utc>)> for ItemWithDateTime<R> {
    fn from(value: (R, DateTime<Utc>)) -> Self {
        Self {
            item: value.0,
            date_time: value.1,
        }
    }
}

impl<R: Debug> Debug for ItemWithDateTime<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{}", self.item, self.date_time)
    }
}

#[derive(Debug)]
pub struct RetentionPlan<R> {
    pub cutoff: DateTime<Utc>,
    pub keep: Vec<(ItemWithDateTime<R>, RetentionReason)>,
    pub delete: Vec<(ItemWithDateTime<R>, DeletionReason)>,
}

impl RetentionPolicy {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.retention_days))
    }

    /// Splits items into kept and deletable ones. Items are ranked newest first; ties keep
    /// the order they were given in.
    ///
    /// Every item counts toward `min_count` regardless of what it holds, so recent failed
    /// records take protected slots ahead of older artifacts.
    pub fn plan<R, I>(&self, items: I, now: DateTime<Utc>) -> RetentionPlan<R>
    where
        I: IntoIterator<Item = ItemWithDateTime<R>>,
    {
        let cutoff = self.cutoff(now);
        let mut plan = RetentionPlan {
            cutoff,
            keep: Vec::new(),
            delete: Vec::new(),
        };

        for (rank, item) in items
            .into_iter()
            .sorted_by_key(|i| Reverse(i.date_time))
            .enumerate()
        {
            if rank < self.min_count {
                plan.keep.push((item, RetentionReason::ProtectedByCount));
            } else if item.date_time < cutoff {
                plan.delete
                    .push((item, DeletionReason::OlderThanRetentionWindow));
            } else if self.max_count > 0 && rank >= self.max_count {
                plan.delete.push((item, DeletionReason::ExceedsMaxCount));
            } else {
                plan.keep.push((item, RetentionReason::WithinRetentionWindow));
            }
        }

        plan
    }
}

/// File-name patterns of artifacts this crate writes into the backup directory.
///
/// Used by the orphan sweep: a file matching one of these with no backup record is assumed to
/// be left over from a crashed or externally deleted backup.
pub fn artifact_globset() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for backup_type in BackupType::ALL {
        let pattern = format!("{}_*.{}", backup_type.artifact_prefix(), backup_type.file_ext());
        builder.add(Glob::new(&pattern)?);
        builder.add(Glob::new(&format!("{pattern}.tmp"))?);
    }
    builder.add(Glob::new("uploaded_*")?);
    Ok(builder.build()?)
}

pub fn is_backup_artifact_name<P: AsRef<Path>>(globset: &GlobSet, path: P) -> bool {
    path.as_ref()
        .file_name()
        .map(|name| globset.is_match(Path::new(name)))
        .unwrap_or(false)
}
