//! # safekeep
//!
//! Backup and restore for an application's persistent state: PostgreSQL dumps,
//! upload-tree archives and combined "full" backups.
//!
//! ## Features
//!
//! - **Backups**: `pg_dump` driven database dumps, DEFLATE ZIP upload archives, full bundles with a manifest
//! - **Integrity**: SHA-256 checksums recorded at creation and re-verified on demand
//! - **Restore**: preview, confirmation token, safety backup before every destructive step
//! - **Retention**: count-protected recent backups, age-based expiry and orphan file sweep
//! - **Scheduling**: a single periodic job (every 6/12 hours, daily, weekly)
//! - **Archive validation**: zip-bomb, path traversal, prohibited type and nested archive checks
//!
//! ## Quick Start
//!
//! ```no_run
//! use safekeep::backup::orchestrator::BackupOrchestrator;
//! use safekeep::backup::settings::Settings;
//!
//! let settings = Settings::load("settings.yml")?;
//! let orchestrator = BackupOrchestrator::from_settings(&settings)?;
//! let record = orchestrator.create_full_backup(Some("before upgrade"))?;
//! println!("created backup {} ({} bytes)", record.id(), record.size_bytes());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
