use clap::{Parser, Subcommand};
use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use safekeep::backup::archive_validator::ArchiveValidator;
use safekeep::backup::orchestrator::{default_clock, BackupOrchestrator};
use safekeep::backup::record::store::SqliteRecordStore;
use safekeep::backup::record::{BackupRecord, BackupType};
use safekeep::backup::restore::RestoreOrchestrator;
use safekeep::backup::result_error::error::Error;
use safekeep::backup::result_error::result::Result;
use safekeep::backup::result_error::AddMsg;
use safekeep::backup::schedule::scheduler::{BackupScheduler, FullBackupJob};
use safekeep::backup::schedule::SchedulePreset;
use safekeep::backup::settings::Settings;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::Level;

/// Backup, restore and retention for the application's database and uploads
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of settings file
    #[arg(short, long, global = true, default_value = "safekeep.yml")]
    config: PathBuf,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print results as a JSON envelope
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup
    Backup {
        #[arg(value_parser = parse_backup_type)]
        backup_type: BackupType,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List, preview or run restores
    Restore {
        #[command(subcommand)]
        action: RestoreAction,
    },
    /// Re-hash a backup and compare it with its record
    Verify { id: i64 },
    /// Apply the retention policy
    Cleanup {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Show or change the periodic backup schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Check an archive against the upload security rules
    Validate { path: PathBuf },
    /// Store an externally produced backup file
    Upload {
        file: PathBuf,
        #[arg(long)]
        uploaded_by: String,
    },
    /// Arm the persisted schedule and run until killed
    Daemon,
}

#[derive(Subcommand, Debug)]
enum RestoreAction {
    List {
        #[arg(long = "type", value_parser = parse_backup_type)]
        backup_type: Option<BackupType>,
    },
    Preview {
        id: i64,
    },
    Restore {
        id: i64,
        confirm_code: String,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    Show,
    Set {
        #[arg(value_parser = parse_preset)]
        preset: SchedulePreset,
        /// HH:MM, 24h, UTC
        #[arg(long)]
        time: Option<String>,
        /// mon, tue, ... (weekly only)
        #[arg(long)]
        day: Option<String>,
    },
    /// Run the scheduled job once, now
    Run,
}

fn parse_backup_type(s: &str) -> std::result::Result<BackupType, String> {
    s.parse()
}

fn parse_preset(s: &str) -> std::result::Result<SchedulePreset, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

/// Human readable text plus the JSON payload merged into the envelope.
struct Output {
    text: String,
    payload: Value,
}

impl Output {
    fn new<T: Serialize>(text: String, payload: &T) -> Result<Self> {
        Ok(Self {
            text,
            payload: serde_json::to_value(payload)?,
        })
    }
}

fn describe_record(record: &BackupRecord) -> String {
    format!(
        "#{:<5} {:<8} {:<15} {:>12} bytes  {}  {}",
        record.id(),
        record.backup_type(),
        record.status(),
        record.size_bytes(),
        record.created_at().format("%Y-%m-%d %H:%M:%S"),
        record.file_name()
    )
}

fn run(args: &Args) -> Result<Output> {
    let settings = Settings::load(&args.config)?;
    match &args.command {
        Command::Backup {
            backup_type,
            description,
        } => {
            let orchestrator = BackupOrchestrator::from_settings(&settings)?;
            let record = orchestrator.create_backup(*backup_type, description.as_deref())?;
            Output::new(
                format!("Created backup {}", describe_record(&record)),
                &json!({ "backup": record }),
            )
        }
        Command::Restore { action } => {
            let restorer = RestoreOrchestrator::from_settings(&settings)?;
            match action {
                RestoreAction::List { backup_type } => {
                    let records = restorer
                        .backups()
                        .list_backups()?
                        .into_iter()
                        .filter(|r| backup_type.map_or(true, |t| *r.backup_type() == t))
                        .collect_vec();
                    Output::new(
                        records.iter().map(describe_record).join("\n"),
                        &json!({ "backups": records }),
                    )
                }
                RestoreAction::Preview { id } => {
                    let preview = restorer.preview_restore(*id)?;
                    let text = std::iter::once(format!(
                        "Backup #{} ({}, {} days old, {} bytes)",
                        preview.backup_id, preview.backup_type, preview.age_days, preview.size_bytes
                    ))
                    .chain(preview.warnings.iter().map(|w| format!("warning: {w}")))
                    .chain(std::iter::once(format!(
                        "Confirm with: restore restore {} {}",
                        preview.backup_id, preview.confirmation_token
                    )))
                    .join("\n");
                    Output::new(text, &json!({ "preview": preview }))
                }
                RestoreAction::Restore { id, confirm_code } => {
                    let result = restorer.execute_restore(*id, confirm_code)?;
                    Output::new(
                        format!(
                            "Restored backup #{}, safety backup #{}",
                            result.backup_id, result.safety_backup_id
                        ),
                        &json!({ "restore": result }),
                    )
                }
            }
        }
        Command::Verify { id } => {
            let result = BackupOrchestrator::from_settings(&settings)?.verify_backup(*id)?;
            Output::new(
                format!(
                    "Backup #{} {} (status {})",
                    result.backup_id,
                    if result.verified { "verified" } else { "FAILED verification" },
                    result.status
                ),
                &json!({ "verify": result }),
            )
        }
        Command::Cleanup { dry_run } => {
            let orchestrator = BackupOrchestrator::from_settings(&settings)?;
            if *dry_run {
                let status = orchestrator.retention_status()?;
                Output::new(
                    format!(
                        "{} backup(s), {} protected, {} eligible for deletion (cutoff {})",
                        status.total,
                        status.protected_by_count,
                        status.eligible_for_deletion,
                        status.cutoff
                    ),
                    &json!({ "retention": status }),
                )
            } else {
                let report = orchestrator.cleanup_old_backups()?;
                Output::new(
                    format!(
                        "Deleted {} backup(s), {} orphan file(s), kept {}",
                        report.tracked_deleted.len(),
                        report.orphans_deleted.len(),
                        report.retained.len()
                    ),
                    &json!({ "cleanup": report, "total_deleted": report.total_deleted() }),
                )
            }
        }
        Command::Schedule { action } => {
            let scheduler = scheduler(&settings)?;
            let view = match action {
                ScheduleAction::Show => scheduler.start()?,
                ScheduleAction::Set { preset, time, day } => {
                    scheduler.update_schedule(*preset, time.as_deref(), day.as_deref())?
                }
                ScheduleAction::Run => {
                    scheduler.run_now()?;
                    scheduler.get_schedule()?
                }
            };
            scheduler.shutdown();
            Output::new(
                format!(
                    "Schedule {} at {}{}, next run {}, last run {}",
                    view.config.preset(),
                    view.config.time_of_day(),
                    view.config
                        .day_of_week()
                        .as_deref()
                        .map(|d| format!(" on {d}"))
                        .unwrap_or_default(),
                    view.next_run_at
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "never".to_string()),
                    view.config
                        .last_run_status()
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "never".to_string()),
                ),
                &json!({ "schedule": view }),
            )
        }
        Command::Validate { path } => {
            let report = ArchiveValidator::new(settings.archive_limits().clone()).validate_path(path);
            let text = match report.violation() {
                Some(v) => format!("REJECTED ({} rule): {}", v.rule(), v),
                None => format!(
                    "OK: {} file(s), ratio {:.1}, {} warning(s)",
                    report.file_count(),
                    report.compression_ratio(),
                    report.warnings().len()
                ),
            };
            let output = Output::new(text, &json!({ "validation": report }))?;
            report.into_result()?;
            Ok(output)
        }
        Command::Upload { file, uploaded_by } => {
            let record = RestoreOrchestrator::from_settings(&settings)?
                .process_uploaded_backup(file, uploaded_by)?;
            Output::new(
                format!("Stored upload as {}", describe_record(&record)),
                &json!({ "backup": record }),
            )
        }
        Command::Daemon => {
            let scheduler = scheduler(&settings)?;
            let view = scheduler.start()?;
            tracing::info!(
                "Daemon running, schedule {} next at {:?}",
                view.config.preset(),
                view.next_run_at
            );
            loop {
                std::thread::park();
            }
        }
    }
}

fn scheduler(settings: &Settings) -> Result<BackupScheduler> {
    let store = SqliteRecordStore::open(settings.record_db_path())
        .add_msg("Failed to open schedule store")?;
    let pool = ThreadPoolBuilder::new()
        .num_threads(1)
        .thread_name(|i| format!("safekeep-job-{i}"))
        .build()?;
    Ok(BackupScheduler::new(
        Arc::new(store),
        default_clock(),
        Arc::new(FullBackupJob::new(settings.clone())),
        Arc::new(pool),
    ))
}

fn one_line(error: &Error) -> String {
    error
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .join(" ")
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.quiet { Level::WARN } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let code = match run(&args) {
        Ok(output) => {
            if args.json {
                let mut envelope = json!({ "success": true });
                if let (Some(envelope), Value::Object(payload)) =
                    (envelope.as_object_mut(), output.payload)
                {
                    envelope.extend(payload);
                }
                println!("{envelope}");
            } else if !output.text.is_empty() {
                println!("{}", output.text);
            }
            0
        }
        Err(e) => {
            tracing::debug!("{e}");
            if args.json {
                let mut envelope = json!({ "success": false, "error": one_line(&e) });
                if let Some(id) = e.safety_backup_id() {
                    envelope["safety_backup_id"] = json!(id);
                }
                println!("{envelope}");
            } else {
                eprintln!("error: {}", one_line(&e));
            }
            if e.is_interrupted() {
                130
            } else {
                1
            }
        }
    };
    exit(code);
}
