//! Arms at most one periodic backup job from the persisted schedule.

use crate::backup::function_path;
use crate::backup::notifications::notify_all;
use crate::backup::orchestrator::BackupOrchestrator;
use crate::backup::record::store::ScheduleStore;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDebugObjectAndFnName;
use crate::backup::schedule::trigger::Trigger;
use crate::backup::schedule::{ScheduleConfig, SchedulePreset, ScheduleView};
use crate::backup::settings::Settings;
use chrono::{DateTime, Utc};
use function_name::named;
use mockable::Clock;
use rayon::ThreadPool;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Work done on every scheduled fire.
pub trait ScheduledJob: Send + Sync {
    /// One-line summary of what the run did.
    fn run(&self) -> Result<String>;
}

/// Full backup followed by retention cleanup, reported through the configured notifications.
///
/// Every run opens its own record store and orchestrator from the settings.
pub struct FullBackupJob {
    settings: Settings,
}

impl FullBackupJob {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn backup_and_cleanup(&self) -> Result<String> {
        let orchestrator = BackupOrchestrator::from_settings(&self.settings)?;
        let record = orchestrator.create_full_backup(Some("Scheduled backup"))?;
        let cleanup = orchestrator.cleanup_old_backups()?;
        Ok(format!(
            "Created full backup {} ({} bytes), removed {} old backup(s)",
            record.id(),
            record.size_bytes(),
            cleanup.total_deleted()
        ))
    }
}

impl ScheduledJob for FullBackupJob {
    fn run(&self) -> Result<String> {
        let outcome = self.backup_and_cleanup();
        let (topic, msg) = match &outcome {
            Ok(summary) => ("Scheduled backup succeeded", summary.clone()),
            Err(e) => ("Scheduled backup failed", e.to_string()),
        };
        if let Err(e) = notify_all(self.settings.notifications(), topic, &msg) {
            tracing::warn!("Failed to send backup notification: {}", e);
        }
        outcome
    }
}

struct Shared {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    job: Arc<dyn ScheduledJob>,
    /// Serializes read-modify-write of the stored config
    config_lock: Mutex<()>,
}

impl Shared {
    fn load(&self) -> Result<ScheduleConfig> {
        Ok(self.store.load_schedule()?.unwrap_or_default())
    }

    /// Runs the job and records the outcome. Failures are logged, never returned.
    fn execute(&self) -> Option<ScheduleConfig> {
        let started_at = self.clock.utc();
        tracing::info!("Starting scheduled backup at {}", started_at);
        let outcome = self.job.run();
        match &outcome {
            Ok(summary) => tracing::info!("Scheduled backup finished: {}", summary),
            Err(e) => tracing::error!("Scheduled backup failed: {}", e),
        }

        let _guard = lock(&self.config_lock);
        let recorded = self.load().and_then(|mut config| {
            config.record_run(started_at, outcome.map(|_| ()).map_err(|e| e.to_string()));
            self.store.save_schedule(&config)?;
            Ok(config)
        });
        match recorded {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::error!("Failed to record scheduled run: {}", e);
                None
            }
        }
    }
}

struct ArmedJob {
    trigger: Trigger,
    cancel: Sender<()>,
    timer: JoinHandle<()>,
}

pub struct BackupScheduler {
    shared: Arc<Shared>,
    pool: Arc<ThreadPool>,
    armed: Mutex<Option<ArmedJob>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackupScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
        job: Arc<dyn ScheduledJob>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                clock,
                job,
                config_lock: Mutex::new(()),
            }),
            pool,
            armed: Mutex::new(None),
        }
    }

    /// Re-arms the persisted schedule if it is enabled.
    pub fn start(&self) -> Result<ScheduleView> {
        let config = self.shared.load()?;
        let now = self.shared.clock.utc();
        let mut armed = lock(&self.armed);
        disarm(armed.take());
        if *config.enabled() {
            if let Some(trigger) = Trigger::from_config(&config, now)? {
                tracing::info!("Re-arming {} backup schedule", config.preset());
                *armed = Some(self.arm(trigger));
            }
        } else {
            tracing::info!("Backup schedule is disabled, nothing to arm");
        }
        Ok(view(config, armed.as_ref(), now))
    }

    /// Validates the inputs, persists the new schedule and replaces any armed job.
    #[named]
    pub fn update_schedule(
        &self,
        preset: SchedulePreset,
        time_of_day: Option<&str>,
        day_of_week: Option<&str>,
    ) -> Result<ScheduleView> {
        let now = self.shared.clock.utc();
        let config = ScheduleConfig::validated(preset, time_of_day, day_of_week)
            .add_debug_object_and_fn_name(preset, function_path!())?;
        let trigger = Trigger::from_config(&config, now)?;

        // Held across persist and re-arm: stored config and armed job change together.
        let mut armed = lock(&self.armed);
        let config = {
            let _guard = lock(&self.shared.config_lock);
            let config = config.with_last_run_of(&self.shared.load()?);
            self.shared.store.save_schedule(&config)?;
            config
        };

        disarm(armed.take());
        if let Some(trigger) = trigger {
            *armed = Some(self.arm(trigger));
        }
        tracing::info!(
            "Backup schedule set to {} at {}",
            config.preset(),
            config.time_of_day()
        );
        Ok(view(config, armed.as_ref(), now))
    }

    pub fn get_schedule(&self) -> Result<ScheduleView> {
        let config = self.shared.load()?;
        let armed = lock(&self.armed);
        Ok(view(config, armed.as_ref(), self.shared.clock.utc()))
    }

    /// Runs the job on the calling thread with the same bookkeeping as a scheduled fire.
    pub fn run_now(&self) -> Result<ScheduleConfig> {
        self.shared
            .execute()
            .ok_or_else(|| Error::validation("scheduled run could not be recorded"))
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.armed).is_some()
    }

    /// Disarms the job and waits for the timer thread to exit.
    pub fn shutdown(&self) {
        disarm(lock(&self.armed).take());
    }

    fn arm(&self, trigger: Trigger) -> ArmedJob {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let pool = self.pool.clone();
        let timer_trigger = trigger.clone();

        let timer = std::thread::spawn(move || {
            let mut last_fire: Option<DateTime<Utc>> = None;
            loop {
                let now = shared.clock.utc();
                let from = last_fire.map_or(now, |fired| fired.max(now));
                let Some(next) = timer_trigger.next_after(from) else {
                    tracing::warn!("Schedule has no future fire time, timer stopping");
                    return;
                };
                tracing::info!("Sleeping until {next}");
                let wait = (next - now).to_std().unwrap_or_default();
                match cancelled.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {
                        last_fire = Some(next);
                        let shared = shared.clone();
                        pool.spawn(move || {
                            shared.execute();
                        });
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        tracing::debug!("Schedule timer cancelled");
                        return;
                    }
                }
            }
        });

        ArmedJob {
            trigger,
            cancel,
            timer,
        }
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn disarm(armed: Option<ArmedJob>) {
    if let Some(job) = armed {
        let _ = job.cancel.send(());
        if job.timer.join().is_err() {
            tracing::error!("Schedule timer thread panicked");
        }
    }
}

fn view(config: ScheduleConfig, armed: Option<&ArmedJob>, now: DateTime<Utc>) -> ScheduleView {
    ScheduleView {
        next_run_at: armed.and_then(|a| a.trigger.next_after(now)),
        config,
    }
}
