//! Daemon façade: owns every subsystem and exposes the operations the
//! collaborators consume (file events, sweeps, health checks, read-only
//! state). The pieces only know each other through this wiring.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{BehaviourConfig, Config};
use crate::database::{Database, EventRepository, StuckFileRepository};
use crate::errors::AppError;
use crate::health::HealthVerifier;
use crate::library::LibraryIndex;
use crate::media_server::MediaServerClient;
use crate::models::{FileEventKind, HealthReport};
use crate::notifications::Notifier;
use crate::processor::EventProcessor;
use crate::scheduler::ScanScheduler;
use crate::sweep::SweepEngine;
use crate::watcher::FileWatcher;

pub struct SyncService {
    config: Arc<Config>,
    database: Database,
    index: Arc<LibraryIndex>,
    server: Arc<dyn MediaServerClient>,
    notifier: Arc<Notifier>,
    health: Arc<HealthVerifier>,
    scheduler: Arc<ScanScheduler>,
    processor: Arc<EventProcessor>,
    sweep: Arc<SweepEngine>,
    watcher_active: Arc<AtomicBool>,
}

impl SyncService {
    pub fn new(config: Config, database: Database, server: Arc<dyn MediaServerClient>) -> Arc<Self> {
        let config = Arc::new(config);
        let index = Arc::new(LibraryIndex::new());
        let notifier = Arc::new(Notifier::new(&config));
        let health = Arc::new(HealthVerifier::new(config.clone(), database.events()));
        let scheduler = Arc::new(ScanScheduler::new(
            config.clone(),
            server.clone(),
            notifier.clone(),
            database.events(),
        ));
        let processor = Arc::new(EventProcessor::new(
            config.clone(),
            index.clone(),
            server.clone(),
            scheduler.clone(),
            health.clone(),
            database.stuck_files(),
            database.events(),
            notifier.clone(),
        ));
        let watcher_active = Arc::new(AtomicBool::new(false));
        let sweep = Arc::new(SweepEngine::new(
            config.clone(),
            index.clone(),
            server.clone(),
            scheduler.clone(),
            health.clone(),
            database.stuck_files(),
            notifier.clone(),
            watcher_active.clone(),
        ));

        Arc::new(Self {
            config,
            database,
            index,
            server,
            notifier,
            health,
            scheduler,
            processor,
            sweep,
            watcher_active,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn index(&self) -> &Arc<LibraryIndex> {
        &self.index
    }

    pub fn server(&self) -> &Arc<dyn MediaServerClient> {
        &self.server
    }

    pub fn scheduler(&self) -> &Arc<ScanScheduler> {
        &self.scheduler
    }

    pub fn health(&self) -> &Arc<HealthVerifier> {
        &self.health
    }

    pub fn events(&self) -> EventRepository {
        self.database.events()
    }

    pub fn stuck_files(&self) -> StuckFileRepository {
        self.database.stuck_files()
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep.is_running()
    }

    pub fn watcher_active(&self) -> bool {
        self.watcher_active.load(Ordering::SeqCst)
    }

    /// Queue one filesystem event; returns immediately.
    pub fn submit_file_event(&self, kind: FileEventKind, path: std::path::PathBuf) {
        self.processor.submit(kind, path);
    }

    /// Kick off a full sweep in the background. Returns `false` when one
    /// is already running.
    pub fn trigger_full_sweep(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> bool {
        if self.sweep.is_running() {
            return false;
        }
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.sweep.run(&shutdown).await {
                error!("Sweep failed: {e}");
            }
        });
        true
    }

    /// Run a sweep to completion; used by the startup and one-shot paths.
    pub async fn run_sweep(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Result<(), AppError> {
        match self.sweep.run(shutdown).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Sweep failed: {e}");
                Err(e)
            }
        }
    }

    /// Targeted one-shot sweep of a directory. Sections are loaded first
    /// so resolution works without a full sweep.
    pub async fn sweep_directory(self: &Arc<Self>, path: &Path) -> Result<(), AppError> {
        self.load_sections().await?;
        let snapshot = self.sweep.sweep_path(path).await?;
        info!(
            "Targeted sweep of {}: {} scanned, {} missing",
            path.display(),
            snapshot.total_scanned,
            snapshot.total_missing
        );
        Ok(())
    }

    pub async fn check_file_health(&self, path: &Path) -> HealthReport {
        self.health.check(path).await
    }

    /// Fetch the section list into the index.
    pub async fn load_sections(&self) -> Result<(), AppError> {
        let sections = self.server.list_sections().await?;
        info!("Loaded {} library sections", sections.len());
        self.index.set_sections(sections).await;
        Ok(())
    }

    /// Start the scheduler tick loop.
    pub fn spawn_scheduler(&self, shutdown: watch::Receiver<bool>) {
        tokio::spawn(self.scheduler.clone().run(shutdown));
    }

    /// Run the live filesystem watcher until shutdown.
    pub async fn run_watcher(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        self.watcher_active.store(true, Ordering::SeqCst);
        let watcher = FileWatcher::new(self.config.clone(), self.processor.clone());
        let result = watcher.run(shutdown).await;
        self.watcher_active.store(false, Ordering::SeqCst);
        result
    }

    /// Periodic sweep loop: every `run_interval` hours, optionally
    /// anchored to `start_time` on a daily grid.
    pub async fn run_schedule(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let schedule = sweep_schedule(&self.config.behaviour);
        let mut next_run = next_occurrence(&schedule, self.config.behaviour.run_interval);
        info!(
            "Will run every {} hours; next sweep at {}",
            self.config.behaviour.run_interval,
            next_run.format("%Y-%m-%d %H:%M:%S")
        );

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if Local::now() >= next_run {
                        if !self.trigger_full_sweep(shutdown.clone()) {
                            warn!("Scheduled sweep skipped: previous sweep still running");
                        }
                        next_run = next_occurrence(&schedule, self.config.behaviour.run_interval);
                        info!("Next sweep at {}", next_run.format("%Y-%m-%d %H:%M:%S"));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Build the cron schedule for anchored sweeps: `start_time + k * run_interval`
/// wrapped over the day. Returns `None` without a valid anchor, in which
/// case plain interval arithmetic is used.
fn sweep_schedule(behaviour: &BehaviourConfig) -> Option<Schedule> {
    let start_time = behaviour.start_time.as_deref()?.trim();
    if start_time.is_empty() {
        return None;
    }

    let (hour_str, minute_str) = start_time.split_once(':')?;
    let (start_hour, minute) = match (hour_str.parse::<u32>(), minute_str.parse::<u32>()) {
        (Ok(h), Ok(m)) if h < 24 && m < 60 => (h, m),
        _ => {
            warn!("Invalid start_time '{start_time}', falling back to interval scheduling");
            return None;
        }
    };

    let interval = behaviour.run_interval.clamp(1, 24);
    let mut hours: Vec<u32> = (0..24)
        .step_by(interval as usize)
        .map(|offset| (start_hour + offset) % 24)
        .collect();
    hours.sort_unstable();
    hours.dedup();

    let hour_list = hours
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let expression = format!("0 {minute} {hour_list} * * *");
    match Schedule::from_str(&expression) {
        Ok(schedule) => Some(schedule),
        Err(e) => {
            warn!("Failed to build sweep schedule '{expression}': {e}");
            None
        }
    }
}

fn next_occurrence(schedule: &Option<Schedule>, run_interval: u32) -> DateTime<Local> {
    schedule
        .as_ref()
        .and_then(|s| s.upcoming(Local).next())
        .unwrap_or_else(|| Local::now() + chrono::Duration::hours(run_interval.max(1) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn behaviour(start_time: Option<&str>, run_interval: u32) -> BehaviourConfig {
        let mut behaviour = BehaviourConfig::default();
        behaviour.start_time = start_time.map(|s| s.to_string());
        behaviour.run_interval = run_interval;
        behaviour
    }

    #[test]
    fn anchored_schedule_wraps_over_the_day() {
        let schedule = sweep_schedule(&behaviour(Some("02:30"), 6)).unwrap();
        // Anchored at 02:30 every 6 hours: 02, 08, 14, 20.
        let hits: Vec<u32> = schedule
            .upcoming(Local)
            .take(4)
            .map(|t| t.hour())
            .collect();
        let mut sorted = hits.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![2, 8, 14, 20]);
        assert!(schedule.upcoming(Local).take(8).all(|t| t.minute() == 30));
    }

    #[test]
    fn invalid_or_missing_start_time_falls_back_to_interval() {
        assert!(sweep_schedule(&behaviour(None, 6)).is_none());
        assert!(sweep_schedule(&behaviour(Some(""), 6)).is_none());
        assert!(sweep_schedule(&behaviour(Some("25:00"), 6)).is_none());
        assert!(sweep_schedule(&behaviour(Some("abc"), 6)).is_none());

        let next = next_occurrence(&None, 6);
        let lower = Local::now() + chrono::Duration::hours(5);
        let upper = Local::now() + chrono::Duration::hours(7);
        assert!(next > lower && next < upper);
    }

    #[test]
    fn daily_interval_runs_once_a_day() {
        let schedule = sweep_schedule(&behaviour(Some("04:00"), 24)).unwrap();
        let hits: Vec<u32> = schedule
            .upcoming(Local)
            .take(2)
            .map(|t| t.hour())
            .collect();
        assert_eq!(hits, vec![4, 4]);
    }
}
