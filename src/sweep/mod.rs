//! Full-tree reconciliation sweep.
//!
//! Walks every configured root in parallel, compares what is on disk with
//! what the server has indexed, and force-enrolls one refresh per missing
//! `(section, folder)` pair. A mass-deletion guard aborts the dispatch
//! phase when the sweep finds suspiciously many missing items, which is
//! what a dropped mount looks like.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Instant, SystemTime};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::database::StuckFileRepository;
use crate::errors::AppError;
use crate::health::HealthVerifier;
use crate::library::{LibraryIndex, Membership};
use crate::media_server::{self, MediaServerClient};
use crate::models::{RunStats, RunStatsSnapshot, Section};
use crate::notifications::{colors, format_file_list, Embed, Notifier};
use crate::scheduler::ScanScheduler;
use crate::utils;

type PendingSet = Arc<StdMutex<BTreeSet<(String, PathBuf)>>>;

pub struct SweepEngine {
    config: Arc<Config>,
    index: Arc<LibraryIndex>,
    server: Arc<dyn MediaServerClient>,
    scheduler: Arc<ScanScheduler>,
    health: Arc<HealthVerifier>,
    stuck: StuckFileRepository,
    notifier: Arc<Notifier>,
    watcher_active: Arc<AtomicBool>,
    running: AtomicBool,
}

impl SweepEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        index: Arc<LibraryIndex>,
        server: Arc<dyn MediaServerClient>,
        scheduler: Arc<ScanScheduler>,
        health: Arc<HealthVerifier>,
        stuck: StuckFileRepository,
        notifier: Arc<Notifier>,
        watcher_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            index,
            server,
            scheduler,
            health,
            stuck,
            notifier,
            watcher_active,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one full sweep. Single-flight: a second call while one is in
    /// progress is ignored.
    pub async fn run(
        self: &Arc<Self>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<RunStatsSnapshot, AppError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Sweep already in progress, skipping");
            return Ok(RunStatsSnapshot::default());
        }

        let result = self.run_inner(shutdown).await;

        self.running.store(false, Ordering::SeqCst);
        // Without a live watcher nothing keeps the cache fresh, so holding
        // onto it would only pin memory.
        if !self.watcher_active.load(Ordering::SeqCst) {
            self.index.clear_files().await;
        }
        result
    }

    async fn run_inner(
        self: &Arc<Self>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<RunStatsSnapshot, AppError> {
        let started = Instant::now();
        self.index.clear_files().await;
        info!("Cache cleared for new sweep");

        media_server::connect(self.server.as_ref(), false).await?;

        let sections = self.server.list_sections().await?;
        self.index.set_sections(sections.clone()).await;
        for section in &sections {
            if let Err(e) = self.index.rebuild(section, self.server.as_ref()).await {
                error!("Error caching library '{}': {e}", section.title);
            }
        }

        let stats = Arc::new(RunStats::new());
        let pending: PendingSet = Arc::new(StdMutex::new(BTreeSet::new()));
        let slots = Arc::new(Semaphore::new(self.config.behaviour.scan_workers.max(1)));

        for root in self.config.roots() {
            if *shutdown.borrow() {
                info!("Stop requested, aborting sweep walk");
                break;
            }
            self.walk_root(root, &stats, &pending, &slots).await;
        }

        let snapshot = stats.snapshot();

        if self.config.behaviour.abort_on_mass_deletion
            && snapshot.total_missing > self.config.behaviour.deletion_threshold
        {
            let threshold = self.config.behaviour.deletion_threshold;
            self.notifier
                .send(abort_embed(snapshot.total_missing, threshold))
                .await;
            return Err(AppError::MassDeletion {
                missing: snapshot.total_missing,
                threshold,
            });
        }

        if snapshot.total_missing > 0 {
            // Dispatches serialize per section behind the scheduler's
            // locks; the summary is not held back waiting on them.
            let handles = self.dispatch_pending(&pending);
            self.notifier
                .send(pending_embed(&snapshot, handles.len()))
                .await;
        }

        self.notifier
            .send(summary_embed(&snapshot, started.elapsed().as_secs()))
            .await;
        info!(
            "Sweep finished: {} scanned, {} missing in {}s",
            snapshot.total_scanned,
            snapshot.total_missing,
            started.elapsed().as_secs()
        );
        Ok(snapshot)
    }

    /// Targeted sweep of one directory; used by the manual scan path.
    /// Sections must already be loaded into the index.
    pub async fn sweep_path(self: &Arc<Self>, path: &Path) -> Result<RunStatsSnapshot, AppError> {
        let stats = Arc::new(RunStats::new());
        let pending: PendingSet = Arc::new(StdMutex::new(BTreeSet::new()));

        self.walk_subtree(path.to_path_buf(), stats.clone(), pending.clone())
            .await;

        let snapshot = stats.snapshot();
        if snapshot.total_missing > 0 {
            // One-shot callers exit right after, so wait for the
            // refreshes to be issued.
            for handle in self.dispatch_pending(&pending) {
                let _ = handle.await;
            }
        }
        Ok(snapshot)
    }

    /// Walk one configured root: immediate child directories fan out
    /// across the worker pool, files sitting at the root level are
    /// handled inline.
    async fn walk_root(
        self: &Arc<Self>,
        root: &Path,
        stats: &Arc<RunStats>,
        pending: &PendingSet,
        slots: &Arc<Semaphore>,
    ) {
        info!("Sweeping directory: {}", root.display());
        if !root.is_dir() {
            let message = format!("Directory not found: {}", root.display());
            error!("{message}");
            stats.add_error(message);
            return;
        }

        let mut children = match std::fs::read_dir(root) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect::<Vec<_>>(),
            Err(e) => {
                let message = format!("Error accessing {}: {e}", root.display());
                error!("{message}");
                stats.add_error(message);
                return;
            }
        };
        children.sort();

        let mut handles = Vec::new();
        for child in children {
            if utils::file_name(&child).starts_with('.') || self.config.is_ignored(&child) {
                continue;
            }
            if child.is_dir() {
                let engine = self.clone();
                let stats = stats.clone();
                let pending = pending.clone();
                let slots = slots.clone();
                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = slots.acquire_owned().await else {
                        return;
                    };
                    engine.walk_subtree(child, stats, pending).await;
                }));
            } else {
                self.process_file(&child, stats, pending).await;
            }
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Sweep worker panicked: {e}");
            }
        }
    }

    async fn walk_subtree(self: &Arc<Self>, dir: PathBuf, stats: Arc<RunStats>, pending: PendingSet) {
        let config = self.config.clone();
        let files = tokio::task::spawn_blocking(move || collect_media_files(&config, &dir))
            .await
            .unwrap_or_default();

        for file in files {
            if let Some(delay) = self.config.scan_delay() {
                tokio::time::sleep(delay).await;
            }
            self.process_file(&file, &stats, &pending).await;
        }
    }

    async fn process_file(&self, path: &Path, stats: &Arc<RunStats>, pending: &PendingSet) {
        if self.config.behaviour.symlink_check && utils::is_broken_symlink(path) {
            stats.increment_broken_symlinks();
            return;
        }
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.len() == 0 => {
                stats.add_corrupt_item(path);
                return;
            }
            Ok(_) => {}
            Err(_) => return,
        }

        stats.increment_scanned();

        let Some(section) = self.index.resolve(path).await else {
            debug!("No library section contains path: {}", path.display());
            return;
        };

        if self.is_indexed(&section, path).await {
            if let Err(e) = self.stuck.clear(path).await {
                warn!("Failed to clear stuck entry for {}: {e}", path.display());
            }
            return;
        }

        if self.config.behaviour.health_check {
            let report = self.health.check(path).await;
            if !report.is_healthy() {
                stats.add_corrupt_item(path);
                return;
            }
        }

        match self.stuck.record_attempt(path).await {
            Ok(true) => {
                stats.add_stuck_item(path);
                return;
            }
            Ok(false) => {}
            Err(e) => error!("Failed to record attempt for {}: {e}", path.display()),
        }

        stats.add_missing_item(&section.title, path);
        let target = section.refresh_target(path);
        pending
            .lock()
            .unwrap()
            .insert((section.id.clone(), target));
    }

    async fn is_indexed(&self, section: &Section, path: &Path) -> bool {
        match self.index.membership(&section.id, path).await {
            Membership::Indexed => true,
            Membership::Missing => false,
            // Pre-caching failed for this section; ask the server directly.
            Membership::Unknown => self
                .server
                .probe_path(section, path)
                .await
                .unwrap_or(false),
        }
    }

    /// Force-enroll every pending pair in path-sorted order; the
    /// scheduler's per-section locks serialize the actual refreshes.
    fn dispatch_pending(&self, pending: &PendingSet) -> Vec<tokio::task::JoinHandle<()>> {
        let mut folders: Vec<(String, PathBuf)> =
            pending.lock().unwrap().iter().cloned().collect();
        folders.sort_by(|a, b| a.1.cmp(&b.1));

        folders
            .into_iter()
            .map(|(section_id, target)| self.scheduler.force_refresh(&section_id, &target))
            .collect()
    }
}

/// Blocking walk of one subtree. Directories matching an ignore pattern or
/// starting with a dot are pruned entirely. With incremental scanning on,
/// files inside directories colder than the cutoff are skipped while the
/// walk still descends into their children.
fn collect_media_files(config: &Config, dir: &Path) -> Vec<PathBuf> {
    let cutoff = if config.behaviour.incremental_scan {
        SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(
                config.behaviour.scan_since_days * 86_400,
            ))
    } else {
        None
    };

    let mut cold_dirs: HashSet<PathBuf> = HashSet::new();
    let mut files = Vec::new();

    let walker = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if entry.depth() > 0 && name.starts_with('.') {
                return false;
            }
            !config.is_ignored(entry.path())
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Walk error under {}: {e}", dir.display());
                continue;
            }
        };

        if entry.file_type().is_dir() {
            if let Some(cutoff) = cutoff {
                let mtime = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok());
                if let Some(mtime) = mtime {
                    if mtime < cutoff {
                        cold_dirs.insert(entry.path().to_path_buf());
                    }
                }
            }
            continue;
        }

        let path = entry.path();
        if let Some(parent) = path.parent() {
            if cold_dirs.contains(parent) {
                continue;
            }
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if !config.is_media_file(path) || config.is_ignored(path) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    files
}

fn abort_embed(missing: u64, threshold: u64) -> Embed {
    Embed::new(
        "🚨 Scan Aborted",
        format!(
            "Mass deletion guard tripped: found **{missing}** missing items, \
             more than the threshold of **{threshold}**.\n\
             No refreshes were issued. If this is expected, raise \
             `deletion_threshold` or disable `abort_on_mass_deletion`."
        ),
        colors::RED,
    )
}

fn pending_embed(snapshot: &RunStatsSnapshot, folders: usize) -> Embed {
    let est_seconds = folders as u64 * 10;
    let est = if est_seconds >= 60 {
        format!("{}m {}s", est_seconds / 60, est_seconds % 60)
    } else {
        format!("{est_seconds}s")
    };

    let mut embed = Embed::new(
        "🔍 Scan Started",
        format!(
            "Refreshing **{folders}** folders for missing items.\nEstimated time: **{est}**"
        ),
        colors::ORANGE,
    )
    .field(
        "📊 Overview",
        format!("Found **{}** missing items.", snapshot.total_missing),
        false,
    );

    for (library, items) in &snapshot.missing_items {
        let names: Vec<String> = items.iter().map(|p| utils::file_name(p)).collect();
        embed = embed.field(
            format!("📁 {library} ({} items)", items.len()),
            format_file_list(&names, 10, "• ", ""),
            false,
        );
    }
    embed
}

fn summary_embed(snapshot: &RunStatsSnapshot, elapsed_secs: u64) -> Embed {
    let mut embed = Embed::new(
        "📊 Scan Summary",
        format!(
            "**Scan Complete**\nFound **{}** missing items\nScanned **{}** total files",
            snapshot.total_missing, snapshot.total_scanned
        ),
        colors::BLUE,
    );

    if snapshot.broken_symlinks > 0 {
        embed = embed.field(
            "⚠️ Issues Detected",
            format!("Broken Symlinks Skipped: **{}**", snapshot.broken_symlinks),
            false,
        );
    }
    if !snapshot.stuck_items.is_empty() {
        let names: Vec<String> = snapshot
            .stuck_items
            .iter()
            .map(|p| utils::file_name(p))
            .collect();
        embed = embed.field(
            format!("⛔ Stuck Files ({})", names.len()),
            format_file_list(&names, 10, "! ", ""),
            false,
        );
    }
    if !snapshot.corrupt_items.is_empty() {
        let names: Vec<String> = snapshot
            .corrupt_items
            .iter()
            .map(|p| utils::file_name(p))
            .collect();
        embed = embed.field(
            format!("💀 Corrupt/Empty Files ({})", names.len()),
            format_file_list(&names, 10, "x ", ""),
            false,
        );
    }
    for (library, items) in &snapshot.missing_items {
        embed = embed.field(
            format!("📁 {library}"),
            format!("Found: **{}** items", items.len()),
            true,
        );
    }

    embed.footer(format!(
        "{} • Run Time: {elapsed_secs}s",
        crate::notifications::FOOTER_TEXT
    ))
}
