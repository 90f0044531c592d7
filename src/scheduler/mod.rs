//! Debounced, folder-keyed refresh scheduling.
//!
//! Events enroll `(section, target)` keys into a pending map; a 1 s tick
//! loop collects keys whose debounce window has elapsed, emits one grouped
//! notification for the batch and hands each key to a bounded dispatch
//! pool. Dispatch holds a per-section lock across the refresh request and
//! the wait-for-idle poll, so at most one refresh per section is ever in
//! flight while sections proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::EventRepository;
use crate::media_server::{MediaServerClient, SECTION_IDLE_TIMEOUT};
use crate::models::{ChangeKind, PendingFolder, PendingScan};
use crate::notifications::{colors, format_file_list, Embed, Notifier};
use crate::utils;

/// How many folders a bulk notification lists before eliding.
const BULK_FOLDER_LIMIT: usize = 20;
/// How many files a single-folder notification lists per direction.
const FILE_LIST_LIMIT: usize = 10;

/// Number of concurrent dispatch tasks.
const DISPATCH_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub section_id: String,
    pub target: PathBuf,
}

pub struct ScanScheduler {
    config: Arc<Config>,
    server: Arc<dyn MediaServerClient>,
    notifier: Arc<Notifier>,
    events: EventRepository,
    pending: StdMutex<HashMap<PendingKey, PendingFolder>>,
    section_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    dispatch_slots: Arc<Semaphore>,
}

impl ScanScheduler {
    pub fn new(
        config: Arc<Config>,
        server: Arc<dyn MediaServerClient>,
        notifier: Arc<Notifier>,
        events: EventRepository,
    ) -> Self {
        Self {
            config,
            server,
            notifier,
            events,
            pending: StdMutex::new(HashMap::new()),
            section_locks: StdMutex::new(HashMap::new()),
            dispatch_slots: Arc::new(Semaphore::new(DISPATCH_WORKERS)),
        }
    }

    /// Enroll one changed file under its `(section, target)` key. Every
    /// enrollment for the same key refreshes the debounce clock and appends
    /// to the matching change list.
    pub fn enroll(
        &self,
        section_id: &str,
        target: &Path,
        change: ChangeKind,
        file_name: &str,
        library_title: &str,
    ) {
        let key = PendingKey {
            section_id: section_id.to_string(),
            target: utils::normalize_path(target),
        };

        let mut pending = self.pending.lock().unwrap();
        let entry = pending.entry(key).or_insert_with(|| PendingFolder {
            last_event: Instant::now(),
            added: Vec::new(),
            deleted: Vec::new(),
            library_title: library_title.to_string(),
        });
        entry.last_event = Instant::now();
        if entry.library_title.is_empty() {
            entry.library_title = library_title.to_string();
        }
        match change {
            ChangeKind::Added => entry.added.push(file_name.to_string()),
            ChangeKind::Deleted => entry.deleted.push(file_name.to_string()),
        }
        info!("Scan queued (debouncing): {}", target.display());
    }

    /// Bypass the debounce window and dispatch immediately. Used by sweeps
    /// and manual triggers; no grouped notification is emitted.
    pub fn force_refresh(self: &Arc<Self>, section_id: &str, target: &Path) -> JoinHandle<()> {
        self.spawn_dispatch(PendingKey {
            section_id: section_id.to_string(),
            target: utils::normalize_path(target),
        })
    }

    /// Background tick loop; runs until the stop signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting scan scheduler (1s tick, {}s debounce)",
            self.config.behaviour.scan_debounce
        );
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scan scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One scheduler pass: remove every key whose debounce has elapsed,
    /// notify once for the batch, dispatch each key.
    pub(crate) async fn tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let debounce = self.config.debounce();
        let ready: Vec<(PendingKey, PendingFolder)> = {
            let mut pending = self.pending.lock().unwrap();
            let now = Instant::now();
            let due: Vec<PendingKey> = pending
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_event) >= debounce)
                .map(|(key, _)| key.clone())
                .collect();
            due.into_iter()
                .filter_map(|key| pending.remove_entry(&key))
                .collect()
        };

        if ready.is_empty() {
            return Vec::new();
        }

        self.notify_ready(&ready).await;
        ready
            .into_iter()
            .map(|(key, _)| self.spawn_dispatch(key))
            .collect()
    }

    fn spawn_dispatch(self: &Arc<Self>, key: PendingKey) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = scheduler.dispatch_slots.clone().acquire_owned().await else {
                return;
            };
            scheduler.dispatch(&key.section_id, &key.target).await;
        })
    }

    /// Issue the refresh. The per-section lock is held across the request
    /// and the idle wait, serializing refreshes within a section. A failed
    /// dispatch is not re-enrolled; the next event for the folder is.
    async fn dispatch(&self, section_id: &str, target: &Path) {
        if self.config.behaviour.dry_run {
            info!("[DRY RUN] Would trigger scan for: {}", target.display());
            return;
        }

        let lock = self.section_lock(section_id);
        let _guard = lock.lock().await;

        match self.server.request_refresh(section_id, target).await {
            Ok(()) => {
                self.events
                    .append(
                        "Scan Triggered",
                        &target.to_string_lossy(),
                        self.server.kind().label(),
                    )
                    .await;
                if let Err(e) = self
                    .server
                    .wait_for_section_idle(section_id, SECTION_IDLE_TIMEOUT)
                    .await
                {
                    warn!("Error waiting for section {section_id} to settle: {e}");
                }
            }
            Err(e) => {
                error!(
                    "Failed to trigger {} scan for {}: {e}",
                    self.server.kind().label(),
                    target.display()
                );
            }
        }
    }

    fn section_lock(&self, section_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.section_locks.lock().unwrap();
        locks
            .entry(section_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn notify_ready(&self, ready: &[(PendingKey, PendingFolder)]) {
        let with_changes: Vec<&(PendingKey, PendingFolder)> = ready
            .iter()
            .filter(|(_, entry)| !entry.added.is_empty() || !entry.deleted.is_empty())
            .collect();

        match with_changes.as_slice() {
            [] => {}
            [(key, entry)] => {
                self.notifier.send(folder_embed(key, entry)).await;
            }
            many => {
                self.notifier.send(bulk_embed(many)).await;
            }
        }
    }

    /// Read-only view of the queue for the stats endpoint.
    pub fn pending_snapshot(&self) -> Vec<PendingScan> {
        let debounce = self.config.debounce();
        let pending = self.pending.lock().unwrap();
        let now = Instant::now();
        pending
            .iter()
            .map(|(key, entry)| PendingScan {
                section_id: key.section_id.clone(),
                path: utils::file_name(&key.target),
                full_path: key.target.clone(),
                remaining_secs: debounce
                    .saturating_sub(now.duration_since(entry.last_event))
                    .as_secs(),
                added: entry.added.len(),
                deleted: entry.deleted.len(),
            })
            .collect()
    }
}

fn change_color(added: usize, deleted: usize) -> u32 {
    match (added > 0, deleted > 0) {
        (true, true) => colors::GOLD,
        (true, false) => colors::GREEN,
        (false, true) => colors::RED,
        (false, false) => colors::BLUE,
    }
}

fn folder_embed(key: &PendingKey, entry: &PendingFolder) -> Embed {
    let library = if entry.library_title.is_empty() {
        "Unknown Library"
    } else {
        entry.library_title.as_str()
    };
    let folder = utils::display_folder_name(&key.target);

    let mut embed = Embed::new(
        format!("📂 Update: {library}"),
        format!("Changes detected in **{folder}**"),
        change_color(entry.added.len(), entry.deleted.len()),
    );
    if !entry.added.is_empty() {
        embed = embed.field(
            format!("✅ Added ({})", entry.added.len()),
            format_file_list(&entry.added, FILE_LIST_LIMIT, "+ ", "diff"),
            false,
        );
    }
    if !entry.deleted.is_empty() {
        embed = embed.field(
            format!("🗑️ Deleted ({})", entry.deleted.len()),
            format_file_list(&entry.deleted, FILE_LIST_LIMIT, "- ", "diff"),
            false,
        );
    }
    embed
}

fn bulk_embed(ready: &[&(PendingKey, PendingFolder)]) -> Embed {
    let added: usize = ready.iter().map(|(_, e)| e.added.len()).sum();
    let deleted: usize = ready.iter().map(|(_, e)| e.deleted.len()).sum();

    let mut description = format!("Changes detected across **{}** folders", ready.len());
    if ready.len() > BULK_FOLDER_LIMIT {
        description.push_str(&format!("\nShowing the first {BULK_FOLDER_LIMIT}"));
    }

    let mut embed = Embed::new(
        "📦 Bulk Update",
        description,
        change_color(added, deleted),
    );
    for (key, entry) in ready.iter().take(BULK_FOLDER_LIMIT) {
        let library = if entry.library_title.is_empty() {
            "Unknown Library".to_string()
        } else {
            entry.library_title.clone()
        };
        embed = embed.field(
            format!("📁 {}", utils::display_folder_name(&key.target)),
            format!(
                "{library} · Added: **{}** · Deleted: **{}**",
                entry.added.len(),
                entry.deleted.len()
            ),
            false,
        );
    }
    embed
}
