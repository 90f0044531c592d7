//! Per-file handling of filesystem events.
//!
//! `submit` fans events out to a bounded worker pool and returns
//! immediately. Additions are filtered, membership-checked against the
//! cache (falling back to a direct server probe), optionally
//! health-checked, retry-counted and finally enrolled with the scheduler.
//! Deletions are double-checked against transient mount glitches before
//! they count.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::{EventRepository, StuckFileRepository};
use crate::health::HealthVerifier;
use crate::library::{LibraryIndex, Membership};
use crate::media_server::MediaServerClient;
use crate::models::{ChangeKind, FileEventKind, Section};
use crate::notifications::{colors, Notifier};
use crate::scheduler::ScanScheduler;
use crate::utils;

/// Number of concurrent per-file event tasks.
const EVENT_WORKERS: usize = 4;

/// Grace period before a deletion is believed; renames and network mounts
/// produce delete events for files that are still there.
const DELETION_SETTLE_DELAY: Duration = Duration::from_secs(2);

pub struct EventProcessor {
    config: Arc<Config>,
    index: Arc<LibraryIndex>,
    server: Arc<dyn MediaServerClient>,
    scheduler: Arc<ScanScheduler>,
    health: Arc<HealthVerifier>,
    stuck: StuckFileRepository,
    events: EventRepository,
    notifier: Arc<Notifier>,
    slots: Arc<Semaphore>,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        index: Arc<LibraryIndex>,
        server: Arc<dyn MediaServerClient>,
        scheduler: Arc<ScanScheduler>,
        health: Arc<HealthVerifier>,
        stuck: StuckFileRepository,
        events: EventRepository,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            index,
            server,
            scheduler,
            health,
            stuck,
            events,
            notifier,
            slots: Arc::new(Semaphore::new(EVENT_WORKERS)),
        }
    }

    /// Queue one filesystem event for asynchronous processing.
    pub fn submit(self: &Arc<Self>, kind: FileEventKind, path: std::path::PathBuf) {
        let processor = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = processor.slots.clone().acquire_owned().await else {
                return;
            };
            debug!("Processing {} event for {}", kind.as_str(), path.display());
            match kind {
                FileEventKind::Created | FileEventKind::Moved => {
                    processor.handle_upsert(&path).await
                }
                FileEventKind::Deleted => processor.handle_deletion(&path).await,
            }
        });
    }

    pub(crate) async fn handle_upsert(&self, path: &Path) {
        if self.config.is_ignored(path) || !self.config.is_media_file(path) {
            return;
        }
        if self.config.behaviour.symlink_check && utils::is_broken_symlink(path) {
            debug!("Skipping broken symlink: {}", path.display());
            return;
        }
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.len() == 0 => {
                warn!("Skipping empty file: {}", path.display());
                self.events
                    .append("Corrupt File", &utils::file_name(path), "0 Bytes")
                    .await;
                return;
            }
            Ok(_) => {}
            // The file vanished between the event and now.
            Err(_) => return,
        }

        let Some(section) = self.index.resolve(path).await else {
            warn!("No library section contains path: {}", path.display());
            return;
        };

        if self.is_indexed(&section, path).await {
            if let Err(e) = self.stuck.clear(path).await {
                warn!("Failed to clear stuck entry for {}: {e}", path.display());
            }
            return;
        }

        info!("Found new file: {}", path.display());

        if self.config.behaviour.health_check {
            let report = self.health.check(path).await;
            if !report.is_healthy() {
                self.notifier
                    .send_single(
                        "⚠️ Corrupt File Detected",
                        &format!(
                            "The file failed its health check and will be skipped:\n**{}**",
                            utils::file_name(path)
                        ),
                        colors::RED,
                    )
                    .await;
                return;
            }
        }

        match self.stuck.record_attempt(path).await {
            Ok(true) => {
                warn!(
                    "Giving up on {} after repeated refresh attempts",
                    path.display()
                );
                self.events
                    .append("File Stuck", &path.to_string_lossy(), "Suppressed")
                    .await;
                return;
            }
            Ok(false) => {}
            Err(e) => error!("Failed to record attempt for {}: {e}", path.display()),
        }

        // Visible to later events before the refresh lands, which keeps a
        // burst of events for one file from enrolling it twice.
        self.index.insert(&section.id, path).await;

        let target = section.refresh_target(path);
        self.scheduler.enroll(
            &section.id,
            &target,
            ChangeKind::Added,
            &utils::file_name(path),
            &section.title,
        );
    }

    pub(crate) async fn handle_deletion(&self, path: &Path) {
        if self.config.is_ignored(path) || !self.config.is_media_file(path) {
            return;
        }

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(
                "False positive deletion ignored (file exists): {}",
                path.display()
            );
            return;
        }

        // A vanished scan root means the mount is gone, not the file.
        if let Some(root) = self
            .config
            .roots()
            .iter()
            .find(|root| utils::path_has_prefix(path, root))
        {
            if !tokio::fs::try_exists(root).await.unwrap_or(false) {
                warn!(
                    "Scan root not accessible: {}. Assuming mount failure, ignoring deletion of {}",
                    root.display(),
                    path.display()
                );
                return;
            }
        }

        tokio::time::sleep(DELETION_SETTLE_DELAY).await;
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(
                "False positive deletion ignored (file reappeared): {}",
                path.display()
            );
            return;
        }

        info!("File deleted: {}", path.display());

        let Some(section) = self.index.resolve(path).await else {
            warn!("No library section contains path: {}", path.display());
            return;
        };

        self.index.remove(&section.id, path).await;

        let target = section.refresh_target(path);
        self.scheduler.enroll(
            &section.id,
            &target,
            ChangeKind::Deleted,
            &utils::file_name(path),
            &section.title,
        );
    }

    /// Cache lookup with a direct probe fallback. A cache miss on an
    /// unpopulated section kicks off its population in the background.
    async fn is_indexed(&self, section: &Section, path: &Path) -> bool {
        match self.index.membership(&section.id, path).await {
            Membership::Indexed => true,
            Membership::Missing => false,
            Membership::Unknown => {
                let index = self.index.clone();
                let server = self.server.clone();
                let section_clone = section.clone();
                tokio::spawn(async move {
                    if let Err(e) = index.ensure_populated(&section_clone, server.as_ref()).await {
                        warn!(
                            "Failed to populate cache for '{}': {e}",
                            section_clone.title
                        );
                    }
                });

                match self.server.probe_path(section, path).await {
                    Ok(found) => found,
                    Err(e) => {
                        debug!("Direct check failed for {}: {e}", path.display());
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::database::test_database;
    use crate::errors::ServerError;
    use crate::models::{MediaKind, ServerKind};

    #[derive(Default)]
    struct StubServer {
        indexed: AtomicBool,
    }

    #[async_trait]
    impl MediaServerClient for StubServer {
        fn kind(&self) -> ServerKind {
            ServerKind::Plex
        }

        async fn check_connection(&self) -> Result<String, ServerError> {
            Ok("stub".into())
        }

        async fn list_sections(&self) -> Result<Vec<Section>, ServerError> {
            Ok(Vec::new())
        }

        async fn enumerate_indexed_paths(
            &self,
            _section: &Section,
        ) -> Result<HashSet<PathBuf>, ServerError> {
            Ok(HashSet::new())
        }

        async fn probe_path(&self, _section: &Section, _path: &Path) -> Result<bool, ServerError> {
            Ok(self.indexed.load(Ordering::SeqCst))
        }

        async fn request_refresh(&self, _section_id: &str, _path: &Path) -> Result<(), ServerError> {
            Ok(())
        }

        async fn wait_for_section_idle(
            &self,
            _section_id: &str,
            _timeout: Duration,
        ) -> Result<(), ServerError> {
            Ok(())
        }
    }

    struct Fixture {
        _db_dir: tempfile::TempDir,
        media_dir: tempfile::TempDir,
        processor: Arc<EventProcessor>,
        scheduler: Arc<ScanScheduler>,
        index: Arc<LibraryIndex>,
        stuck: StuckFileRepository,
        server: Arc<StubServer>,
        section: Section,
    }

    impl Fixture {
        /// Populate the section's cache so membership checks do not fall
        /// back to a probe.
        async fn populate(&self) {
            self.index
                .ensure_populated(&self.section, self.server.as_ref())
                .await
                .unwrap();
        }
    }

    async fn fixture() -> Fixture {
        let (db_dir, database) = test_database().await;
        let media_dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.scan.directories = vec![media_dir.path().to_path_buf()];
        config.ignore.patterns = vec!["*.tmp".into(), "sample*".into()];
        config.compile_ignore_globs();
        let config = Arc::new(config);

        let section = Section {
            id: "1".into(),
            title: "Movies".into(),
            kind: MediaKind::Movie,
            roots: vec![media_dir.path().to_path_buf()],
        };
        let index = Arc::new(LibraryIndex::new());
        index.set_sections(vec![section.clone()]).await;

        let server = Arc::new(StubServer::default());
        let notifier = Arc::new(Notifier::new(&config));
        let scheduler = Arc::new(ScanScheduler::new(
            config.clone(),
            server.clone(),
            notifier.clone(),
            database.events(),
        ));
        let health = Arc::new(HealthVerifier::new(config.clone(), database.events()));

        let processor = Arc::new(EventProcessor::new(
            config,
            index.clone(),
            server.clone(),
            scheduler.clone(),
            health,
            database.stuck_files(),
            database.events(),
            notifier,
        ));

        Fixture {
            _db_dir: db_dir,
            media_dir,
            processor,
            scheduler,
            index,
            stuck: database.stuck_files(),
            server,
            section,
        }
    }

    fn create_file(dir: &Path, name: &str) -> PathBuf {
        let folder = dir.join("Movie (2020)");
        std::fs::create_dir_all(&folder).unwrap();
        let path = folder.join(name);
        std::fs::write(&path, b"data").unwrap();
        path
    }

    #[tokio::test]
    async fn new_file_is_enrolled_and_cached() {
        let f = fixture().await;
        f.populate().await;
        let path = create_file(f.media_dir.path(), "movie.mkv");

        f.processor.handle_upsert(&path).await;

        let pending = f.scheduler.pending_snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].added, 1);
        assert_eq!(pending[0].full_path, path.parent().unwrap());
        // Optimistic insert is visible before any refresh happens.
        assert_eq!(
            f.index.membership("1", &path).await,
            Membership::Indexed
        );
        assert_eq!(f.stuck.attempts(&path).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn filtered_files_are_dropped() {
        let f = fixture().await;
        let ignored = create_file(f.media_dir.path(), "sample_movie.mkv");
        let wrong_ext = create_file(f.media_dir.path(), "notes.txt");

        f.processor.handle_upsert(&ignored).await;
        f.processor.handle_upsert(&wrong_ext).await;

        assert!(f.scheduler.pending_snapshot().is_empty());
    }

    #[tokio::test]
    async fn indexed_file_clears_its_stuck_entry() {
        let f = fixture().await;
        let path = create_file(f.media_dir.path(), "movie.mkv");
        f.stuck.record_attempt(&path).await.unwrap();
        f.server.indexed.store(true, Ordering::SeqCst);

        f.processor.handle_upsert(&path).await;

        assert!(f.scheduler.pending_snapshot().is_empty());
        assert_eq!(f.stuck.attempts(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stuck_file_is_suppressed() {
        let f = fixture().await;
        f.populate().await;
        let path = create_file(f.media_dir.path(), "movie.mkv");
        for _ in 0..3 {
            f.stuck.record_attempt(&path).await.unwrap();
        }

        // Fourth sighting crosses max retries: no enrollment.
        f.processor.handle_upsert(&path).await;

        assert!(f.scheduler.pending_snapshot().is_empty());
        assert_eq!(f.stuck.attempts(&path).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn confirmed_deletion_enrolls_the_folder() {
        let f = fixture().await;
        tokio::time::pause();
        let gone = f.media_dir.path().join("Movie (2020)").join("movie.mkv");

        f.processor.handle_deletion(&gone).await;

        let pending = f.scheduler.pending_snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deleted, 1);
        assert_eq!(pending[0].full_path, gone.parent().unwrap());
    }

    #[tokio::test]
    async fn existing_file_is_not_a_deletion() {
        let f = fixture().await;
        tokio::time::pause();
        let path = create_file(f.media_dir.path(), "movie.mkv");

        f.processor.handle_deletion(&path).await;

        assert!(f.scheduler.pending_snapshot().is_empty());
    }

    #[tokio::test]
    async fn unreachable_root_means_mount_failure_not_deletion() {
        let f = fixture().await;
        tokio::time::pause();
        // Tear the "mount" down entirely.
        let root = f.media_dir.path().to_path_buf();
        let gone = root.join("Movie (2020)").join("movie.mkv");
        drop(f.media_dir);
        assert!(!root.exists());

        f.processor.handle_deletion(&gone).await;

        assert!(f.scheduler.pending_snapshot().is_empty());
    }
}
