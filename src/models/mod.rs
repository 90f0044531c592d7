use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which remote indexing server the daemon talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Plex,
    Jellyfin,
    Emby,
}

impl Default for ServerKind {
    fn default() -> Self {
        ServerKind::Plex
    }
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Plex => "plex",
            ServerKind::Jellyfin => "jellyfin",
            ServerKind::Emby => "emby",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServerKind::Plex => "Plex",
            ServerKind::Jellyfin => "Jellyfin",
            ServerKind::Emby => "Emby",
        }
    }
}

/// Broad classification of a library section's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Show,
    Other,
}

impl MediaKind {
    /// Plex native section types: `movie`, `show`, `artist`, `photo`, ...
    pub fn from_plex(section_type: &str) -> Self {
        match section_type {
            "movie" => MediaKind::Movie,
            "show" => MediaKind::Show,
            _ => MediaKind::Other,
        }
    }

    /// Jellyfin/Emby `CollectionType` values: `movies`, `tvshows`, `music`, ...
    pub fn from_collection_type(collection_type: &str) -> Self {
        match collection_type {
            "movies" => MediaKind::Movie,
            "tvshows" => MediaKind::Show,
            _ => MediaKind::Other,
        }
    }
}

/// A logical media library on the remote server with one or more
/// filesystem roots. Immutable between section refreshes.
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub kind: MediaKind,
    pub roots: Vec<PathBuf>,
}

impl Section {
    /// True iff `path` equals one of this section's root directories.
    pub fn is_root(&self, path: &Path) -> bool {
        let normalized = crate::utils::normalize_path(path);
        self.roots
            .iter()
            .any(|root| crate::utils::normalize_path(root) == normalized)
    }

    /// The path a refresh for `file_path` should target: the parent folder,
    /// or the file itself when the parent is a flat section root.
    pub fn refresh_target(&self, file_path: &Path) -> PathBuf {
        match file_path.parent() {
            Some(parent) if self.is_root(parent) => file_path.to_path_buf(),
            Some(parent) => parent.to_path_buf(),
            None => file_path.to_path_buf(),
        }
    }
}

/// Filesystem event kinds delivered by the watcher or webhook ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Moved,
    Deleted,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Created => "created",
            FileEventKind::Moved => "moved",
            FileEventKind::Deleted => "deleted",
        }
    }
}

/// Direction of a change collected into a pending folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
}

/// Pending debounce entry for one `(section, target)` key. The entry exists
/// exactly while the key is enrolled for dispatch.
#[derive(Debug)]
pub struct PendingFolder {
    pub last_event: Instant,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub library_title: String,
}

/// Read-only view of a pending entry, for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PendingScan {
    pub section_id: String,
    pub path: String,
    pub full_path: PathBuf,
    pub remaining_secs: u64,
    pub added: usize,
    pub deleted: usize,
}

/// Persistent retry counter row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StuckFile {
    pub path: String,
    pub attempts: i64,
    pub last_seen: DateTime<Utc>,
}

/// Append-only event log row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub details: String,
    pub status: String,
}

/// Health verifier verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Corrupt,
    Timeout,
    Ignored,
    Error,
}

/// Outcome of one file-health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub file: String,
    pub verdict: HealthVerdict,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.verdict == HealthVerdict::Healthy
    }
}

/// Counters accumulated over one full sweep. Shared across walk workers.
#[derive(Debug, Default)]
pub struct RunStats {
    inner: Mutex<RunStatsInner>,
}

#[derive(Debug, Default)]
struct RunStatsInner {
    missing_items: HashMap<String, Vec<PathBuf>>,
    stuck_items: Vec<PathBuf>,
    corrupt_items: Vec<PathBuf>,
    errors: Vec<String>,
    total_scanned: u64,
    total_missing: u64,
    broken_symlinks: u64,
}

/// Immutable copy of the counters, taken once the walk has finished.
#[derive(Debug, Clone, Default)]
pub struct RunStatsSnapshot {
    pub missing_items: HashMap<String, Vec<PathBuf>>,
    pub stuck_items: Vec<PathBuf>,
    pub corrupt_items: Vec<PathBuf>,
    pub errors: Vec<String>,
    pub total_scanned: u64,
    pub total_missing: u64,
    pub broken_symlinks: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_missing_item(&self, library_title: &str, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .missing_items
            .entry(library_title.to_string())
            .or_default()
            .push(path.to_path_buf());
        inner.total_missing += 1;
    }

    pub fn add_stuck_item(&self, path: &Path) {
        self.inner.lock().unwrap().stuck_items.push(path.to_path_buf());
    }

    pub fn add_corrupt_item(&self, path: &Path) {
        self.inner.lock().unwrap().corrupt_items.push(path.to_path_buf());
    }

    pub fn add_error(&self, error: impl Into<String>) {
        self.inner.lock().unwrap().errors.push(error.into());
    }

    pub fn increment_scanned(&self) {
        self.inner.lock().unwrap().total_scanned += 1;
    }

    pub fn increment_broken_symlinks(&self) {
        self.inner.lock().unwrap().broken_symlinks += 1;
    }

    pub fn total_missing(&self) -> u64 {
        self.inner.lock().unwrap().total_missing
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        let inner = self.inner.lock().unwrap();
        RunStatsSnapshot {
            missing_items: inner.missing_items.clone(),
            stuck_items: inner.stuck_items.clone(),
            corrupt_items: inner.corrupt_items.clone(),
            errors: inner.errors.clone(),
            total_scanned: inner.total_scanned,
            total_missing: inner.total_missing,
            broken_symlinks: inner.broken_symlinks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_mapping() {
        assert_eq!(MediaKind::from_plex("movie"), MediaKind::Movie);
        assert_eq!(MediaKind::from_plex("show"), MediaKind::Show);
        assert_eq!(MediaKind::from_plex("artist"), MediaKind::Other);
        assert_eq!(MediaKind::from_collection_type("movies"), MediaKind::Movie);
        assert_eq!(MediaKind::from_collection_type("tvshows"), MediaKind::Show);
        assert_eq!(MediaKind::from_collection_type("music"), MediaKind::Other);
    }

    #[test]
    fn refresh_target_is_parent_unless_parent_is_a_root() {
        let section = Section {
            id: "1".into(),
            title: "Movies".into(),
            kind: MediaKind::Movie,
            roots: vec![PathBuf::from("/movies")],
        };
        // Normal layout: refresh the containing folder.
        assert_eq!(
            section.refresh_target(Path::new("/movies/Heat (1995)/heat.mkv")),
            PathBuf::from("/movies/Heat (1995)")
        );
        // Flat layout: refresh the file so the whole root is not rescanned.
        assert_eq!(
            section.refresh_target(Path::new("/movies/solo.mkv")),
            PathBuf::from("/movies/solo.mkv")
        );
        assert!(section.is_root(Path::new("/movies/")));
        assert!(!section.is_root(Path::new("/movies/Heat (1995)")));
    }

    #[test]
    fn run_stats_accumulates_across_threads() {
        let stats = std::sync::Arc::new(RunStats::new());
        let mut handles = Vec::new();
        for i in 0..4 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                let path = PathBuf::from(format!("/m/file{i}.mkv"));
                stats.add_missing_item("Movies", &path);
                stats.increment_scanned();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_missing, 4);
        assert_eq!(snapshot.total_scanned, 4);
        assert_eq!(snapshot.missing_items["Movies"].len(), 4);
    }
}
