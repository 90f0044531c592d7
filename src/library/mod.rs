//! In-memory cache of what the media server believes it has indexed.
//!
//! Holds the section list plus, per section, the set of indexed file
//! paths. Sets are populated lazily (or eagerly before a sweep) from
//! [`MediaServerClient::enumerate_indexed_paths`] and updated
//! optimistically as events are scheduled, which suppresses duplicate
//! enrollments for files seen again within a debounce window.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::errors::ServerError;
use crate::media_server::MediaServerClient;
use crate::models::{MediaKind, Section};
use crate::utils;

/// Cache answer for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Indexed,
    Missing,
    /// The section's set has not been populated; the caller should fall
    /// back to a direct server probe and kick off a background rebuild.
    Unknown,
}

#[derive(Debug, Default)]
struct SectionFiles {
    populated: bool,
    files: HashSet<PathBuf>,
}

#[derive(Default)]
pub struct LibraryIndex {
    sections: RwLock<Vec<Section>>,
    files: RwLock<HashMap<String, SectionFiles>>,
    // Per-section rebuild locks so concurrent populate calls coalesce into
    // one fetch.
    rebuild_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LibraryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_sections(&self, sections: Vec<Section>) {
        *self.sections.write().await = sections;
    }

    pub async fn sections(&self) -> Vec<Section> {
        self.sections.read().await.clone()
    }

    pub async fn section_by_id(&self, section_id: &str) -> Option<Section> {
        self.sections
            .read()
            .await
            .iter()
            .find(|s| s.id == section_id)
            .cloned()
    }

    /// Longest-prefix match of `path` against the union of section roots.
    pub async fn resolve(&self, path: &Path) -> Option<Section> {
        let normalized = utils::normalize_path(path);
        let sections = self.sections.read().await;

        let mut best: Option<&Section> = None;
        let mut best_len = 0usize;
        for section in sections.iter() {
            for root in &section.roots {
                let root = utils::normalize_path(root);
                if normalized.starts_with(&root) {
                    let len = root.as_os_str().len();
                    if len > best_len {
                        best = Some(section);
                        best_len = len;
                    }
                }
            }
        }
        best.cloned()
    }

    pub async fn is_root(&self, section_id: &str, path: &Path) -> bool {
        match self.section_by_id(section_id).await {
            Some(section) => section.is_root(path),
            None => false,
        }
    }

    /// Cache lookup. A hit on an unpopulated set still counts as indexed
    /// (optimistic inserts land before population finishes).
    pub async fn membership(&self, section_id: &str, path: &Path) -> Membership {
        let normalized = utils::normalize_path(path);
        let files = self.files.read().await;
        match files.get(section_id) {
            Some(entry) if entry.files.contains(&normalized) => Membership::Indexed,
            Some(entry) if entry.populated => Membership::Missing,
            _ => Membership::Unknown,
        }
    }

    /// Optimistic insert after scheduling an addition.
    pub async fn insert(&self, section_id: &str, path: &Path) {
        let normalized = utils::normalize_path(path);
        self.files
            .write()
            .await
            .entry(section_id.to_string())
            .or_default()
            .files
            .insert(normalized);
    }

    /// Optimistic removal after confirming a deletion.
    pub async fn remove(&self, section_id: &str, path: &Path) {
        let normalized = utils::normalize_path(path);
        if let Some(entry) = self.files.write().await.get_mut(section_id) {
            entry.files.remove(&normalized);
        }
    }

    /// Populate the section's set if nobody has yet. Concurrent callers
    /// serialize on a per-section lock and only the first one fetches.
    pub async fn ensure_populated(
        &self,
        section: &Section,
        client: &dyn MediaServerClient,
    ) -> Result<(), ServerError> {
        if self.is_populated(&section.id).await {
            return Ok(());
        }

        let lock = self.rebuild_lock(&section.id);
        let _guard = lock.lock().await;
        if self.is_populated(&section.id).await {
            return Ok(());
        }
        self.fetch_and_replace(section, client).await
    }

    /// Unconditionally re-fetch the section's set.
    pub async fn rebuild(
        &self,
        section: &Section,
        client: &dyn MediaServerClient,
    ) -> Result<(), ServerError> {
        let lock = self.rebuild_lock(&section.id);
        let _guard = lock.lock().await;
        self.fetch_and_replace(section, client).await
    }

    async fn fetch_and_replace(
        &self,
        section: &Section,
        client: &dyn MediaServerClient,
    ) -> Result<(), ServerError> {
        let fetched = client.enumerate_indexed_paths(section).await?;
        let count = fetched.len();
        let mut files = self.files.write().await;
        files.insert(
            section.id.clone(),
            SectionFiles {
                populated: true,
                files: fetched,
            },
        );
        info!(
            "Cache initialized for library '{}': {count} files",
            section.title
        );
        Ok(())
    }

    async fn is_populated(&self, section_id: &str) -> bool {
        self.files
            .read()
            .await
            .get(section_id)
            .map(|e| e.populated)
            .unwrap_or(false)
    }

    fn rebuild_lock(&self, section_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.rebuild_locks.lock().unwrap();
        locks
            .entry(section_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop every cached file set. Sections are kept.
    pub async fn clear_files(&self) {
        self.files.write().await.clear();
    }

    /// Per-section cached file counts; `None` for unpopulated sections.
    pub async fn counts(&self) -> Vec<(String, MediaKind, Option<usize>)> {
        let sections = self.sections.read().await;
        let files = self.files.read().await;
        sections
            .iter()
            .map(|section| {
                let count = files
                    .get(&section.id)
                    .filter(|e| e.populated)
                    .map(|e| e.files.len());
                (section.title.clone(), section.kind, count)
            })
            .collect()
    }
}
