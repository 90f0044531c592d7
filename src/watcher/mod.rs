//! Filesystem watcher adapter.
//!
//! Bridges `notify` backend callbacks onto the event processor. The
//! native backend is the default; the polling backend works better on
//! network mounts where inotify events never arrive.

use std::path::PathBuf;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::AppError;
use crate::models::FileEventKind;
use crate::processor::EventProcessor;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

enum WatchBackend {
    Recommended(RecommendedWatcher),
    Poll(PollWatcher),
}

impl WatchBackend {
    fn watch(&mut self, path: &std::path::Path) -> notify::Result<()> {
        match self {
            WatchBackend::Recommended(watcher) => watcher.watch(path, RecursiveMode::Recursive),
            WatchBackend::Poll(watcher) => watcher.watch(path, RecursiveMode::Recursive),
        }
    }
}

/// Map a notify event onto the daemon's event model. Only the rename
/// destination is forwarded; the source side arrives as a remove event on
/// backends that emit one.
fn convert_event(event: Event) -> Option<(FileEventKind, Vec<PathBuf>)> {
    let kind = match event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => FileEventKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
            FileEventKind::Moved
        }
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => FileEventKind::Deleted,
        _ => return None,
    };
    if event.paths.is_empty() {
        return None;
    }
    Some((kind, event.paths))
}

pub struct FileWatcher {
    config: std::sync::Arc<Config>,
    processor: std::sync::Arc<EventProcessor>,
}

impl FileWatcher {
    pub fn new(
        config: std::sync::Arc<Config>,
        processor: std::sync::Arc<EventProcessor>,
    ) -> Self {
        Self { config, processor }
    }

    /// Watch every configured root until the stop signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(FileEventKind, PathBuf)>();

        let handler = move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if let Some((kind, paths)) = convert_event(event) {
                    for path in paths {
                        let _ = tx.send((kind, path));
                    }
                }
            }
            Err(e) => error!("Watcher error: {e}"),
        };

        let mut backend = if self.config.behaviour.use_polling {
            info!("Using polling watcher (CPU intensive, but better for network mounts)");
            let watcher_config = notify::Config::default().with_poll_interval(POLL_INTERVAL);
            WatchBackend::Poll(
                PollWatcher::new(handler, watcher_config)
                    .map_err(|e| AppError::transient(format!("failed to start watcher: {e}")))?,
            )
        } else {
            info!("Using native filesystem watcher");
            WatchBackend::Recommended(
                RecommendedWatcher::new(handler, notify::Config::default())
                    .map_err(|e| AppError::transient(format!("failed to start watcher: {e}")))?,
            )
        };

        let mut watched = 0usize;
        for root in self.config.roots() {
            if root.is_dir() {
                backend
                    .watch(root)
                    .map_err(|e| {
                        AppError::transient(format!("failed to watch {}: {e}", root.display()))
                    })?;
                info!("Watching directory: {}", root.display());
                watched += 1;
            } else {
                warn!("Directory not found, cannot watch: {}", root.display());
            }
        }
        if watched == 0 {
            warn!("No paths available to watch");
            return Ok(());
        }

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some((kind, path)) => {
                            // Directory creations are uninteresting; their
                            // files produce their own events.
                            if kind != FileEventKind::Deleted && path.is_dir() {
                                continue;
                            }
                            self.processor.submit(kind, path);
                        }
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("File watcher stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_remove_events_map_to_file_events() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/m/a.mkv"));
        let (kind, paths) = convert_event(event).unwrap();
        assert_eq!(kind, FileEventKind::Created);
        assert_eq!(paths, vec![PathBuf::from("/m/a.mkv")]);

        let event = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/m/a.mkv"));
        assert_eq!(convert_event(event).unwrap().0, FileEventKind::Deleted);
    }

    #[test]
    fn rename_destination_maps_to_moved() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from("/m/b.mkv"));
        assert_eq!(convert_event(event).unwrap().0, FileEventKind::Moved);
    }

    #[test]
    fn metadata_and_data_changes_are_dropped() {
        let event = Event::new(EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content,
        )))
        .add_path(PathBuf::from("/m/a.mkv"));
        assert!(convert_event(event).is_none());

        let event = Event::new(EventKind::Access(notify::event::AccessKind::Open(
            notify::event::AccessMode::Read,
        )))
        .add_path(PathBuf::from("/m/a.mkv"));
        assert!(convert_event(event).is_none());
    }
}
