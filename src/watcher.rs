//! # File System Watcher
//!
//! Change notifications for share directories. The share engine consumes a
//! stream of [`FsEvent`]s and registers directories one at a time through the
//! [`WatchSource`] trait, so recursion is under the engine's control: every
//! subdirectory found at startup or created later gets its own watch.
//!
//! [`NotifyWatcher`] is the `notify`-backed implementation used by the node.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of the channel between the notify thread and the engine.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Types of file change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeType {
    Created,
    Modified,
    Removed,
}

/// A path changed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FileChangeType,
}

/// Registration half of a change-notification source.
pub trait WatchSource: Send {
    fn add_watch(&mut self, path: &Path) -> Result<(), notify::Error>;
    fn remove_watch(&mut self, path: &Path) -> Result<(), notify::Error>;
    fn watched_paths(&self) -> usize;
    /// Drop every registration.
    fn release(&mut self);
}

pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

impl NotifyWatcher {
    /// Create a watcher and the stream its events are delivered on.
    pub fn new() -> Result<(Self, mpsc::Receiver<FsEvent>), notify::Error> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let Some(kind) = event_kind_to_change_type(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    if let Err(e) = event_tx.blocking_send(FsEvent { path, kind }) {
                        error!("Failed to send file event: {}", e);
                        return;
                    }
                }
            }
            Err(e) => warn!("File system watch error: {}", e),
        })?;

        Ok((
            Self {
                watcher,
                watched: HashSet::new(),
            },
            event_rx,
        ))
    }
}

impl WatchSource for NotifyWatcher {
    fn add_watch(&mut self, path: &Path) -> Result<(), notify::Error> {
        if self.watched.contains(path) {
            return Ok(());
        }
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        self.watched.insert(path.to_path_buf());
        debug!("Watching {}", path.display());
        Ok(())
    }

    fn remove_watch(&mut self, path: &Path) -> Result<(), notify::Error> {
        let nested: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|watched| watched.starts_with(path))
            .cloned()
            .collect();

        for watched in nested {
            self.watched.remove(&watched);
            // The directory is usually gone already, in which case the OS
            // dropped the watch on its own.
            if let Err(e) = self.watcher.unwatch(&watched) {
                debug!("Unwatch {}: {}", watched.display(), e);
            }
        }
        Ok(())
    }

    fn watched_paths(&self) -> usize {
        self.watched.len()
    }

    fn release(&mut self) {
        let count = self.watched.len();
        for path in self.watched.drain() {
            let _ = self.watcher.unwatch(&path);
        }
        info!("Released {} watch(es)", count);
    }
}

/// Convert notify EventKind to our FileChangeType
pub fn event_kind_to_change_type(kind: &EventKind) -> Option<FileChangeType> {
    match kind {
        EventKind::Create(_) => Some(FileChangeType::Created),
        EventKind::Modify(_) => Some(FileChangeType::Modified),
        EventKind::Remove(_) => Some(FileChangeType::Removed),
        _ => None,
    }
}
