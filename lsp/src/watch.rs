//! Watched-file forwarding.
//!
//! [`WatchBridge`] filters file-system events through a glob and turns them
//! into `workspace/didChangeWatchedFiles`. Before the session is active the
//! events are buffered and later flushed as one batch in arrival order.
//! [`FileWatcher`] is the optional `notify` source feeding the bridge.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::message::Notification;
use crate::protocol::{self, DidChangeWatchedFiles, DidChangeWatchedFilesParams, FileChangeType};

/// Kind of change observed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

impl From<FileChangeKind> for FileChangeType {
    fn from(kind: FileChangeKind) -> Self {
        match kind {
            FileChangeKind::Created => Self::Created,
            FileChangeKind::Changed => Self::Changed,
            FileChangeKind::Deleted => Self::Deleted,
        }
    }
}

/// One file-system event, as reported by the host or the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WatchBridge {
    matcher: GlobMatcher,
    root: Option<PathBuf>,
    buffered: Vec<protocol::FileEvent>,
}

impl WatchBridge {
    pub fn new(pattern: &str, root: Option<&Path>) -> Result<Self, globset::Error> {
        Ok(Self {
            matcher: Glob::new(pattern)?.compile_matcher(),
            root: root.map(Path::to_path_buf),
            buffered: Vec::new(),
        })
    }

    /// The glob is tried against the path as given and, when a root is
    /// configured, against the path relative to that root.
    fn matches(&self, path: &Path) -> bool {
        if self.matcher.is_match(path) {
            return true;
        }
        self.root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .is_some_and(|rel| self.matcher.is_match(rel))
    }

    /// Returns a notification to send now, or buffers the event when the
    /// session is not active yet.
    pub fn observe(&mut self, event: &FileEvent, active: bool) -> Option<Notification> {
        if !self.matches(&event.path) {
            return None;
        }
        let uri = match protocol::path_to_file_uri(&event.path) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!("Dropping file event: {e}");
                return None;
            }
        };
        let change = protocol::FileEvent {
            uri: uri.to_string(),
            typ: event.kind.into(),
        };
        if active {
            notification(vec![change])
        } else {
            self.buffered.push(change);
            None
        }
    }

    /// Everything buffered so far, as one notification.
    pub fn flush(&mut self) -> Option<Notification> {
        if self.buffered.is_empty() {
            return None;
        }
        notification(std::mem::take(&mut self.buffered))
    }
}

fn notification(changes: Vec<protocol::FileEvent>) -> Option<Notification> {
    match protocol::notification::<DidChangeWatchedFiles>(&DidChangeWatchedFilesParams { changes })
    {
        Ok(note) => Some(note),
        Err(e) => {
            tracing::warn!("Failed to serialize watched-file changes: {e}");
            None
        }
    }
}

/// Map a raw `notify` event onto create/change/delete events.
fn map_event(event: &Event) -> Vec<FileEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileChangeKind::Created,
        EventKind::Remove(_) => FileChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FileChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths = [from, to]
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push(FileEvent::new(from.clone(), FileChangeKind::Deleted));
            }
            if let Some(to) = event.paths.get(1) {
                out.push(FileEvent::new(to.clone(), FileChangeKind::Created));
            }
            return out;
        }
        EventKind::Modify(_) => FileChangeKind::Changed,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event
        .paths
        .iter()
        .map(|path| FileEvent::new(path.clone(), kind))
        .collect()
}

/// Recursive watcher over a directory. Dropping it stops watching.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    pub fn start<F>(root: &Path, mut sink: F) -> Result<Self, notify::Error>
    where
        F: FnMut(FileEvent) + Send + 'static,
    {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_event in map_event(&event) {
                    sink(file_event);
                }
            }
            Err(e) => tracing::warn!("File watcher error: {e}"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::debug!("Watching {} for file changes", root.display());
        Ok(Self { _watcher: watcher })
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").finish_non_exhaustive()
    }
}
