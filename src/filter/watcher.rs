//! Change notification for the configuration file.

use crossbeam_channel::{Receiver, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Quiet period used to collapse an editor's write burst into one reload.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches the directory holding the configuration file.
///
/// Editors commonly save by writing a temporary file and renaming it over the
/// original, which replaces the inode a file watch would follow. Watching the
/// parent directory sees both that and in-place writes.
pub struct ConfigWatcher {
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    events: Receiver<()>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| Error::Config(format!("not a file path: {}", path.display())))?;
        let dir = watch_dir(path);

        let (tx, events) = crossbeam_channel::unbounded();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            handle_event(res, &file_name, &tx)
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        log::info!("Watching {} for configuration changes", dir.display());
        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    /// Receiver yielding one message per relevant event.
    pub fn events(&self) -> &Receiver<()> {
        &self.events
    }

    /// Discard pending events, waiting out a short quiet period first.
    pub fn coalesce(&self) -> usize {
        let mut dropped = 0;
        while self.events.recv_timeout(DEBOUNCE).is_ok() {
            dropped += 1;
        }
        dropped
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn handle_event(res: notify::Result<Event>, file_name: &OsString, tx: &Sender<()>) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            log::warn!("Config watch error: {}", e);
            return;
        }
    };

    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    let relevant = event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()));
    if relevant {
        // The receiver is gone once the filter stops.
        let _ = tx.send(());
    }
}
