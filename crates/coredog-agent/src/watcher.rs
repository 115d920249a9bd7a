//! Recursive directory watcher that turns kernel core-file writes into
//! settled-path events.
//!
//! The kernel writes a core dump as many small writes and never signals
//! completion through fsnotify, so a path is only published once two stat
//! samples taken one second apart observe the same size. Each settled path
//! is published at most once per agent lifetime; the dedup entry is erased
//! when the path's deletion is observed.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interval between the two stat samples of the quiescence probe.
const SETTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that can occur while watching the core-file tree.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("watch root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("filesystem notification error: {0}")]
    Notify(#[from] notify::Error),

    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("settled-path receiver dropped")]
    ReceiverDropped,

    #[error("notification stream closed")]
    StreamClosed,
}

/// Watches a directory tree and publishes settled core-file paths.
///
/// Containers write core files as arbitrary UIDs, so every watched
/// directory is chmodded world-writable the moment it is discovered.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
    output: mpsc::Sender<PathBuf>,
    processed: HashSet<PathBuf>,
}

impl FileWatcher {
    /// Create a watcher publishing settled paths into `output`.
    pub fn new(output: mpsc::Sender<PathBuf>) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let _ = tx.send(res);
        })?;
        Ok(Self {
            watcher,
            events: rx,
            output,
            processed: HashSet::new(),
        })
    }

    /// Begin recursive monitoring of `root` and run the event loop until
    /// the subscription fails. A watcher failure is fatal to the agent.
    pub async fn watch(mut self, root: &Path) -> Result<(), WatchError> {
        let meta = std::fs::metadata(root).map_err(|_| WatchError::MissingRoot(root.to_path_buf()))?;
        if !meta.is_dir() {
            return Err(WatchError::NotADirectory(root.to_path_buf()));
        }

        self.subscribe_tree(root)?;
        self.run().await
    }

    /// Subscribe to `dir` and every directory below it, making each
    /// world-writable on the way down.
    fn subscribe_tree(&mut self, dir: &Path) -> Result<(), WatchError> {
        self.subscribe_dir(dir)?;

        let entries = std::fs::read_dir(dir).map_err(|source| WatchError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| WatchError::Walk {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                self.subscribe_tree(&path)?;
            }
        }
        Ok(())
    }

    fn subscribe_dir(&mut self, dir: &Path) -> Result<(), WatchError> {
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)) {
            warn!(dir = %dir.display(), error = %e, "failed to set permissions on watched directory");
        }
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "watching for core files");
        Ok(())
    }

    async fn run(mut self) -> Result<(), WatchError> {
        while let Some(res) = self.events.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "watch subscription error, terminating watcher");
                    return Err(WatchError::Notify(e));
                }
            };
            self.handle_event(event).await?;
        }
        Err(WatchError::StreamClosed)
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), WatchError> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                for path in event.paths {
                    self.handle_create_or_write(path).await?;
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.handle_remove(&path);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // Renamed paths lose their subscription unconditionally.
                for path in event.paths {
                    if self.watcher.unwatch(&path).is_ok() {
                        info!(path = %path.display(), "path renamed, no longer watching");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_create_or_write(&mut self, path: PathBuf) -> Result<(), WatchError> {
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "stat failed on create/write event");
                return Ok(());
            }
        };

        if meta.is_dir() {
            // New subtrees may already contain nested directories by the
            // time the event is handled; walk the whole thing.
            if let Err(e) = self.subscribe_tree(&path) {
                error!(dir = %path.display(), error = %e, "failed to watch new subdirectory");
            }
            return Ok(());
        }
        if !meta.is_file() {
            return Ok(());
        }

        if self.processed.contains(&path) {
            debug!(path = %path.display(), "already processed, skipping");
            return Ok(());
        }

        match wait_for_quiescence(&path).await {
            Ok(size) => {
                info!(path = %path.display(), size, "captured core file");
                self.processed.insert(path.clone());
                self.output
                    .send(path)
                    .await
                    .map_err(|_| WatchError::ReceiverDropped)?;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "file write incomplete or stat error");
            }
        }
        Ok(())
    }

    fn handle_remove(&mut self, path: &Path) {
        if std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false) {
            let _ = self.watcher.unwatch(path);
            info!(dir = %path.display(), "subdirectory removed, no longer watching");
        } else {
            self.processed.remove(path);
        }
    }
}

/// Stat the file once per second until two consecutive samples agree.
///
/// Bounded only by file growth; a file that never stops growing keeps the
/// probe (and with it this watcher's event handling) busy.
async fn wait_for_quiescence(path: &Path) -> std::io::Result<u64> {
    loop {
        let size0 = tokio::fs::metadata(path).await?.len();
        tokio::time::sleep(SETTLE_INTERVAL).await;
        let size1 = tokio::fs::metadata(path).await?.len();
        if size0 == size1 {
            return Ok(size1);
        }
    }
}
