use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use filebox_channel::{EventKind, FileEvent};

use crate::normalize;
use crate::rename::{Paired, RenamePairing};

/// One `created` observation.
#[derive(Debug, Clone)]
pub struct CreatedEntry {
    pub path: PathBuf,
    pub observed_at: DateTime<Utc>,
}

/// Append-only record of every created path, kept for diagnostics.
#[derive(Debug, Default)]
pub struct CreatedLog {
    entries: Vec<CreatedEntry>,
}

impl CreatedLog {
    pub fn record(&mut self, path: &Path) {
        self.entries.push(CreatedEntry {
            path: path.to_path_buf(),
            observed_at: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[CreatedEntry] {
        &self.entries
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Observes a directory tree and yields normalized [`FileEvent`]s.
///
/// The OS watcher calls back on its own thread; raw events are forwarded into
/// an unbounded channel, renames are paired, and the rest is normalized on
/// the async side.
pub struct Watcher {
    root: PathBuf,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    renames: RenamePairing,
    ready: VecDeque<FileEvent>,
    created: CreatedLog,
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("root", &self.root)
            .field("created", &self.created.len())
            .finish()
    }
}

impl Watcher {
    /// Start watching `root`.  The root is canonicalized so every emitted
    /// path is absolute.
    pub fn start(root: impl AsRef<Path>, recursive: bool) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            bail!("watch directory {} does not exist", root.display());
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", root.display()))?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut inner = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .context("failed to create filesystem watcher")?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        inner
            .watch(&root, mode)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        debug!(root = %root.display(), recursive, "filesystem watcher started");
        Ok(Self {
            root,
            events,
            renames: RenamePairing::default(),
            ready: VecDeque::new(),
            created: CreatedLog::default(),
            _inner: inner,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn created_log(&self) -> &CreatedLog {
        &self.created
    }

    pub fn created_paths(&self) -> Vec<PathBuf> {
        self.created.paths().map(Path::to_path_buf).collect()
    }

    /// Wait for the next event worth publishing.  Returns `None` once the OS
    /// watcher has gone away and nothing is left to report.  Cancel safe.
    pub async fn next_event(&mut self) -> Option<FileEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(self.observed(event));
            }

            let deadline = self.renames.deadline();
            let received = tokio::select! {
                received = self.events.recv() => received,
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.ready.extend(self.renames.expire(Instant::now()));
                    continue;
                }
            };

            match received {
                Some(Ok(raw)) => {
                    let event = match self.renames.accept(&raw, Instant::now()) {
                        Paired::Unrelated => normalize(&raw),
                        Paired::Emit(event) => Some(event),
                        Paired::Held | Paired::Suppressed => None,
                    };
                    self.ready.extend(event);
                }
                Some(Err(err)) => warn!(%err, "filesystem watcher error"),
                None => {
                    self.ready.extend(self.renames.flush());
                    if self.ready.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    fn observed(&mut self, event: FileEvent) -> FileEvent {
        if event.kind == EventKind::Created {
            self.created.record(event.path());
        }
        debug!(kind = %event.kind, path = %event.path().display(), "file event observed");
        event
    }
}
