use crate::corpus::{CorpusError, CorpusStore, EntryOrigin, LoadOutcome, is_hidden};
use crate::payload::Payload;
use log::{debug, info, warn};
use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to watch {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("Failed to scan {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Directory watch closed unexpectedly")]
    Disconnected,
    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

/// A pollable source of "this file may be new" notifications for a single
/// directory.
///
/// `poll` must return within roughly `timeout` even when nothing happened.
/// Implementations may report the same path more than once.
pub trait DirectoryObserver {
    fn name(&self) -> &'static str;

    fn poll(&mut self, timeout: Duration) -> Result<Vec<PathBuf>, SyncError>;

    /// Asks for `path` to be reported again by a later poll, because it could
    /// not be read completely yet. Observers whose events already fire again
    /// once the writer finishes can ignore this.
    fn retry(&mut self, _path: &Path) {}
}

/// Observer backed by the platform's native file notification API.
pub struct NotifyObserver {
    directory: PathBuf,
    events: Receiver<notify::Result<Event>>,
    // Dropping the watcher stops the watch.
    _watcher: RecommendedWatcher,
}

impl NotifyObserver {
    pub fn new(directory: &Path) -> Result<Self, SyncError> {
        let watch_error = |source| SyncError::Watch {
            path: directory.to_path_buf(),
            source,
        };
        let (sender, events) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(sender).map_err(watch_error)?;
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;
        debug!("Watching {:?} for new corpus files", directory);

        Ok(Self {
            directory: directory.to_path_buf(),
            events,
            _watcher: watcher,
        })
    }

    /// Creation, rename-into-place and close-after-write all mean a file
    /// might now be complete.
    fn candidate_paths(event: Event) -> Vec<PathBuf> {
        match event.kind {
            EventKind::Create(_) | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                event.paths
            }
            // For paired renames the destination comes last.
            EventKind::Modify(ModifyKind::Name(_)) => event.paths.into_iter().last().into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn collect(&self, event: notify::Result<Event>, paths: &mut Vec<PathBuf>) {
        match event {
            Ok(event) => paths.extend(Self::candidate_paths(event)),
            Err(e) => warn!("watch error on {:?}: {}", self.directory, e),
        }
    }
}

impl DirectoryObserver for NotifyObserver {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<PathBuf>, SyncError> {
        let mut paths = Vec::new();
        match self.events.recv_timeout(timeout) {
            Ok(event) => self.collect(event, &mut paths),
            Err(RecvTimeoutError::Timeout) => return Ok(paths),
            Err(RecvTimeoutError::Disconnected) => return Err(SyncError::Disconnected),
        }
        // Drain whatever else is already queued without waiting again.
        while let Ok(event) = self.events.try_recv() {
            self.collect(event, &mut paths);
        }
        Ok(paths)
    }
}

/// Observer that lists the directory on every poll and reports names it has
/// not reported before.
///
/// Files present when the observer is created are considered seen; they are
/// expected to be picked up by the store's initial load.
pub struct ScanObserver {
    directory: PathBuf,
    seen: HashSet<PathBuf>,
}

impl ScanObserver {
    pub fn new(directory: &Path) -> Result<Self, SyncError> {
        let mut observer = Self {
            directory: directory.to_path_buf(),
            seen: HashSet::new(),
        };
        observer.scan()?;
        Ok(observer)
    }

    fn scan(&mut self) -> Result<Vec<PathBuf>, SyncError> {
        let scan_error = |source| SyncError::Scan {
            path: self.directory.clone(),
            source,
        };
        let mut fresh = Vec::new();
        for dir_entry in fs::read_dir(&self.directory).map_err(scan_error)? {
            let path = dir_entry.map_err(scan_error)?.path();
            if !self.seen.contains(&path) {
                fresh.push(path);
            }
        }
        fresh.sort();
        self.seen.extend(fresh.iter().cloned());
        Ok(fresh)
    }
}

impl DirectoryObserver for ScanObserver {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<PathBuf>, SyncError> {
        let fresh = self.scan()?;
        if fresh.is_empty() {
            std::thread::sleep(timeout);
        }
        Ok(fresh)
    }

    /// A scan never re-signals a name it has reported, so forget it instead.
    fn retry(&mut self, path: &Path) {
        self.seen.remove(path);
    }
}

/// Feeds corpus files written by sibling processes into a local store.
///
/// The synchronizer owns no thread. The fuzzing loop calls [`poll`] with a
/// short timeout between iterations, and newly ingested entries show up in
/// the store as external and unprocessed.
///
/// [`poll`]: CorpusSynchronizer::poll
pub struct CorpusSynchronizer<O: DirectoryObserver> {
    observer: O,
    poll_timeout: Duration,
}

impl CorpusSynchronizer<NotifyObserver> {
    /// Starts watching the directory of `store` for new files.
    ///
    /// # Arguments
    /// * `store`: The store whose inputs directory is shared with peers.
    /// * `poll_timeout`: Upper bound on how long a single [`poll`] may wait.
    ///
    /// # Returns
    /// A synchronizer backed by a native watch, or [`SyncError::Watch`] if the
    /// platform refused to set one up.
    ///
    /// [`poll`]: CorpusSynchronizer::poll
    pub fn watch<P: Payload>(
        store: &CorpusStore<P>,
        poll_timeout: Duration,
    ) -> Result<Self, SyncError> {
        Ok(Self::new(NotifyObserver::new(store.directory())?, poll_timeout))
    }
}

impl<O: DirectoryObserver> CorpusSynchronizer<O> {
    pub fn new(observer: O, poll_timeout: Duration) -> Self {
        Self {
            observer,
            poll_timeout,
        }
    }

    /// Waits at most the configured timeout for directory events and ingests
    /// every file they point at.
    ///
    /// A file that fails to load is logged and skipped; the rest of the batch
    /// is still ingested.
    ///
    /// # Returns
    /// The number of entries added, or an error when the observer itself
    /// failed (the watch was dropped or the directory became unreadable).
    pub fn poll<P: Payload>(&mut self, store: &mut CorpusStore<P>) -> Result<usize, SyncError> {
        let candidates = self.observer.poll(self.poll_timeout)?;
        let mut ingested = 0;
        for path in candidates {
            match self.ingest(store, &path) {
                Ok(true) => ingested += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "{} observer: skipping corpus file {:?}: {}",
                    self.observer.name(),
                    path,
                    e
                ),
            }
        }
        if ingested > 0 {
            info!(
                "Synchronized {} external corpus entries ({} total)",
                ingested,
                store.count()
            );
        }
        Ok(ingested)
    }

    /// Tries to ingest a single file as an external entry.
    ///
    /// Files this process wrote itself and hidden staging files are ignored.
    /// Files that cannot be decoded yet are handed back to the observer to be
    /// reported again.
    ///
    /// # Returns
    /// Whether an entry was added, or the load error for files that failed
    /// for good.
    pub fn ingest<P: Payload>(
        &mut self,
        store: &mut CorpusStore<P>,
        path: &Path,
    ) -> Result<bool, SyncError> {
        if is_hidden(path) || store.find_by_path(path) {
            return Ok(false);
        }
        match store.load_file(path, EntryOrigin::External)? {
            LoadOutcome::Loaded => Ok(true),
            LoadOutcome::Skipped => {
                debug!("{} observer: {:?} not readable yet", self.observer.name(), path);
                self.observer.retry(path);
                Ok(false)
            }
            LoadOutcome::AlreadyKnown | LoadOutcome::NotAFile => Ok(false),
        }
    }
}
