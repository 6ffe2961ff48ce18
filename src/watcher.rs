//! Filesystem watcher
//!
//! A dedicated OS thread owns a [`notify::PollWatcher`] over the collections
//! root and forwards what it reports to the ingestion pipeline as
//! [`WatchEvent`]s.
//!
//! notify events only name the paths that changed. Each path is re-read and
//! compared against a snapshot of `<root>/<collection>/<file>` stamps, which
//! decides the event kind and drops repeats. The snapshot outlives the
//! thread: a (re)started observer diffs a fresh scan against it, so files
//! added while the process was down are reported as created and a restarted
//! observer does not re-announce files it already reported.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::ingest::{FileEvent, FileEventKind, WatchEvent};
use crate::observability::MetricsRegistry;
use crate::storage::should_ignore;

/// Longest the observer waits before re-checking its stop flag
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Watcher capability consumed by health checks and the supervisor
pub trait Watcher: Send + Sync {
    /// Whether the watcher has been started and not stopped
    fn is_running(&self) -> bool;

    /// Whether the observer thread is alive
    fn observer_alive(&self) -> bool;

    /// Time since the last event (or since the observer started)
    fn last_event_age(&self) -> Option<Duration>;

    /// Replace a dead observer with a fresh one
    fn restart(&self) -> Result<()>;
}

// ============================================================================
// Snapshot
// ============================================================================

/// (size, modification time) of a watched file
type FileStamp = (u64, Option<SystemTime>);

#[derive(Debug, Default)]
struct Snapshot {
    collections: BTreeSet<String>,
    files: BTreeMap<PathBuf, FileStamp>,
}

/// A path under the root that the pipeline cares about
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Collection(String),
    File { collection: String, name: String },
}

impl Snapshot {
    fn add_collection(&mut self, collection: String, events: &mut Vec<WatchEvent>) {
        if self.collections.insert(collection.clone()) {
            events.push(WatchEvent::CollectionCreated(collection));
        }
    }

    /// Re-read one entry from disk and record how it changed
    fn refresh(&mut self, root: &Path, entry: Entry, events: &mut Vec<WatchEvent>) {
        match entry {
            Entry::Collection(collection) => {
                if root.join(&collection).is_dir() {
                    self.add_collection(collection, events);
                } else {
                    self.collections.remove(&collection);
                }
            }
            Entry::File { collection, name } => {
                let path = root.join(&collection).join(&name);
                match stamp(&path) {
                    Some(current) => {
                        // A file can be reported before its directory
                        self.add_collection(collection, events);
                        let kind = match self.files.insert(path.clone(), current) {
                            None => FileEventKind::Created,
                            Some(previous) if previous != current => FileEventKind::Modified,
                            Some(_) => return,
                        };
                        events.push(WatchEvent::File(FileEvent::new(path, kind)));
                    }
                    None => {
                        if self.files.remove(&path).is_some() {
                            events.push(WatchEvent::File(FileEvent::new(path, FileEventKind::Deleted)));
                        }
                    }
                }
            }
        }
    }

    /// Replace the snapshot with `current`, recording the differences
    fn catch_up(&mut self, current: Snapshot, events: &mut Vec<WatchEvent>) {
        for collection in current.collections.difference(&self.collections) {
            events.push(WatchEvent::CollectionCreated(collection.clone()));
        }
        for (path, stamp) in &current.files {
            match self.files.get(path) {
                None => events.push(WatchEvent::File(FileEvent::new(path, FileEventKind::Created))),
                Some(previous) if previous != stamp => {
                    events.push(WatchEvent::File(FileEvent::new(path, FileEventKind::Modified)))
                }
                Some(_) => {}
            }
        }
        for path in self.files.keys() {
            if !current.files.contains_key(path) {
                events.push(WatchEvent::File(FileEvent::new(path, FileEventKind::Deleted)));
            }
        }
        *self = current;
    }
}

fn stamp(path: &Path) -> Option<FileStamp> {
    std::fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| (meta.len(), meta.modified().ok()))
}

/// Map a path reported by notify onto the collection layout
fn classify(relative: &Path) -> Option<Entry> {
    let parts: Vec<&str> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;

    match parts.as_slice() {
        [collection] if !collection.starts_with('.') => Some(Entry::Collection(collection.to_string())),
        [collection, name] if !collection.starts_with('.') && !should_ignore(name) => Some(Entry::File {
            collection: collection.to_string(),
            name: name.to_string(),
        }),
        _ => None,
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn scan(root: &Path) -> std::io::Result<Snapshot> {
    let mut snapshot = Snapshot::default();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(collection) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if collection.starts_with('.') {
            continue;
        }

        // A collection may vanish between listing and reading.
        let files = match std::fs::read_dir(entry.path()) {
            Ok(files) => files,
            Err(_) => continue,
        };
        for file in files.flatten() {
            let name = file.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if should_ignore(name) {
                continue;
            }
            let Ok(meta) = file.metadata() else {
                continue;
            };
            if meta.is_file() {
                snapshot
                    .files
                    .insert(file.path(), (meta.len(), meta.modified().ok()));
            }
        }
        snapshot.collections.insert(collection);
    }

    Ok(snapshot)
}

// ============================================================================
// Watcher
// ============================================================================

struct Observer {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Watcher polling the collections root through notify from an OS thread
pub struct PollingWatcher {
    root: PathBuf,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<WatchEvent>,
    snapshot: Arc<Mutex<Snapshot>>,
    last_event: Arc<Mutex<Option<Instant>>>,
    observer: Mutex<Option<Observer>>,
    running: AtomicBool,
    metrics: Arc<MetricsRegistry>,
}

impl PollingWatcher {
    /// Create a stopped watcher sending events to `events`
    pub fn new(
        root: impl Into<PathBuf>,
        poll_interval: Duration,
        events: mpsc::UnboundedSender<WatchEvent>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            root: root.into(),
            poll_interval,
            events,
            snapshot: Arc::new(Mutex::new(Snapshot::default())),
            last_event: Arc::new(Mutex::new(None)),
            observer: Mutex::new(None),
            running: AtomicBool::new(false),
            metrics,
        }
    }

    /// Start the observer thread
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Watcher is already running");
            return Ok(());
        }
        std::fs::create_dir_all(&self.root)?;
        self.spawn_observer()?;
        tracing::info!(root = ?self.root, poll_ms = self.poll_interval.as_millis() as u64, "Watcher started");
        Ok(())
    }

    /// Stop the observer thread and wait for it to exit
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(observer) = self.observer.lock().take() {
            Self::halt(observer);
        }
        tracing::info!("Watcher stopped");
    }

    fn halt(observer: Observer) {
        observer.stop.store(true, Ordering::SeqCst);
        if observer.handle.join().is_err() {
            tracing::warn!("Observer thread had panicked");
        }
    }

    fn spawn_observer(&self) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let task = ObserverTask {
            root: self.root.clone(),
            poll_interval: self.poll_interval,
            events: self.events.clone(),
            snapshot: self.snapshot.clone(),
            last_event: self.last_event.clone(),
            stop: stop.clone(),
        };

        *self.last_event.lock() = Some(Instant::now());
        let handle = std::thread::Builder::new()
            .name("vault-watcher".to_string())
            .spawn(move || task.run())?;

        *self.observer.lock() = Some(Observer { handle, stop });
        Ok(())
    }
}

impl Watcher for PollingWatcher {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn observer_alive(&self) -> bool {
        self.observer
            .lock()
            .as_ref()
            .map(|o| !o.handle.is_finished())
            .unwrap_or(false)
    }

    fn last_event_age(&self) -> Option<Duration> {
        self.last_event.lock().map(|at| at.elapsed())
    }

    fn restart(&self) -> Result<()> {
        if let Some(observer) = self.observer.lock().take() {
            Self::halt(observer);
        }
        self.running.store(true, Ordering::SeqCst);
        self.spawn_observer()?;
        self.metrics.watcher_thread_restarts.inc();
        tracing::warn!("Watcher observer restarted");
        Ok(())
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.get_mut().take() {
            Self::halt(observer);
        }
    }
}

impl std::fmt::Debug for PollingWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWatcher")
            .field("root", &self.root)
            .field("running", &self.is_running())
            .field("observer_alive", &self.observer_alive())
            .finish()
    }
}

// ============================================================================
// Observer thread
// ============================================================================

struct ObserverTask {
    root: PathBuf,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<WatchEvent>,
    snapshot: Arc<Mutex<Snapshot>>,
    last_event: Arc<Mutex<Option<Instant>>>,
    stop: Arc<AtomicBool>,
}

impl ObserverTask {
    fn run(self) {
        if let Err(e) = self.observe() {
            tracing::error!(root = ?self.root, error = %e, "Watcher observer failed");
        }
    }

    fn observe(&self) -> notify::Result<()> {
        let (notify_tx, notify_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let config = notify::Config::default().with_poll_interval(self.poll_interval);
        let mut watcher = PollWatcher::new(
            move |event: notify::Result<Event>| {
                if notify_tx.send(event).is_err() {
                    tracing::debug!("Watch event dropped because observer channel is closed");
                }
            },
            config,
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        let canonical_root = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());

        // Anything that changed while no observer was running
        match scan(&self.root) {
            Ok(current) => {
                let mut events = Vec::new();
                self.snapshot.lock().catch_up(current, &mut events);
                if !self.send(events) {
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(root = ?self.root, error = %e, "Catch-up scan failed"),
        }

        while !self.stop.load(Ordering::SeqCst) {
            match notify_rx.recv_timeout(STOP_CHECK_INTERVAL) {
                Ok(first) => {
                    let batch = std::iter::once(first).chain(notify_rx.try_iter());
                    if !self.apply(batch, &canonical_root) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.events.is_closed() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::debug!("Watcher observer exiting");
        Ok(())
    }

    /// Turn a batch of notify results into pipeline events
    ///
    /// Returns false once the receiver is gone.
    fn apply(&self, batch: impl Iterator<Item = notify::Result<Event>>, canonical_root: &Path) -> bool {
        let mut paths = BTreeSet::new();
        for result in batch {
            match result {
                Ok(event) if is_change(&event.kind) => paths.extend(event.paths),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Watch backend error"),
            }
        }

        let mut events = Vec::new();
        {
            let mut snapshot = self.snapshot.lock();
            for path in &paths {
                let relative = path
                    .strip_prefix(&self.root)
                    .or_else(|_| path.strip_prefix(canonical_root));
                if let Some(entry) = relative.ok().and_then(classify) {
                    snapshot.refresh(&self.root, entry, &mut events);
                }
            }
        }
        self.send(events)
    }

    fn send(&self, events: Vec<WatchEvent>) -> bool {
        if events.is_empty() {
            return !self.events.is_closed();
        }

        *self.last_event.lock() = Some(Instant::now());
        tracing::debug!(count = events.len(), "Watcher detected changes");
        events.into_iter().all(|event| self.events.send(event).is_ok())
    }
}
