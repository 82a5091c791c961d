//! Filesystem watcher implementation

use anyhow::Result;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};
use trellis_core::GraphDiff;
use trellis_core::config::WatchConfig;
use trellis_indexer::{FileChange, PathFilter, UpdateCoordinator, UpdateReport};

/// Events emitted by the file watcher, with repository-relative paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(path) | WatchEvent::Modified(path) | WatchEvent::Removed(path) => path,
        }
    }

    fn into_change(self) -> FileChange {
        match self {
            WatchEvent::Created(path) => FileChange::created(path),
            WatchEvent::Modified(path) => FileChange::modified(path),
            WatchEvent::Removed(path) => FileChange::deleted(path),
        }
    }
}

/// Strips the watched root from absolute event paths.
#[derive(Debug, Clone)]
struct RootPaths {
    root: PathBuf,
    canonical: Option<PathBuf>,
    filter: PathFilter,
}

impl RootPaths {
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let relative = path
            .strip_prefix(&self.root)
            .ok()
            .or_else(|| self.canonical.as_ref().and_then(|c| path.strip_prefix(c).ok()))?;
        if relative.as_os_str().is_empty() || self.filter.is_ignored(relative) {
            return None;
        }
        Some(relative.to_path_buf())
    }
}

/// File system watcher for monitoring code changes
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    event_rx: mpsc::UnboundedReceiver<WatchEvent>,
    watched_paths: HashSet<PathBuf>,
    root_path: PathBuf,
}

impl FileWatcher {
    /// Create a new file watcher for the given root path
    pub fn new(root_path: impl AsRef<Path>, filter: PathFilter) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let roots = RootPaths {
            root: root_path.clone(),
            canonical: std::fs::canonicalize(&root_path).ok(),
            filter,
        };

        let watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                debug!("File system event: {:?}", event);
                Self::handle_notify_event(event, &roots, &event_tx);
            }
            Err(e) => {
                error!("File system watch error: {}", e);
            }
        })?;

        Ok(Self {
            watcher,
            event_rx,
            watched_paths: HashSet::new(),
            root_path,
        })
    }

    /// Handle a notify event and convert to our watch events
    fn handle_notify_event(event: notify::Event, roots: &RootPaths, event_tx: &mpsc::UnboundedSender<WatchEvent>) {
        for path in event.paths {
            let Some(relative) = roots.relative(&path) else {
                continue;
            };
            let watch_event = match event.kind {
                EventKind::Create(_) => WatchEvent::Created(relative),
                // Renames arrive as name changes; the path's existence tells which side this is.
                EventKind::Modify(ModifyKind::Name(_)) if !path.exists() => WatchEvent::Removed(relative),
                EventKind::Modify(ModifyKind::Name(_)) => WatchEvent::Created(relative),
                EventKind::Modify(ModifyKind::Metadata(_)) => continue,
                EventKind::Modify(_) => WatchEvent::Modified(relative),
                EventKind::Remove(_) => WatchEvent::Removed(relative),
                _ => continue,
            };
            if let Err(e) = event_tx.send(watch_event) {
                warn!("Failed to send watch event: {}", e);
            }
        }
    }

    /// Watch a directory recursively
    pub fn watch_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Watching directory: {:?}", path);

        self.watcher.watch(path, RecursiveMode::Recursive)?;
        self.watched_paths.insert(path.to_path_buf());
        Ok(())
    }

    /// Stop watching a path
    pub fn unwatch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Stopping watch for: {:?}", path);

        self.watcher.unwatch(path)?;
        self.watched_paths.remove(path);
        Ok(())
    }

    /// Get the event receiver
    pub fn event_receiver(&mut self) -> &mut mpsc::UnboundedReceiver<WatchEvent> {
        &mut self.event_rx
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched_paths.contains(path)
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }
}

/// Collapse a burst of events into one change per path; the last event wins.
pub fn coalesce(events: Vec<WatchEvent>) -> Vec<FileChange> {
    let mut latest: BTreeMap<PathBuf, WatchEvent> = BTreeMap::new();
    for event in events {
        latest.insert(event.path().to_path_buf(), event);
    }
    latest.into_values().map(WatchEvent::into_change).collect()
}

/// Websocket message carrying one graph diff.
pub fn diff_message(diff: &GraphDiff) -> Result<String> {
    let diff_json = serde_json::to_string(diff)?;
    Ok(format!(r#"{{"type":"graph_diff","diff":{}}}"#, diff_json))
}

/// Watcher service that feeds debounced file changes to the update coordinator
pub struct WatcherService {
    watcher: Mutex<FileWatcher>,
    coordinator: Arc<UpdateCoordinator>,
    diff_tx: Option<broadcast::Sender<String>>,
    debounce: Duration,
}

impl WatcherService {
    /// Create a new watcher service for the coordinator's root
    pub fn new(coordinator: Arc<UpdateCoordinator>, config: &WatchConfig) -> Result<Self> {
        let watcher = FileWatcher::new(coordinator.root(), PathFilter::new(config))?;
        Ok(Self {
            watcher: Mutex::new(watcher),
            coordinator,
            diff_tx: None,
            debounce: Duration::from_millis(config.debounce_ms),
        })
    }

    /// Broadcast every non-empty diff on `diff_tx`
    pub fn with_broadcast(mut self, diff_tx: broadcast::Sender<String>) -> Self {
        self.diff_tx = Some(diff_tx);
        self
    }

    /// Start watching the project directory
    pub async fn start_watching(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().await;
        let root_path = watcher.root_path().to_path_buf();
        watcher.watch_directory(&root_path)?;

        info!("Started watching project directory: {:?}", root_path);
        Ok(())
    }

    /// Process file system events until the watcher shuts down
    pub async fn process_events(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().await;
        let event_rx = watcher.event_receiver();

        while let Some(first) = event_rx.recv().await {
            let mut events = vec![first];
            // Keep collecting until the burst has been quiet for one debounce interval.
            while let Ok(Some(event)) = tokio::time::timeout(self.debounce, event_rx.recv()).await {
                events.push(event);
            }
            debug!("Processing {} watch events", events.len());

            let changes = coalesce(events);
            if let Err(e) = self.apply_changes(changes).await {
                error!("Failed to apply file changes: {}", e);
            }
        }

        info!("Watch event stream closed");
        Ok(())
    }

    /// Run one batch through the coordinator off the async runtime and broadcast its diff
    pub async fn apply_changes(&self, changes: Vec<FileChange>) -> Result<UpdateReport> {
        for change in &changes {
            info!("File {:?}: {:?}", change.kind, change.path);
        }
        let coordinator = Arc::clone(&self.coordinator);
        let report = tokio::task::spawn_blocking(move || coordinator.apply(changes)).await?;

        for stale in &report.stale {
            debug!("Skipped superseded update for {:?}", stale);
        }
        if !report.diff.is_empty() {
            self.broadcast(&report.diff);
        }
        Ok(report)
    }

    fn broadcast(&self, diff: &GraphDiff) {
        let Some(ref diff_tx) = self.diff_tx else {
            return;
        };
        match diff_message(diff) {
            // No receivers just means no websocket clients are connected
            Ok(message) => {
                let _ = diff_tx.send(message);
            }
            Err(e) => error!("Failed to serialize graph diff: {}", e),
        }
    }

    pub fn coordinator(&self) -> &Arc<UpdateCoordinator> {
        &self.coordinator
    }
}
