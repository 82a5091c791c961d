//! Full-repository scans and the path filter shared with the watcher

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::{info, warn};
use trellis_core::config::WatchConfig;

use crate::coordinator::{FileChange, UpdateCoordinator, UpdateReport};

/// Decides which repository paths are never indexed.
#[derive(Debug, Clone)]
pub struct PathFilter {
    dirs: Vec<String>,
    globs: GlobSet,
}

impl PathFilter {
    pub fn new(config: &WatchConfig) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore_globs {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => warn!("Ignoring invalid glob {}: {}", pattern, e),
            }
        }
        let globs = builder.build().unwrap_or_else(|e| {
            warn!("Failed to build ignore globs: {}", e);
            GlobSet::empty()
        });
        PathFilter {
            dirs: config.ignore_dirs.clone(),
            globs,
        }
    }

    /// `path` is relative to the repository root.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let in_ignored_dir = path.components().any(|c| match c {
            Component::Normal(name) => self.dirs.iter().any(|d| name == d.as_str()),
            _ => false,
        });
        in_ignored_dir || self.globs.is_match(path)
    }
}

/// Index every supported file under the coordinator's root.
///
/// Files that are in the graph but no longer on disk are removed in the
/// same batch, so a scan after restoring a snapshot reconciles it.
pub fn index_directory(coordinator: &UpdateCoordinator, config: &WatchConfig) -> UpdateReport {
    let root = coordinator.root().to_path_buf();
    let filter = PathFilter::new(config);
    let found = discover(&root, &filter, coordinator);

    let mut changes: Vec<FileChange> = found.iter().cloned().map(FileChange::created).collect();
    let missing: Vec<PathBuf> = coordinator
        .store()
        .view()
        .files()
        .into_iter()
        .filter(|path| !path.as_os_str().is_empty() && !found.contains(path))
        .collect();
    changes.extend(missing.into_iter().map(FileChange::deleted));

    info!("Indexing {} files under {}", found.len(), root.display());
    let report = coordinator.apply(changes);
    info!(
        "Indexed {} files ({} failed, {} unresolved references)",
        report.applied.len(),
        report.failed.len(),
        report.unresolved.len()
    );
    report
}

fn discover(root: &Path, filter: &PathFilter, coordinator: &UpdateCoordinator) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    let walker = WalkBuilder::new(root).hidden(false).git_ignore(true).build();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let relative = coordinator.relative(entry.path());
        if filter.is_ignored(&relative) || !coordinator.registry().supports(&relative) {
            continue;
        }
        found.insert(relative);
    }
    found
}
