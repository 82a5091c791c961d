//! Filesystem watching and debounced graph updates

pub mod watcher;

pub use watcher::{FileWatcher, WatchEvent, WatcherService, coalesce, diff_message};
