//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use trellis_core::{GraphStore, TrellisConfig, clear_state, read_snapshot, save_snapshot, snapshot_path};
use trellis_indexer::{ExtractorRegistry, UpdateCoordinator, index_directory};
use trellis_server::{ServerState, TrellisServer};
use trellis_watcher::WatcherService;

fn load_config(root: &Path) -> anyhow::Result<TrellisConfig> {
    TrellisConfig::load(root).with_context(|| format!("loading configuration from {}", root.display()))
}

/// Build a store, seeded from the saved snapshot when one exists.
fn open_store(root: &Path, config: &TrellisConfig) -> anyhow::Result<Arc<GraphStore>> {
    let store = Arc::new(GraphStore::new());
    let path = snapshot_path(root, &config.storage.snapshot_path);
    match read_snapshot(&path) {
        Ok(Some(snapshot)) => store.load_snapshot(snapshot)?,
        Ok(None) => {}
        // A corrupt snapshot is rebuilt by the scan that follows.
        Err(e) => tracing::warn!("Ignoring unreadable snapshot {}: {}", path.display(), e),
    }
    Ok(store)
}

fn save(root: &Path, config: &TrellisConfig, store: &GraphStore) -> anyhow::Result<()> {
    let path = snapshot_path(root, &config.storage.snapshot_path);
    save_snapshot(&store.export_snapshot(), &path)?;
    Ok(())
}

fn coordinator(root: &Path, config: &TrellisConfig, store: Arc<GraphStore>) -> Arc<UpdateCoordinator> {
    Arc::new(UpdateCoordinator::new(
        store,
        ExtractorRegistry::with_defaults(),
        config,
        root,
    ))
}

/// Scan on the blocking pool; extraction is CPU-bound.
async fn scan(coordinator: &Arc<UpdateCoordinator>, config: &TrellisConfig) -> anyhow::Result<()> {
    let coordinator = Arc::clone(coordinator);
    let watch = config.watch.clone();
    let report = tokio::task::spawn_blocking(move || index_directory(&coordinator, &watch)).await?;
    for failed in &report.failed {
        tracing::warn!("Failed to index {}: {}", failed.path.display(), failed.error);
    }
    Ok(())
}

pub async fn serve(root: PathBuf, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_config(&root)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let store = open_store(&root, &config)?;
    let coordinator = coordinator(&root, &config, Arc::clone(&store));
    scan(&coordinator, &config).await?;
    let stats = store.view().stats();
    tracing::info!("Indexed {} nodes, {} edges", stats.nodes, stats.edges);
    if config.storage.autosave {
        save(&root, &config, &store)?;
    }

    let state = Arc::new(ServerState::new(Arc::clone(&store), &config.query));
    let watcher = WatcherService::new(Arc::clone(&coordinator), &config.watch)?.with_broadcast(state.diff_tx.clone());
    watcher.start_watching().await?;
    tokio::spawn(async move {
        if let Err(e) = watcher.process_events().await {
            tracing::error!("File watcher error: {}", e);
        }
    });

    let server = TrellisServer::new(state, config.server.clone());
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    if config.storage.autosave {
        save(&root, &config, &store)?;
    }
    Ok(())
}

pub async fn index(root: PathBuf) -> anyhow::Result<()> {
    tracing::info!("Indexing repository: {}", root.display());
    let config = load_config(&root)?;
    let store = open_store(&root, &config)?;
    let coordinator = coordinator(&root, &config, Arc::clone(&store));
    scan(&coordinator, &config).await?;

    save(&root, &config, &store)?;
    let stats = store.view().stats();
    tracing::info!("Indexed {} nodes, {} edges", stats.nodes, stats.edges);
    Ok(())
}

pub fn stats(root: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&root)?;
    let path = snapshot_path(&root, &config.storage.snapshot_path);
    let Some(snapshot) = read_snapshot(&path)? else {
        anyhow::bail!("no snapshot at {}; run `trellis index` first", path.display());
    };
    let store = GraphStore::new();
    store.load_snapshot(snapshot)?;
    println!("{}", serde_json::to_string_pretty(&store.view().stats())?);
    Ok(())
}

pub fn clear(root: PathBuf) -> anyhow::Result<()> {
    tracing::info!("Clearing saved state for: {}", root.display());
    clear_state(&root)?;
    tracing::info!("State cleared");
    Ok(())
}
