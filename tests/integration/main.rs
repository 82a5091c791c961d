//! Integration tests for Trellis
//!
//! Files on disk flow through the coordinator, the store, queries and snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use trellis_core::{GraphQuery, GraphStore, NodeId, TrellisConfig, read_snapshot, save_snapshot, snapshot_path};
use trellis_indexer::{ExtractorRegistry, FileChange, UpdateCoordinator, index_directory};
use trellis_server::ServerState;
use trellis_watcher::WatcherService;

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn coordinator(root: &Path) -> Arc<UpdateCoordinator> {
    Arc::new(UpdateCoordinator::new(
        Arc::new(GraphStore::new()),
        ExtractorRegistry::with_defaults(),
        &TrellisConfig::default(),
        root,
    ))
}

fn ids(nodes: &[trellis_core::Node]) -> Vec<&str> {
    nodes.iter().map(|n| n.id.as_str()).collect()
}

#[test]
fn test_reference_resolves_once_target_file_appears() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(dir.path());
    let query = GraphQuery::new(Arc::clone(coordinator.store()), 500);

    write(dir.path(), "a.py", "from b import bar\n\n\ndef foo():\n    return bar()\n");
    coordinator.update_file(FileChange::created("a.py")).unwrap();
    let foo = NodeId::from("function:a.foo");
    assert!(query.find_functions_called_by(&foo, 10).unwrap().is_empty());

    write(dir.path(), "b.py", "def bar():\n    return 1\n");
    coordinator.update_file(FileChange::created("b.py")).unwrap();
    let callees = query.find_functions_called_by(&foo, 10).unwrap();
    assert_eq!(ids(&callees), vec!["function:b.bar"]);
    assert_eq!(query.stats().pending_edges, 0);
}

#[test]
fn test_move_between_files_keeps_identity() {
    let dir = tempfile::tempdir().unwrap();
    let body = "def foo(values):\n    out = []\n    for v in values:\n        out.append(v + 1)\n    return out\n";
    write(dir.path(), "file_a.py", body);
    write(dir.path(), "file_b.py", "X = 1\n");

    let coordinator = coordinator(dir.path());
    index_directory(&coordinator, &TrellisConfig::default().watch);
    let original = coordinator
        .store()
        .get_node(&NodeId::from("function:file_a.foo"))
        .unwrap();

    std::fs::remove_file(dir.path().join("file_a.py")).unwrap();
    write(dir.path(), "file_b.py", &format!("X = 1\n\n\n{}", body));
    let report = coordinator.apply(vec![FileChange::deleted("file_a.py"), FileChange::modified("file_b.py")]);

    assert!(report.renamed().iter().any(|m| m.id == original.id && m.to == PathBuf::from("file_b.py")));
    let moved = coordinator.store().get_node(&original.id).unwrap();
    assert_eq!(moved.file_path, PathBuf::from("file_b.py"));
    let query = GraphQuery::new(Arc::clone(coordinator.store()), 500);
    let foos = query.search_nodes("foo", 10).unwrap();
    assert_eq!(foos.iter().filter(|n| n.name == "foo").count(), 1);
}

#[test]
fn test_snapshot_round_trip_and_rescan() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "pkg/util.py", "def helper():\n    return 2\n");
    write(dir.path(), "main.py", "from pkg.util import helper\n\n\ndef run():\n    return helper()\n");

    let config = TrellisConfig::default();
    let coordinator = coordinator(dir.path());
    index_directory(&coordinator, &config.watch);
    let before = coordinator.store().stats();

    let path = snapshot_path(dir.path(), &config.storage.snapshot_path);
    save_snapshot(&coordinator.store().export_snapshot(), &path).unwrap();

    let restored = Arc::new(GraphStore::new());
    restored.load_snapshot(read_snapshot(&path).unwrap().unwrap()).unwrap();
    assert_eq!(restored.stats().nodes, before.nodes);
    assert_eq!(restored.stats().edges, before.edges);

    // A file deleted while nothing was running disappears on the next scan.
    std::fs::remove_file(dir.path().join("main.py")).unwrap();
    let rescanner = UpdateCoordinator::new(
        Arc::clone(&restored),
        ExtractorRegistry::with_defaults(),
        &config,
        dir.path(),
    );
    index_directory(&rescanner, &config.watch);
    assert!(restored.get_node(&NodeId::from("function:main.run")).is_none());
    assert!(restored.get_node(&NodeId::from("function:pkg.util.helper")).is_some());
}

#[tokio::test]
async fn test_watcher_changes_reach_websocket_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrellisConfig::default();
    let coordinator = coordinator(dir.path());
    let state = ServerState::new(Arc::clone(coordinator.store()), &config.query);
    let mut diffs = state.diff_tx.subscribe();

    let watcher = WatcherService::new(Arc::clone(&coordinator), &config.watch)
        .unwrap()
        .with_broadcast(state.diff_tx.clone());

    write(dir.path(), "svc.py", "def handle():\n    return None\n");
    watcher.apply_changes(vec![FileChange::created("svc.py")]).await.unwrap();

    let message: serde_json::Value = serde_json::from_str(&diffs.recv().await.unwrap()).unwrap();
    assert_eq!(message["type"], "graph_diff");
    let added = message["diff"]["added_nodes"].as_array().unwrap();
    assert!(added.iter().any(|n| n["id"] == "function:svc.handle"));

    let node = state
        .query
        .get_node_details(&NodeId::from("function:svc.handle"))
        .unwrap();
    assert_eq!(node.file_path, PathBuf::from("svc.py"));
}
