//! Unit tests for trellis-core module

use crate::test_utils::*;
use crate::*;
use chrono::{Duration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn query(store: &Arc<GraphStore>) -> GraphQuery {
    GraphQuery::new(Arc::clone(store), 100)
}

#[test]
fn test_node_id_derivation() {
    let node_id = NodeId::derive(&NodeType::Function, "a.foo");
    assert_eq!(node_id.as_str(), "function:a.foo");

    // Same inputs, same id
    assert_eq!(node_id, Node::new(NodeType::Function, "foo", "a.foo", "a.py").id);

    let (ty, qualified) = node_id.parts().unwrap();
    assert_eq!(ty, NodeType::Function);
    assert_eq!(qualified, "a.foo");

    let scoped = NodeId::disambiguated(&NodeType::Class, "x.Run", Path::new("b/x.py"));
    assert_eq!(scoped.as_str(), "class:x.Run@b/x.py");
    assert_eq!(scoped.parts().unwrap().1, "x.Run");
    assert!(NodeId::from("no-type-here").parts().is_none());
}

#[test]
fn test_node_type_serialization() {
    assert_eq!(serde_json::to_string(&NodeType::Function).unwrap(), "\"function\"");
    let method: NodeType = serde_json::from_str("\"method\"").unwrap();
    assert_eq!(method, NodeType::Function);
    let custom: NodeType = serde_json::from_str("\"route\"").unwrap();
    assert_eq!(custom, NodeType::Other("route".to_string()));
    assert_eq!("imports".parse::<EdgeType>().unwrap(), EdgeType::Imports);
}

#[test]
fn test_upsert_preserves_existing_metadata() {
    let store = GraphStore::new();
    let node = function("a.foo", "a.py").with_meta("decorators", vec!["cached".to_string()]);
    store.upsert_node(node.clone()).unwrap();

    let edited = function("a.foo", "a.py")
        .with_lines(1, 5)
        .with_meta("doc", "Says hello");
    let change = store.upsert_node(edited).unwrap();
    assert!(matches!(change, NodeChange::Updated { changed: true, .. }));

    let stored = store.get_node(&node.id).unwrap();
    assert_eq!(stored.end_line, 5);
    assert!(stored.metadata.contains_key("decorators"));
    assert_eq!(stored.metadata.get("doc"), Some(&MetaValue::from("Says hello")));
}

#[test]
fn test_upsert_rejects_inverted_span() {
    let store = GraphStore::new();
    let node = function("a.foo", "a.py").with_lines(9, 2);
    assert!(matches!(store.upsert_node(node), Err(GraphError::InvalidSpan { .. })));
    assert_eq!(store.stats().nodes, 0);
}

#[test]
fn test_remove_node_cascades_edges() {
    let store = GraphStore::new();
    let foo = function("a.foo", "a.py");
    let bar = function("b.bar", "b.py");
    store.upsert_node(foo.clone()).unwrap();
    store.upsert_node(bar.clone()).unwrap();
    store.upsert_edge(Edge::new(foo.id.clone(), bar.id.clone(), EdgeType::Calls)).unwrap();
    assert_eq!(store.stats().edges, 1);

    let removed = store.remove_node(&bar.id).unwrap();
    assert_eq!(removed.id, bar.id);
    assert!(store.list_edges(&foo.id, Direction::Both, 10, 0).items.is_empty());
    assert_eq!(store.stats().edges, 0);

    // Removing twice is a no-op
    assert!(store.remove_node(&bar.id).is_none());
}

#[test]
fn test_pending_edge_resolves_when_target_appears() {
    let store = GraphStore::new();
    let foo = function("a.foo", "a.py");
    store.upsert_node(foo.clone()).unwrap();

    let change = store
        .upsert_edge(Edge::new(foo.id.clone(), "b.bar", EdgeType::Calls))
        .unwrap();
    assert!(matches!(change, EdgeChange::Pending(_)));
    assert!(store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items.is_empty());
    assert_eq!(store.stats().pending_edges, 1);

    let change = store.upsert_node(function("b.bar", "b.py")).unwrap();
    let NodeChange::Inserted { resolved } = change else {
        panic!("expected insert");
    };
    assert_eq!(resolved.len(), 1);

    let edges = store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target_id, id("function:b.bar"));
    assert_eq!(store.stats().pending_edges, 0);
}

#[test]
fn test_file_batch_replaces_static_edges() {
    let store = GraphStore::new();
    let foo = function("a.foo", "a.py");
    let helper = function("a.helper", "a.py").with_lines(5, 6);

    let outcome = store.apply_file_batch(fresh(
        "a.py",
        vec![foo.clone(), helper.clone()],
        vec![call("a.py", &foo, helper.id.as_str())],
    ));
    assert_eq!(outcome.diff.added_nodes.len(), 2);
    assert_eq!(outcome.diff.added_edges.len(), 1);
    assert_eq!(outcome.diff.sequence, 1);

    let outcome = store.apply_file_batch(existing("a.py", vec![foo.clone(), helper.clone()], vec![]));
    assert_eq!(
        outcome.diff.removed_edges,
        vec![EdgeKey::new(foo.id.clone(), helper.id.clone(), EdgeType::Calls)]
    );
    assert!(outcome.diff.added_nodes.is_empty());
    assert_eq!(outcome.diff.sequence, 2);
    assert_eq!(store.stats().edges, 0);
}

#[test]
fn test_file_batch_removal_parks_callers() {
    let store = Arc::new(GraphStore::new());
    let foo = function("a.foo", "a.py");
    let bar = function("b.bar", "b.py");
    store.apply_file_batch(fresh("b.py", vec![bar.clone()], vec![]));
    store.apply_file_batch(fresh("a.py", vec![foo.clone()], vec![call("a.py", &foo, "b.bar")]));
    assert_eq!(store.stats().edges, 1);

    let mut delete = existing("b.py", vec![], vec![]);
    delete.removals.push(bar.id.clone());
    let outcome = store.apply_file_batch(delete);
    assert_eq!(outcome.diff.removed_nodes, vec![bar.id.clone()]);
    assert_eq!(outcome.removed[0].incoming.len(), 1);
    assert!(store.list_edges(&foo.id, Direction::Both, 10, 0).items.is_empty());

    // The caller's edge comes back once b.bar is defined again
    store.apply_file_batch(fresh("b.py", vec![bar.clone()], vec![]));
    let callees = query(&store).find_functions_called_by(&foo.id, 10).unwrap();
    assert_eq!(callees.len(), 1);
    assert_eq!(callees[0].id, bar.id);
}

#[test]
fn test_fresh_id_collision_is_disambiguated() {
    let store = GraphStore::new();
    store.apply_file_batch(fresh("a/x.py", vec![function("x.run", "a/x.py")], vec![]));
    let outcome = store.apply_file_batch(fresh("b/x.py", vec![function("x.run", "b/x.py")], vec![]));

    assert_eq!(outcome.diff.added_nodes[0].id.as_str(), "function:x.run@b/x.py");
    assert_eq!(store.get_node(&id("function:x.run")).unwrap().file_path, PathBuf::from("a/x.py"));
    assert_eq!(store.stats().nodes, 2);
}

#[test]
fn test_synthetic_placeholder_is_adopted() {
    let store = Arc::new(GraphStore::new());
    let merge = InstrumentationMerge::new(Arc::clone(&store));
    let record = merge.record(&CallObservation::new("a.foo", "b.bar")).unwrap();
    assert!(record.dynamic);
    assert_eq!(record.callee, id("function:b.bar"));
    assert!(store.get_node(&record.callee).unwrap().is_synthetic());

    let outcome = store.apply_file_batch(fresh("b.py", vec![function("b.bar", "b.py")], vec![]));
    assert_eq!(outcome.diff.added_nodes.len(), 1);

    let adopted = store.get_node(&id("function:b.bar")).unwrap();
    assert!(!adopted.is_synthetic());
    assert_eq!(adopted.file_path, PathBuf::from("b.py"));
    assert_eq!(adopted.metadata.get(model::INVOCATIONS_KEY), Some(&MetaValue::Int(1)));
}

#[test]
fn test_observed_call_corroborates_static_edge() {
    let store = Arc::new(GraphStore::new());
    let foo = function("a.foo", "a.py");
    let bar = function("a.bar", "a.py").with_lines(4, 5);
    store.apply_file_batch(fresh("a.py", vec![foo.clone(), bar.clone()], vec![call("a.py", &foo, "a.bar")]));

    let merge = InstrumentationMerge::new(Arc::clone(&store));
    let record = merge
        .record(&CallObservation::new(foo.id.as_str(), "a.bar"))
        .unwrap();
    assert!(!record.dynamic);
    assert_eq!(record.call_count, 1);

    let edge = &store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items[0];
    assert!(!edge.dynamic);
    assert!(edge.dynamic_corroborated);
    assert_eq!(edge.call_count, 1);
}

#[test]
fn test_static_edge_after_dynamic_keeps_count() {
    let store = Arc::new(GraphStore::new());
    let foo = function("a.foo", "a.py");
    let bar = function("a.bar", "a.py").with_lines(4, 5);
    store.apply_file_batch(fresh("a.py", vec![foo.clone(), bar.clone()], vec![]));

    let merge = InstrumentationMerge::new(Arc::clone(&store));
    merge.record(&CallObservation::new("a.foo", "a.bar")).unwrap();
    merge.record(&CallObservation::new("a.foo", "a.bar")).unwrap();

    store.apply_file_batch(existing("a.py", vec![foo.clone(), bar.clone()], vec![call("a.py", &foo, "a.bar")]));
    let edge = &store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items[0];
    assert!(!edge.dynamic);
    assert!(edge.dynamic_corroborated);
    assert_eq!(edge.call_count, 2);

    // Dropping the static evidence keeps the runtime evidence
    store.apply_file_batch(existing("a.py", vec![foo.clone(), bar.clone()], vec![]));
    let edge = &store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items[0];
    assert!(edge.dynamic);
    assert_eq!(edge.call_count, 2);
}

#[test]
fn test_call_counts_are_not_lost_under_concurrency() {
    let store = Arc::new(GraphStore::new());
    let foo = function("a.foo", "a.py");
    let bar = function("a.bar", "a.py").with_lines(4, 5);
    store.apply_file_batch(fresh("a.py", vec![foo.clone(), bar.clone()], vec![call("a.py", &foo, "a.bar")]));
    let merge = InstrumentationMerge::new(Arc::clone(&store));

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let merge = merge.clone();
            let store = Arc::clone(&store);
            let foo = foo.clone();
            scope.spawn(move || {
                for i in 0..500 {
                    merge.record(&CallObservation::new("a.foo", "a.bar")).unwrap();
                    merge.record(&CallObservation::new("a.bar", "b.remote")).unwrap();
                    if worker == 0 && i % 50 == 0 {
                        // Interleave structural writes with the counters
                        store.apply_file_batch(existing(
                            "a.py",
                            vec![foo.clone()],
                            vec![call("a.py", &foo, "a.bar")],
                        ));
                    }
                }
            });
        }
    });

    let edges = store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items;
    assert_eq!(edges[0].call_count, 4000);
    let remote = store.list_edges(&id("function:a.bar"), Direction::Outgoing, 10, 0).items;
    assert_eq!(remote[0].call_count, 4000);
    assert!(remote[0].dynamic);
    assert_eq!(store.stats().synthetic_nodes, 1);
}

#[test]
fn test_last_called_at_only_moves_forward() {
    let store = Arc::new(GraphStore::new());
    let merge = InstrumentationMerge::new(Arc::clone(&store));
    let later = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let earlier = later - Duration::minutes(5);

    merge.record(&CallObservation::new("a.foo", "a.bar").at(later)).unwrap();
    merge.record(&CallObservation::new("a.foo", "a.bar").at(earlier)).unwrap();

    let edge = &store.list_edges(&id("function:a.foo"), Direction::Outgoing, 10, 0).items[0];
    assert_eq!(edge.last_called_at, Some(later));
    assert_eq!(edge.call_count, 2);
}

#[test]
fn test_empty_observation_is_rejected() {
    let store = Arc::new(GraphStore::new());
    let merge = InstrumentationMerge::new(Arc::clone(&store));
    assert!(matches!(
        merge.record(&CallObservation::new(" ", "a.bar")),
        Err(MergeError::EmptyReference("caller"))
    ));
    assert_eq!(store.stats().nodes, 0);
}

#[test]
fn test_record_all_rejects_batch_without_partial_counts() {
    let store = Arc::new(GraphStore::new());
    let merge = InstrumentationMerge::new(Arc::clone(&store));
    let batch = vec![
        CallObservation::new("a.foo", "a.bar"),
        CallObservation::new("a.foo", ""),
        CallObservation::new("a.bar", "a.baz"),
    ];
    assert!(matches!(merge.record_all(&batch), Err(MergeError::EmptyReference("callee"))));
    assert_eq!(store.stats(), GraphStats::default());

    let records = merge.record_all(&[batch[0].clone(), batch[2].clone()]).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(store.stats().edges, 2);
}

#[test]
fn test_pending_edge_keeps_runtime_counters_until_resolved() {
    let store = GraphStore::new();
    let foo = function("a.foo", "a.py");
    store.upsert_node(foo.clone()).unwrap();
    let seen = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

    let mut observed = Edge::observed_call(foo.id.clone(), "b.bar");
    observed.call_count = 5;
    observed.last_called_at = Some(seen);
    let change = store.upsert_edge(observed).unwrap();
    assert!(matches!(change, EdgeChange::Pending(_)));
    let parked = store.view().pending_edges();
    assert!(parked[0].dynamic);
    assert_eq!(parked[0].call_count, 5);

    store.upsert_node(function("b.bar", "b.py")).unwrap();
    let edge = &store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items[0];
    assert_eq!(edge.target_id, id("function:b.bar"));
    assert!(edge.dynamic);
    assert_eq!(edge.call_count, 5);
    assert_eq!(edge.last_called_at, Some(seen));
}

#[test]
fn test_parked_caller_keeps_counts_across_target_file_delete() {
    let store = Arc::new(GraphStore::new());
    let foo = function("a.foo", "a.py");
    let bar = function("b.bar", "b.py");
    store.apply_file_batch(fresh("b.py", vec![bar.clone()], vec![]));
    store.apply_file_batch(fresh("a.py", vec![foo.clone()], vec![call("a.py", &foo, "b.bar")]));
    let merge = InstrumentationMerge::new(Arc::clone(&store));
    merge.record(&CallObservation::new("a.foo", "b.bar")).unwrap();
    merge.record(&CallObservation::new("a.foo", "b.bar")).unwrap();

    let mut delete = existing("b.py", vec![], vec![]);
    delete.removals.push(bar.id.clone());
    store.apply_file_batch(delete);
    assert_eq!(store.view().pending_edges()[0].call_count, 2);

    // A reparse of the caller's file that drops the call keeps the runtime evidence parked
    store.apply_file_batch(existing("a.py", vec![foo.clone()], vec![]));
    let parked = store.view().pending_edges();
    assert_eq!(parked.len(), 1);
    assert!(parked[0].dynamic);

    store.apply_file_batch(fresh("b.py", vec![bar.clone()], vec![]));
    let edge = &store.list_edges(&foo.id, Direction::Outgoing, 10, 0).items[0];
    assert_eq!(edge.call_count, 2);
    assert!(edge.dynamic);
}

#[test]
fn test_unparseable_runtime_metadata_is_kept() {
    let store = GraphStore::new();
    let node = function("a.foo", "a.py")
        .with_meta(model::INVOCATIONS_KEY, "n/a")
        .with_meta(model::LAST_INVOKED_KEY, "yesterday")
        .with_meta("call_count", "user field");
    store.upsert_node(node.clone()).unwrap();

    let stored = store.get_node(&node.id).unwrap();
    assert_eq!(stored.metadata.get(model::INVOCATIONS_KEY), Some(&MetaValue::from("n/a")));
    assert_eq!(stored.metadata.get(model::LAST_INVOKED_KEY), Some(&MetaValue::from("yesterday")));
    assert_eq!(stored.metadata.get("call_count"), Some(&MetaValue::from("user field")));

    let exported = store.export_snapshot();
    let restored = GraphStore::new();
    restored.load_snapshot(exported.clone()).unwrap();
    assert_eq!(restored.export_snapshot().nodes, exported.nodes);
}

fn populated_store() -> Arc<GraphStore> {
    let store = Arc::new(GraphStore::new());
    let foo = function("a.foo", "a.py").with_meta("parameters", vec!["user_id".to_string()]);
    let helper = function("a.helper", "a.py").with_lines(5, 9);
    let bar = function("b.bar", "b.py");
    let model = Node::new(NodeType::Class, "UserModel", "b.UserModel", "b.py").with_lines(5, 20);
    store.apply_file_batch(fresh("b.py", vec![bar.clone(), model], vec![]));
    store.apply_file_batch(fresh(
        "a.py",
        vec![foo.clone(), helper.clone()],
        vec![call("a.py", &foo, "b.bar"), call("a.py", &foo, "a.helper"), call("a.py", &helper, "b.bar")],
    ));
    let merge = InstrumentationMerge::new(Arc::clone(&store));
    merge.record(&CallObservation::new("a.foo", "b.bar")).unwrap();
    store
}

#[test]
fn test_snapshot_round_trip() {
    let store = populated_store();
    store
        .upsert_edge(Edge::new("function:b.bar", "c.unknown", EdgeType::Calls))
        .unwrap();
    let exported = store.export_snapshot();
    let json = exported.to_json().unwrap();

    let restored = GraphStore::new();
    restored.load_snapshot(Snapshot::from_json(&json).unwrap()).unwrap();
    let reexported = restored.export_snapshot();

    assert_eq!(exported.nodes, reexported.nodes);
    assert_eq!(exported.edges, reexported.edges);
    assert_eq!(restored.stats(), store.stats());
    assert_eq!(restored.stats().pending_edges, 1);
}

#[test]
fn test_snapshot_load_failure_keeps_prior_state() {
    let store = populated_store();
    let before = store.stats();

    let duplicate = r#"{"nodes": [
        {"id": "function:x", "node_type": "function", "name": "x"},
        {"id": "function:x", "node_type": "function", "name": "x"}
    ], "edges": []}"#;
    let dangling = r#"{"nodes": [], "edges": [{"source_id": "function:x", "target_id": "function:y", "edge_type": "calls"}]}"#;
    let newer = r#"{"format_version": 99, "nodes": [], "edges": []}"#;

    for (doc, check) in [
        (duplicate, "duplicate"),
        (dangling, "dangling"),
        (newer, "version"),
    ] {
        let snapshot = Snapshot::from_json(doc).unwrap();
        let err = store.load_snapshot(snapshot).unwrap_err();
        match check {
            "duplicate" => assert!(matches!(err, SnapshotError::DuplicateNode(_))),
            "dangling" => assert!(matches!(err, SnapshotError::DanglingSource { .. })),
            _ => assert!(matches!(err, SnapshotError::UnsupportedVersion { found: 99, .. })),
        }
    }
    assert!(matches!(Snapshot::from_json(r#"{"nodes": []}"#), Err(SnapshotError::Malformed(_))));
    assert_eq!(store.stats(), before);
}

#[test]
fn test_snapshot_upgrades_legacy_documents() {
    let legacy = r#"{
        "nodes": [
            {"id": "a.foo", "type": "function", "name": "foo", "filepath": "a.py", "start_line": 1, "end_line": 2},
            {"id": "", "type": "class", "name": "Bar", "filepath": "a.py"},
            {"type": "variable", "name": "LIMIT", "qualified_name": "a.LIMIT", "filepath": "a.py"}
        ],
        "edges": [{"source": "a.foo", "target": "class:Bar", "type": "uses"}]
    }"#;
    let store = GraphStore::new();
    store.load_snapshot(Snapshot::from_json(legacy).unwrap()).unwrap();

    let foo = store.get_node(&id("a.foo")).unwrap();
    assert_eq!(foo.qualified_name, "foo");
    assert_eq!(foo.file_path, PathBuf::from("a.py"));
    assert!(store.get_node(&id("class:Bar")).is_some());
    assert!(store.get_node(&id("variable:a.LIMIT")).is_some());
    assert_eq!(store.list_edges(&id("a.foo"), Direction::Outgoing, 10, 0).total, 1);
    assert_eq!(store.export_snapshot().format_version, snapshot::FORMAT_VERSION);
}

#[test]
fn test_save_and_read_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = snapshot_path(dir.path(), Path::new(".trellis/graph.json"));
    assert!(read_snapshot(&path).unwrap().is_none());

    let store = populated_store();
    save_snapshot(&store.export_snapshot(), &path).unwrap();
    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());

    let loaded = read_snapshot(&path).unwrap().unwrap();
    assert_eq!(loaded.nodes.len(), store.stats().nodes);

    clear_state(dir.path()).unwrap();
    assert!(!state_dir(dir.path()).exists());
}

#[test]
fn test_pagination_is_bounded_and_complete() {
    let store = Arc::new(GraphStore::new());
    let nodes: Vec<Node> = (0..25).map(|i| function(&format!("m.f{:02}", i), "m.py")).collect();
    store.apply_file_batch(fresh("m.py", nodes, vec![]));
    let query = query(&store);

    let mut seen = Vec::new();
    let mut offset = Some(0);
    while let Some(start) = offset {
        let page = query.list_nodes(&NodeFilter::default(), 10, start).unwrap();
        assert!(page.items.len() <= 10);
        assert_eq!(page.total, 25);
        seen.extend(page.items.into_iter().map(|n| n.id));
        offset = page.next_offset;
    }
    assert_eq!(seen.len(), 25);
    let mut sorted = seen.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, seen);

    assert!(matches!(
        query.list_nodes(&NodeFilter::default(), 0, 0),
        Err(QueryError::InvalidLimit { limit: 0, .. })
    ));
    assert!(matches!(
        query.search_nodes("f", 101),
        Err(QueryError::InvalidLimit { max: 100, .. })
    ));
    assert!(query.list_nodes(&NodeFilter::default(), 10, 40).unwrap().items.is_empty());
}

#[test]
fn test_list_nodes_filters() {
    let store = populated_store();
    let query = query(&store);

    let classes = query.nodes_by_type(NodeType::Class, 10, 0).unwrap();
    assert_eq!(classes.total, 1);
    assert_eq!(classes.items[0].name, "UserModel");

    let in_a = query.nodes_by_filepath(Path::new("a.py"), 10, 0).unwrap();
    assert_eq!(in_a.total, 2);

    let filter = NodeFilter {
        name: Some("HELP".to_string()),
        ..Default::default()
    };
    assert_eq!(query.list_nodes(&filter, 10, 0).unwrap().items[0].id, id("function:a.helper"));
}

#[test]
fn test_search_nodes_ranks_by_match() {
    let store = populated_store();
    let query = query(&store);

    let hits = query.search_nodes("user model", 5).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, id("class:b.UserModel"));

    let by_file = query.search_nodes("b", 10).unwrap();
    assert!(by_file.iter().any(|n| n.id == id("function:b.bar")));
    assert!(query.search_nodes("nothing", 5).unwrap().is_empty());
}

#[test]
fn test_call_queries() {
    let store = populated_store();
    let query = query(&store);

    let callers = query.find_functions_calling(&id("function:b.bar"), 10).unwrap();
    let ids: Vec<_> = callers.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["function:a.foo", "function:a.helper"]);

    let callees = query.find_functions_called_by(&id("function:a.foo"), 1).unwrap();
    assert_eq!(callees.len(), 1);

    assert!(matches!(
        query.find_functions_called_by(&id("function:missing"), 10),
        Err(QueryError::NotFound(_))
    ));
    assert!(matches!(query.get_node_details(&id("function:missing")), Err(QueryError::NotFound(_))));

    let edges = query
        .list_edges_for_node(&id("function:b.bar"), Direction::Incoming, 10, 0)
        .unwrap();
    assert_eq!(edges.total, 2);
    let counted = edges.items.iter().find(|e| e.source_id == id("function:a.foo")).unwrap();
    assert!(counted.dynamic_corroborated);
}

#[test]
fn test_extended_function_queries() {
    let store = populated_store();
    let query = query(&store);

    let by_param = query.find_functions_by_keyword("user_id", 10).unwrap();
    assert_eq!(by_param.len(), 1);
    assert_eq!(by_param[0].id, id("function:a.foo"));

    let by_name = query.find_functions_by_keyword("BAR", 10).unwrap();
    assert_eq!(by_name[0].id, id("function:b.bar"));

    let callers = query.find_functions_calling_filepath(Path::new("b.py"), 10).unwrap();
    assert_eq!(callers.len(), 2);
    assert!(callers.iter().all(|n| n.file_path == PathBuf::from("a.py")));
}

#[test]
fn test_remove_edges_for_file() {
    let store = populated_store();
    // a.foo -> b.bar carries a runtime count and survives as dynamic
    assert_eq!(store.remove_edges_for_file(Path::new("a.py")), 2);
    let remaining = store.list_edges(&id("function:a.foo"), Direction::Outgoing, 10, 0).items;
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].dynamic);
}

#[test]
fn test_config_defaults_and_overrides() {
    let config = TrellisConfig::default();
    assert_eq!(config.rename.similarity_threshold, 0.7);
    assert_eq!(config.query.default_limit, 10);
    assert_eq!(config.storage.snapshot_path, PathBuf::from(".trellis/graph.json"));

    let mut config = TrellisConfig::from_toml_str(
        r#"
        [rename]
        similarity_threshold = 0.85

        [server]
        port = 9000
        "#,
    )
    .unwrap();
    assert_eq!(config.rename.similarity_threshold, 0.85);
    assert!(config.rename.match_qualified_name);
    assert_eq!(config.server.port, 9000);

    config
        .apply_env(|key| match key {
            "TRELLIS_PORT" => Some("8123".to_string()),
            "TRELLIS_HOST" => Some("0.0.0.0".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.server.port, 8123);
    assert_eq!(config.server.host, "0.0.0.0");

    let bad_port = config.apply_env(|key| (key == "TRELLIS_PORT").then(|| "eighty".to_string()));
    assert!(matches!(bad_port, Err(ConfigError::Invalid { .. })));

    config.rename.similarity_threshold = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_load_from_root() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(".trellis.toml"),
        "[query]\nmax_page_size = 50\ndefault_limit = 5\n",
    )
    .unwrap();
    let config = TrellisConfig::load(dir.path()).unwrap();
    assert_eq!(config.query.max_page_size, 50);
    assert_eq!(config.query.default_limit, 5);

    std::fs::write(dir.path().join(".trellis.toml"), "[query\n").unwrap();
    assert!(matches!(TrellisConfig::load(dir.path()), Err(ConfigError::Parse(_))));
}
