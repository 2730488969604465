//! Cancellation, engine faults and progress reporting

use permshift_core::{
    BatchState, ChangeEngine, ChangeRequest, EngineConfig, MemoryOps, MemoryStore, MetadataStore,
    Mode, NodeState, Outcome, Ownership, PathEnumerator, Progress, Target,
};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn state(user: &str) -> NodeState {
    NodeState::new(Ownership::new(user, "staff"), Mode::from_bits(0o644))
}

/// Flat directory with `files` entries, every node owned by alice
fn flat_tree(ops: &MemoryOps, files: usize) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..files {
        fs::write(temp_dir.path().join(format!("f{:03}.txt", i)), b"x").unwrap();
    }
    for node in PathEnumerator::new(temp_dir.path()).flatten() {
        ops.insert(node.path, state("alice"));
    }
    temp_dir
}

#[test]
fn test_cancel_after_k_mutations() {
    const K: u64 = 3;
    let ops = Arc::new(MemoryOps::new());
    let store = Arc::new(MemoryStore::new());
    let tree = flat_tree(&ops, 20);
    let config = EngineConfig::default()
        .with_concurrency(1)
        .with_queue_capacity(64);
    let engine = ChangeEngine::new(ops.clone(), store.clone(), config).unwrap();

    let id = engine
        .create(ChangeRequest::new(tree.path(), Target::owner("carol")))
        .unwrap();
    {
        let engine = engine.clone();
        ops.set_hook(move |_, count| {
            if count == K {
                engine.cancel(id).unwrap();
            }
        });
    }
    engine.launch(id).unwrap();
    let report = engine.wait(id).unwrap();

    let counts = report.counts();
    assert_eq!(report.batch.state, BatchState::Cancelled);
    assert_eq!(counts.changed, K);
    assert_eq!(counts.unchanged, 0);
    assert_eq!(counts.errored, 0);
    assert_eq!(counts.not_attempted, counts.seen - K);
    assert_eq!(report.entries.len() as u64, counts.seen);
    assert_eq!(ops.mutations(), K);

    // Store writes only for the nodes that actually changed
    let snapshots = store.snapshots_for_batch(id).unwrap();
    assert_eq!(snapshots.len() as u64, K);
    for entry in report.with_outcome("not attempted") {
        assert!(store.snapshot_for(id, &entry.path).unwrap().is_none());
        assert_eq!(ops.state(&entry.path).unwrap(), state("alice"));
    }

    let stored = store.find_batch(&id.to_string()).unwrap().unwrap();
    assert_eq!(stored.state, BatchState::Cancelled);
    assert_eq!(stored.counts, counts);
}

#[test]
fn test_cancel_before_launch_processes_nothing() {
    let ops = Arc::new(MemoryOps::new());
    let store = Arc::new(MemoryStore::new());
    let tree = flat_tree(&ops, 5);
    let engine = ChangeEngine::new(ops.clone(), store, EngineConfig::default()).unwrap();

    let id = engine
        .create(ChangeRequest::new(tree.path(), Target::owner("carol")))
        .unwrap();
    engine.cancel(id).unwrap();
    engine.launch(id).unwrap();
    let report = engine.wait(id).unwrap();

    assert_eq!(report.batch.state, BatchState::Cancelled);
    assert_eq!(report.counts().seen, 0);
    assert!(report.entries.is_empty());
    assert_eq!(ops.mutations(), 0);
}

#[test]
fn test_store_outage_fails_batch() {
    let ops = Arc::new(MemoryOps::new());
    let store = Arc::new(MemoryStore::new());
    let tree = flat_tree(&ops, 10);
    let config = EngineConfig::default().with_concurrency(2);
    let engine = ChangeEngine::new(ops.clone(), store.clone(), config).unwrap();

    let id = engine
        .create(ChangeRequest::new(tree.path(), Target::owner("carol")))
        .unwrap();
    store.set_unavailable(true);
    engine.launch(id).unwrap();
    let report = engine.wait(id).unwrap();

    assert_eq!(report.batch.state, BatchState::Failed);
    assert!(report.batch.fault.is_some());
    assert_eq!(report.counts().changed, 0);
    assert_eq!(ops.mutations(), 0);
    assert_eq!(report.counts().reported(), report.counts().seen);
    assert!(report
        .entries
        .iter()
        .all(|e| matches!(e.outcome, Outcome::Error(_) | Outcome::NotAttempted)));
    assert_eq!(engine.progress(id).unwrap().state, BatchState::Failed);
}

#[test]
fn test_progress_is_pushed_and_pollable() {
    let ops = Arc::new(MemoryOps::new());
    let store = Arc::new(MemoryStore::new());
    let tree = flat_tree(&ops, 30);
    let config = EngineConfig::default()
        .with_concurrency(3)
        .with_progress_every(10);
    let engine = ChangeEngine::new(ops, store, config).unwrap();

    let pushed: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let pushed = pushed.clone();
        engine.set_progress_callback(move |progress| {
            pushed.lock().unwrap().push(*progress);
        });
    }

    let report = engine
        .run(ChangeRequest::new(tree.path(), Target::owner("carol")))
        .unwrap();

    // 31 outcomes at a cadence of 10, plus the closing push
    let pushed = pushed.lock().unwrap();
    assert_eq!(pushed.len(), 4);
    let last = pushed.last().unwrap();
    assert_eq!(last.state, BatchState::Completed);
    assert_eq!(last.changed, 31);
    assert_eq!(last.in_flight, 0);

    let polled = engine.progress(report.batch.id).unwrap();
    assert_eq!(polled, *last);
}

#[test]
fn test_max_depth_limits_enumeration() {
    let ops = Arc::new(MemoryOps::new());
    let store = Arc::new(MemoryStore::new());
    let temp_dir = TempDir::new().unwrap();
    let deep = temp_dir.path().join("one").join("two").join("three");
    fs::create_dir_all(&deep).unwrap();
    fs::write(deep.join("leaf.txt"), b"x").unwrap();
    for node in PathEnumerator::new(temp_dir.path()).flatten() {
        ops.insert(node.path, state("alice"));
    }

    let config = EngineConfig::default().with_max_depth(Some(2));
    let engine = ChangeEngine::new(ops.clone(), store, config).unwrap();
    let report = engine
        .run(ChangeRequest::new(temp_dir.path(), Target::owner("carol")))
        .unwrap();

    // root, one, one/two
    assert_eq!(report.counts().changed, 3);
    assert_eq!(
        ops.state(&deep.join("leaf.txt")).unwrap().owner.user,
        "alice"
    );
    assert!(report.entry(Path::new(&deep)).is_none());
}
