//! Incremental-reuse and consistency invariants: cache hits skip embedding,
//! deletions are atomic, dimension changes abort, cancellation resumes.

mod helpers;

use codequarry_core::types::CancelToken;
use codequarry_core::{Error, Store};
use helpers::{hash_config, indexer_with_embedder, CountingEmbedder, TestProject};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn store_at(project: &TestProject) -> Arc<Store> {
    Arc::new(Store::open(&codequarry_core::config::db_path(project.root())).unwrap())
}

#[test]
fn unchanged_files_are_not_re_embedded() {
    let project = TestProject::new();
    project.write("a.rs", "fn alpha() { beta(); }\n");
    project.write("b.rs", "fn beta() {}\n");

    let config = hash_config();
    let store = store_at(&project);
    let embedder = Arc::new(CountingEmbedder::new(64));
    let indexer = indexer_with_embedder(project.root(), &config, store.clone(), embedder.clone());

    let report = indexer.index(false, &CancelToken::new(), None).unwrap();
    assert_eq!(report.files_indexed, 2);
    let first_calls = embedder.calls.load(Ordering::SeqCst);
    assert!(first_calls > 0);
    let stats_before = store.get_stats().unwrap();

    // Second run with nothing changed: all cached, zero embedding calls.
    let report = indexer.index(false, &CancelToken::new(), None).unwrap();
    assert_eq!(report.files_indexed, 0);
    assert_eq!(report.files_cached, 2);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), first_calls, "no new embedding calls");

    let stats_after = store.get_stats().unwrap();
    assert_eq!(stats_before.total_chunks, stats_after.total_chunks);
    assert_eq!(stats_before.total_symbols, stats_after.total_symbols);
    assert_eq!(stats_before.total_references, stats_after.total_references);
}

#[test]
fn config_hash_change_invalidates_cache() {
    let project = TestProject::new();
    project.write("a.rs", "fn alpha() {}\n");

    let config = hash_config();
    let store = store_at(&project);
    let embedder = Arc::new(CountingEmbedder::new(64));
    let indexer = indexer_with_embedder(project.root(), &config, store.clone(), embedder.clone());
    indexer.index(false, &CancelToken::new(), None).unwrap();

    // Same content, materially different config: the file is stale again.
    let mut changed = hash_config();
    changed.chunking.strategy = "lines".into();
    let indexer = indexer_with_embedder(project.root(), &changed, store, embedder);
    let report = indexer.index(false, &CancelToken::new(), None).unwrap();
    assert_eq!(report.files_cached, 0);
    assert_eq!(report.files_indexed, 1);
}

#[test]
fn deleted_files_lose_all_rows() {
    let project = TestProject::new();
    project.write("keep.rs", "fn keep() {}\n");
    project.write("gone.rs", "fn gone() { keep(); }\n");
    project.index();

    let engine = project.engine();
    let stats = engine.store.get_stats().unwrap();
    assert_eq!(stats.indexed_files, 2);
    drop(engine);

    std::fs::remove_file(project.root().join("gone.rs")).unwrap();
    let report = project.index();
    assert_eq!(report.files_deleted, 1);

    let engine = project.engine();
    let stats = engine.store.get_stats().unwrap();
    assert_eq!(stats.indexed_files, 1);
    let symbols = engine.store.find_symbols("gone", None, 10).unwrap();
    assert!(symbols.is_empty(), "deleted file's symbols must be gone");
    let callers = engine.graph.get_callers("keep", 10).unwrap();
    assert!(callers.is_empty(), "deleted file's references must be gone");
}

#[test]
fn dimension_change_aborts_non_forced_run() {
    let project = TestProject::new();
    project.write("a.rs", "fn alpha() {}\n");

    let config = hash_config();
    let store = store_at(&project);
    let indexer = indexer_with_embedder(
        project.root(),
        &config,
        store.clone(),
        Arc::new(CountingEmbedder::new(64)),
    );
    indexer.index(false, &CancelToken::new(), None).unwrap();
    let stats_before = store.get_stats().unwrap();

    // A different model with a different dimension invalidates the cache, so
    // the next run has work to do and must trip the dimension guard.
    let mut changed = hash_config();
    changed.embedding.model = "other-model".into();
    let indexer = indexer_with_embedder(
        project.root(),
        &changed,
        store.clone(),
        Arc::new(CountingEmbedder::new(128)),
    );
    match indexer.index(false, &CancelToken::new(), None) {
        Err(Error::DimensionMismatch { expected, actual }) => {
            assert_eq!(expected, 64);
            assert_eq!(actual, 128);
        }
        other => panic!("expected dimension mismatch, got {other:?}"),
    }

    // Data intact.
    let stats_after = store.get_stats().unwrap();
    assert_eq!(stats_before.total_chunks, stats_after.total_chunks);

    // A forced run adopts the new dimension and re-embeds everything.
    let report = indexer.index(true, &CancelToken::new(), None).unwrap();
    assert_eq!(report.files_indexed, 1);
    assert_eq!(store.get_metadata().unwrap().unwrap().embedding_dimensions, 128);
}

#[test]
fn canceled_run_resumes_where_it_left_off() {
    let project = TestProject::new();
    let total = 40usize;
    for i in 0..total {
        project.write(&format!("src/f{i:02}.rs"), &format!("fn func_{i}() {{ work_{i}(); }}\n"));
    }

    let config = hash_config();
    let store = store_at(&project);
    let embedder = Arc::new(CountingEmbedder::new(64));
    let indexer = indexer_with_embedder(project.root(), &config, store.clone(), embedder);

    // Cancel partway through via the progress callback.
    let cancel = CancelToken::new();
    let cancel_trigger = cancel.clone();
    let progress = move |event: &codequarry_core::ProgressEvent| {
        if event.processed_files >= 5 {
            cancel_trigger.cancel();
        }
    };
    let progress: &codequarry_core::index::ProgressCallback = &progress;
    let report = indexer.index(false, &cancel, Some(progress)).unwrap();
    assert!(report.interrupted);
    let first = report.files_indexed;
    assert!(first < total, "run should stop early, indexed {first}");

    // Resume: the second run processes at most the remaining files.
    let report = indexer.index(false, &CancelToken::new(), None).unwrap();
    assert!(!report.interrupted);
    assert_eq!(report.files_cached, first);
    assert_eq!(report.files_indexed, total - first);

    let stats = store.get_stats().unwrap();
    assert_eq!(stats.indexed_files, total);
}

#[test]
fn empty_and_unparseable_files_do_not_fail_the_run() {
    let project = TestProject::new();
    project.write("ok.rs", "fn fine() {}\n");
    project.write("empty.rs", "");
    project.write("broken.rs", "fn fn fn {{{ ::: )))\n");
    let report = project.index();

    // Every file lands in the cache; the broken one degrades to line chunks.
    assert_eq!(report.files_indexed + report.files_failed, 3);
    assert_eq!(report.files_failed, 0, "warnings: {:?}", report.warnings);

    let engine = project.engine();
    let symbols = engine.store.find_symbols("fine", None, 10).unwrap();
    assert_eq!(symbols.len(), 1);
}
