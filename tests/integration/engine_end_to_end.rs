#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use selva::{
    CountingTracer, EngineOptions, PlacementKind, Rect, SpatialEngine, SpatialEntry,
};
use tempfile::tempdir;

fn entry(id: u64) -> SpatialEntry {
    let x = (id % 25) as f64 * 3.0;
    let y = (id / 25) as f64 * 3.0;
    SpatialEntry::new(Rect::new([x, y], [x + 2.0, y + 2.0]), id)
}

fn everywhere() -> Rect {
    Rect::new([-1e9, -1e9], [1e9, 1e9])
}

#[test]
fn file_backed_engine_survives_a_mixed_workload() {
    let _ = selva::logging::init_logging("warn");
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("index.selva");

    let engine = SpatialEngine::open(
        &path,
        EngineOptions::new()
            .page_size(512)
            .max_pending_ops(32)
            .placement(PlacementKind::Hybrid),
    )
    .expect("open engine");

    let mut reference = BTreeSet::new();
    for id in 0..500u64 {
        engine.insert(entry(id)).expect("insert");
        reference.insert(id);
        if id % 5 == 0 {
            engine.remove(entry(id)).expect("remove");
            reference.remove(&id);
        }
    }
    engine.flush().expect("flush");
    engine.check_invariants().expect("invariants");
    assert_eq!(engine.pending_ops(), 0);

    let got: BTreeSet<u64> = engine
        .contents()
        .expect("contents")
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(got, reference);

    // Region queries agree with a reference filter.
    let region = Rect::new([10.0, 10.0], [40.0, 30.0]);
    let mut hits: Vec<u64> = engine
        .query(&region)
        .expect("query")
        .iter()
        .map(|e| e.id)
        .collect();
    hits.sort_unstable();
    let mut want: Vec<u64> = reference
        .iter()
        .copied()
        .filter(|&id| entry(id).mbr.intersects(&region))
        .collect();
    want.sort_unstable();
    assert_eq!(hits, want);

    engine.sync().expect("sync to disk");
}

#[test]
fn buffered_updates_are_visible_before_any_flush() {
    let engine = SpatialEngine::in_memory(
        EngineOptions::new()
            .page_size(1024)
            .max_pending_ops(1024)
            .query_piggybacking(false),
    )
    .expect("open engine");

    engine.insert(entry(7)).expect("insert");
    let hits = engine.query(&everywhere()).expect("query");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 7);

    engine.remove(entry(7)).expect("remove");
    assert!(engine.query(&everywhere()).expect("query").is_empty());
    assert_eq!(
        engine.buffer_stats().annihilations_deletion_insertion,
        1,
        "the delete annihilated the buffered insert"
    );
}

#[test]
fn tracer_observes_piggybacking_and_bulk_passes() {
    let tracer = Arc::new(CountingTracer::new());
    let engine = SpatialEngine::in_memory(
        EngineOptions::new()
            .page_size(1024)
            .max_pending_ops(16)
            .tracer(tracer.clone()),
    )
    .expect("open engine");

    for id in 0..120u64 {
        engine.insert(entry(id)).expect("insert");
    }
    // Queries between batches give piggybacking a traversal to ride on.
    for id in 120..140u64 {
        engine.remove(entry(id % 120)).expect("remove");
        let _ = engine.query(&everywhere()).expect("query");
    }
    engine.flush().expect("flush");

    use std::sync::atomic::Ordering;
    assert!(tracer.buffer_events.load(Ordering::Relaxed) > 0);
    assert!(tracer.bulk_reload_events.load(Ordering::Relaxed) > 0);
    engine.check_invariants().expect("invariants");
}

#[test]
fn strategy_state_round_trips_through_the_engine() {
    let engine = SpatialEngine::in_memory(
        EngineOptions::new()
            .page_size(1024)
            .placement(PlacementKind::BestFitEmptiest)
            .emptiest_tracked(4),
    )
    .expect("open engine");

    for id in 0..60u64 {
        engine.insert(entry(id)).expect("insert");
    }
    engine.flush().expect("flush");

    let state = engine.placement_state().expect("serialize placement state");
    engine
        .restore_placement_state(&state)
        .expect("restore placement state");

    let err = engine.restore_placement_state(&[0xAB, 0xCD]).unwrap_err();
    assert!(matches!(
        err,
        selva::SelvaError::Corruption(_) | selva::SelvaError::Serialization(_)
    ));
}
