#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use selva::{
    CountingTracer, EngineOptions, NoopTracer, ObjectTracer, Rect, SpatialEngine, SpatialEntry,
};

fn entry(id: u64) -> SpatialEntry {
    let x = (id % 31) as f64 * 2.5;
    let y = (id % 13) as f64 * 2.5;
    SpatialEntry::new(Rect::new([x, y], [x + 1.0, y + 1.0]), id)
}

fn run_workload(
    seed: u64,
    tracer: Arc<dyn ObjectTracer>,
    query_piggybacking: bool,
) -> (BTreeSet<u64>, BTreeSet<u64>) {
    let engine = SpatialEngine::in_memory(
        EngineOptions::new()
            .page_size(1024)
            .max_pending_ops(24)
            .query_piggybacking(query_piggybacking)
            .tracer(tracer),
    )
    .expect("open engine");

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut reference: BTreeSet<u64> = BTreeSet::new();
    for step in 0..600u64 {
        let id = rng.gen_range(0..150u64);
        if reference.contains(&id) && rng.gen_bool(0.45) {
            engine.remove(entry(id)).expect("remove");
            reference.remove(&id);
        } else if !reference.contains(&id) {
            engine.insert(entry(id)).expect("insert");
            reference.insert(id);
        }
        if step % 37 == 0 {
            // Queries along the way give piggybacking traversals to use.
            let region = Rect::new([0.0, 0.0], [30.0, 30.0]);
            let hits = engine.query(&region).expect("query");
            let want: BTreeSet<u64> = reference
                .iter()
                .copied()
                .filter(|&id| entry(id).mbr.intersects(&region))
                .collect();
            let got: BTreeSet<u64> = hits.iter().map(|e| e.id).collect();
            assert_eq!(got, want, "query agrees with reference mid-workload");
        }
    }
    engine.flush().expect("final flush");
    engine.check_invariants().expect("invariants");
    assert_eq!(engine.pending_ops(), 0, "flush drained the buffer");

    let contents: BTreeSet<u64> = engine
        .contents()
        .expect("contents")
        .iter()
        .map(|e| e.id)
        .collect();
    (contents, reference)
}

#[test]
fn flushed_index_matches_reference_set_exactly() {
    for seed in [1u64, 7, 23] {
        let (contents, reference) = run_workload(seed, Arc::new(NoopTracer), true);
        assert_eq!(
            contents, reference,
            "every accepted operation applied exactly once (seed {seed})"
        );
    }
}

#[test]
fn piggybacking_does_not_change_results() {
    let (with_piggyback, reference_a) = run_workload(99, Arc::new(NoopTracer), true);
    let (without_piggyback, reference_b) = run_workload(99, Arc::new(NoopTracer), false);
    assert_eq!(reference_a, reference_b, "workloads are deterministic");
    assert_eq!(
        with_piggyback, without_piggyback,
        "piggybacking is an optimization, not a semantic change"
    );
}

#[test]
fn attaching_a_tracer_is_observably_pure() {
    let counting = Arc::new(CountingTracer::new());
    let (with_tracer, _) = run_workload(5, counting.clone(), true);
    let (with_noop, _) = run_workload(5, Arc::new(NoopTracer), true);
    assert_eq!(with_tracer, with_noop, "tracer never alters buffer or tree state");

    use std::sync::atomic::Ordering;
    assert!(counting.buffer_events.load(Ordering::Relaxed) > 0);
    assert!(
        counting.bulk_reload_events.load(Ordering::Relaxed) > 0,
        "bulk passes were observed"
    );
}

#[test]
fn annihilation_counters_reflect_cancelled_pairs() {
    let engine = SpatialEngine::in_memory(
        EngineOptions::new().page_size(1024).max_pending_ops(256),
    )
    .expect("open engine");

    // Insert-then-delete while buffered: net zero operations applied.
    for id in 0..20u64 {
        engine.insert(entry(id)).expect("insert");
        engine.remove(entry(id)).expect("remove");
    }
    assert_eq!(engine.pending_ops(), 0);
    let stats = engine.buffer_stats();
    assert_eq!(stats.annihilations_deletion_insertion, 20);

    engine.flush().expect("flush");
    assert!(engine.contents().expect("contents").is_empty());
}
