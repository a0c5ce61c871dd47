use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferStats, BufferedTree, BufferedTreeOptions};
use crate::config::EngineOptions;
use crate::error::Result;
use crate::pager::{FilePageStore, MemoryPageStore, PageStore};
use crate::record::{RecordManager, RecordManagerOptions};
use crate::spatial::{RTree, RTreeOptions, Rect, SpatialEntry};
use crate::tracer::ObjectTracer;

/// Buffered spatial index behind a single exclusive section.
///
/// Mutations and flushes serialize on one lock, acquired in scope and
/// released on every exit path; queries go through the same lock because
/// reads are stateful (page cache, piggybacking). No background threads:
/// flushes run inline when the buffer threshold trips.
pub struct SpatialEngine<S: PageStore> {
    inner: Mutex<BufferedTree<S>>,
    tracer: Arc<dyn ObjectTracer>,
}

impl SpatialEngine<MemoryPageStore> {
    /// Opens an engine over a transient in-memory store.
    pub fn in_memory(options: EngineOptions) -> Result<Self> {
        let store = MemoryPageStore::with_page_size(options.page_size);
        Self::with_store(store, options)
    }
}

impl SpatialEngine<FilePageStore> {
    /// Opens an engine over a file-backed store at `path`.
    pub fn open(path: &Path, options: EngineOptions) -> Result<Self> {
        let store = FilePageStore::open_with_config(path, options.page_size, options.cache_pages)?;
        Self::with_store(store, options)
    }
}

impl<S: PageStore> SpatialEngine<S> {
    /// Builds the storage stack over an explicit store.
    pub fn with_store(store: S, options: EngineOptions) -> Result<Self> {
        let records = RecordManager::new(
            store,
            options.build_strategy(),
            RecordManagerOptions {
                id_strategy: options.id_strategy,
                reserved_bytes: options.reserved_bytes,
            },
        )?;
        let tree = RTree::new(
            records,
            RTreeOptions {
                min_entries: options.min_node_entries,
                max_entries: options.max_node_entries,
            },
        )?;
        let buffered = BufferedTree::new(
            tree,
            BufferedTreeOptions {
                max_pending_ops: options.max_pending_ops,
                query_piggybacking: options.query_piggybacking,
                flush_piggybacking: options.flush_piggybacking,
            },
            Arc::clone(&options.tracer),
        );
        Ok(Self {
            inner: Mutex::new(buffered),
            tracer: options.tracer,
        })
    }

    /// Inserts an entry, flushing inline if the buffer is full.
    pub fn insert(&self, entry: SpatialEntry) -> Result<()> {
        self.inner.lock().insert(entry)
    }

    /// Removes an entry, flushing inline if the buffer is full.
    pub fn remove(&self, entry: SpatialEntry) -> Result<()> {
        self.inner.lock().remove(entry)
    }

    /// Returns entries intersecting `region`, buffered work included.
    pub fn query(&self, region: &Rect) -> Result<Vec<SpatialEntry>> {
        self.inner.lock().query(region)
    }

    /// Forces the buffer to empty.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    /// Everything the index logically contains.
    pub fn contents(&self) -> Result<Vec<SpatialEntry>> {
        self.inner.lock().contents()
    }

    /// Number of operations currently buffered.
    pub fn pending_ops(&self) -> usize {
        self.inner.lock().pending_ops()
    }

    /// Buffer activity counters.
    pub fn buffer_stats(&self) -> BufferStats {
        self.inner.lock().buffer_stats()
    }

    /// Marks an object id for tracing.
    pub fn trace_object_id(&self, id: u64) {
        self.tracer.register_object(id);
    }

    /// Verifies tree bounding-rectangle containment.
    pub fn check_invariants(&self) -> Result<()> {
        self.inner.lock().tree_mut().check_invariants()
    }

    /// Serializes the placement strategy's resumable state.
    pub fn placement_state(&self) -> Result<Vec<u8>> {
        self.inner.lock().tree_mut().records_mut().strategy_state()
    }

    /// Restores placement-strategy state before further operations.
    pub fn restore_placement_state(&self, state: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .tree_mut()
            .records_mut()
            .restore_strategy_state(state)
    }

    /// Flushes buffered pages of the backing store.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().tree_mut().records_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::CountingTracer;
    use std::sync::atomic::Ordering;

    fn entry(id: u64) -> SpatialEntry {
        let x = (id % 8) as f64 * 4.0;
        let y = (id / 8) as f64 * 4.0;
        SpatialEntry::new(Rect::new([x, y], [x + 1.5, y + 1.5]), id)
    }

    #[test]
    fn engine_round_trips_inserts_and_queries() {
        let engine = SpatialEngine::in_memory(EngineOptions::new().page_size(1024))
            .expect("open engine");
        for id in 0..64u64 {
            engine.insert(entry(id)).expect("insert");
        }
        engine.flush().expect("flush");
        engine.check_invariants().expect("invariants");

        let hits = engine
            .query(&Rect::new([0.0, 0.0], [6.0, 6.0]))
            .expect("query");
        assert!(!hits.is_empty());
        for hit in hits {
            assert!(hit.mbr.intersects(&Rect::new([0.0, 0.0], [6.0, 6.0])));
        }
    }

    #[test]
    fn engine_exposes_tracer_registration() {
        let tracer = Arc::new(CountingTracer::new());
        let engine = SpatialEngine::in_memory(
            EngineOptions::new().page_size(1024).tracer(tracer.clone()),
        )
        .expect("open engine");

        engine.trace_object_id(3);
        for id in 0..8u64 {
            engine.insert(entry(id)).expect("insert");
        }
        engine.flush().expect("flush");
        assert!(
            tracer.buffer_events.load(Ordering::Relaxed) >= 1,
            "registered id was observed"
        );
    }
}
