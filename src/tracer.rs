use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::buffer::OpKind;
use crate::spatial::SpatialEntry;

/// Lifecycle points at which buffered operations can be observed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TraceOp {
    /// An insertion was staged into the update buffer.
    InsertToBuffer,
    /// A deletion was staged into the update buffer.
    RemoveFromBuffer,
    /// Two opposite pending operations on the same id cancelled out.
    Annihilation,
    /// A group of operations started descending the tree.
    GroupUpdateStart,
    /// A pending operation joined a descending group whose region covers it.
    IndexNodePiggybacking,
    /// A pending operation was applied while a leaf node was being visited.
    LeafNodePiggybacking,
    /// A pending operation was durably applied and left the buffer.
    CompleteOperation,
    /// An ancestor region was rewritten during the bulk reload first pass.
    BulkReloadFirstPassWrite,
    /// An ancestor region was re-tightened during the bulk reload second pass.
    BulkReloadSecondPassWrite,
}

/// Classes grouping [`TraceOp`] values for coarse counting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceClass {
    /// Buffer staging and completion events.
    Buffer,
    /// Piggybacked applications.
    Piggybacking,
    /// Bulk reload passes.
    BulkReload,
}

impl TraceOp {
    /// Maps an operation to its trace class.
    pub fn class(self) -> TraceClass {
        match self {
            TraceOp::InsertToBuffer
            | TraceOp::RemoveFromBuffer
            | TraceOp::Annihilation
            | TraceOp::GroupUpdateStart
            | TraceOp::CompleteOperation => TraceClass::Buffer,
            TraceOp::IndexNodePiggybacking | TraceOp::LeafNodePiggybacking => {
                TraceClass::Piggybacking
            }
            TraceOp::BulkReloadFirstPassWrite | TraceOp::BulkReloadSecondPassWrite => {
                TraceClass::BulkReload
            }
        }
    }
}

/// Observer for data objects moving through buffer and tree operations.
///
/// Tracers are pure observers: implementations must not influence buffer
/// state or operation ordering, and must accept every call without
/// panicking.
pub trait ObjectTracer: Send + Sync {
    /// Adds an object id to the set of ids being traced.
    fn register_object(&self, id: u64);

    /// Reports an entry observed at a lifecycle point.
    fn trace_object(&self, entry: &SpatialEntry, op: TraceOp);

    /// Reports a buffered operation observed at a lifecycle point.
    ///
    /// `context` carries event-specific detail, such as the group index a
    /// bulk-reload write belongs to.
    fn trace_update_entry(
        &self,
        kind: OpKind,
        entry: &SpatialEntry,
        op: TraceOp,
        context: Option<u64>,
    );
}

/// Tracer that discards every event.
#[derive(Default)]
pub struct NoopTracer;

impl ObjectTracer for NoopTracer {
    fn register_object(&self, _id: u64) {}
    fn trace_object(&self, _entry: &SpatialEntry, _op: TraceOp) {}
    fn trace_update_entry(
        &self,
        _kind: OpKind,
        _entry: &SpatialEntry,
        _op: TraceOp,
        _context: Option<u64>,
    ) {
    }
}

/// Tracer that counts events per class with relaxed atomics.
///
/// Only events for registered ids are counted; registering no ids counts
/// everything.
#[derive(Default)]
pub struct CountingTracer {
    registered: Mutex<FxHashSet<u64>>,
    /// Buffer staging and completion events observed.
    pub buffer_events: AtomicU64,
    /// Piggybacked applications observed.
    pub piggybacking_events: AtomicU64,
    /// Bulk reload writes observed.
    pub bulk_reload_events: AtomicU64,
}

impl CountingTracer {
    /// Creates a tracer counting all objects.
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self, id: u64) -> bool {
        let registered = self.registered.lock();
        registered.is_empty() || registered.contains(&id)
    }

    fn bump(&self, op: TraceOp) {
        match op.class() {
            TraceClass::Buffer => self.buffer_events.fetch_add(1, Ordering::Relaxed),
            TraceClass::Piggybacking => self.piggybacking_events.fetch_add(1, Ordering::Relaxed),
            TraceClass::BulkReload => self.bulk_reload_events.fetch_add(1, Ordering::Relaxed),
        };
    }
}

impl ObjectTracer for CountingTracer {
    fn register_object(&self, id: u64) {
        self.registered.lock().insert(id);
    }

    fn trace_object(&self, entry: &SpatialEntry, op: TraceOp) {
        if self.counts(entry.id) {
            self.bump(op);
        }
    }

    fn trace_update_entry(
        &self,
        _kind: OpKind,
        entry: &SpatialEntry,
        op: TraceOp,
        _context: Option<u64>,
    ) {
        if self.counts(entry.id) {
            self.bump(op);
        }
    }
}

/// Returns the default tracer wrapped in an [`Arc`].
pub fn default_tracer() -> Arc<dyn ObjectTracer> {
    Arc::new(NoopTracer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::Rect;

    fn entry(id: u64) -> SpatialEntry {
        SpatialEntry::new(Rect::new([0.0, 0.0], [1.0, 1.0]), id)
    }

    #[test]
    fn noop_tracer_accepts_all_calls() {
        let tracer = NoopTracer;
        tracer.register_object(7);
        tracer.trace_object(&entry(7), TraceOp::InsertToBuffer);
        tracer.trace_update_entry(
            OpKind::Deletion,
            &entry(7),
            TraceOp::BulkReloadSecondPassWrite,
            Some(3),
        );
    }

    #[test]
    fn counting_tracer_counts_per_class() {
        let tracer = CountingTracer::new();
        tracer.trace_object(&entry(1), TraceOp::InsertToBuffer);
        tracer.trace_object(&entry(2), TraceOp::RemoveFromBuffer);
        tracer.trace_update_entry(OpKind::Insertion, &entry(1), TraceOp::IndexNodePiggybacking, None);
        tracer.trace_update_entry(
            OpKind::Insertion,
            &entry(1),
            TraceOp::BulkReloadSecondPassWrite,
            Some(0),
        );
        assert_eq!(tracer.buffer_events.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.piggybacking_events.load(Ordering::Relaxed), 1);
        assert_eq!(tracer.bulk_reload_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn counting_tracer_filters_on_registered_ids() {
        let tracer = CountingTracer::new();
        tracer.register_object(5);
        tracer.trace_object(&entry(5), TraceOp::InsertToBuffer);
        tracer.trace_object(&entry(6), TraceOp::InsertToBuffer);
        assert_eq!(tracer.buffer_events.load(Ordering::Relaxed), 1);
    }
}
