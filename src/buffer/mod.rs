//! Deferred-update buffering for the spatial index.
//!
//! Insertions and deletions accumulate in an [`UpdateBuffer`] until a
//! capacity threshold trips, then are applied to the tree either by
//! piggybacking on traversals or by a dedicated bulk-reload pass.

mod reload;
mod tree;

pub use reload::{BulkReloadOutcome, BulkReloader};
pub use tree::{BufferedTree, BufferedTreeOptions};

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Result, SelvaError};
use crate::spatial::{Rect, SpatialEntry};
use crate::tracer::{ObjectTracer, TraceOp};

/// Tag of a buffered operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OpKind {
    /// The entry is to be added to the index.
    Insertion,
    /// The entry is to be removed from the index.
    Deletion,
}

impl OpKind {
    /// The cancelling counterpart of this kind.
    pub fn opposite(self) -> Self {
        match self {
            Self::Insertion => Self::Deletion,
            Self::Deletion => Self::Insertion,
        }
    }
}

/// A staged operation awaiting application to the tree.
#[derive(Clone, Copy, Debug)]
pub struct PendingOp {
    /// Monotonic sequence number; survivors keep first-in-first-out order.
    pub seq: u64,
    /// Operation tag.
    pub kind: OpKind,
    /// The spatial entry the operation concerns.
    pub entry: SpatialEntry,
    /// Whether the operation has reached the persistent structure.
    ///
    /// Set during a flush as each operation lands; a retried flush only
    /// re-applies operations still unapplied.
    pub applied: bool,
}

/// Phases of a buffered batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferState {
    /// No pending operations.
    Empty,
    /// Operations are being collected.
    Accumulating,
    /// A flush has been requested.
    FlushPending,
    /// Pending operations are being piggybacked onto traversals.
    PiggybackApplying,
    /// Remaining operations are being applied by a dedicated pass.
    BulkReloading,
}

impl BufferState {
    fn may_become(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (Empty, Accumulating)
                | (Accumulating, FlushPending)
                | (FlushPending, PiggybackApplying)
                | (FlushPending, BulkReloading)
                | (PiggybackApplying, BulkReloading)
                | (PiggybackApplying, Empty)
                | (BulkReloading, Empty)
                | (Empty, FlushPending)
        )
    }
}

/// Counters describing a buffer's lifetime activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferStats {
    /// Insertions accepted.
    pub staged_insertions: u64,
    /// Deletions accepted.
    pub staged_deletions: u64,
    /// Pending deletions cancelled by a later insertion.
    pub annihilations_insertion_deletion: u64,
    /// Pending insertions cancelled by a later deletion.
    pub annihilations_deletion_insertion: u64,
    /// Operations applied by piggybacking on traversals.
    pub piggybacked: u64,
    /// Operations applied by bulk-reload passes.
    pub bulk_applied: u64,
}

/// Accumulates pending insert/delete operations, cancelling opposite
/// operations on the same id and preserving FIFO order among survivors.
pub struct UpdateBuffer {
    pending: FxHashMap<u64, PendingOp>,
    next_seq: u64,
    max_ops: usize,
    state: BufferState,
    stats: BufferStats,
    tracer: Arc<dyn ObjectTracer>,
}

impl UpdateBuffer {
    /// Creates a buffer holding at most `max_ops` pending operations.
    pub fn new(max_ops: usize, tracer: Arc<dyn ObjectTracer>) -> Self {
        Self {
            pending: FxHashMap::default(),
            next_seq: 0,
            max_ops: max_ops.max(1),
            state: BufferState::Empty,
            stats: BufferStats::default(),
            tracer,
        }
    }

    /// Current phase of the buffered batch.
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Lifetime activity counters.
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True once the configured capacity is reached; callers must flush
    /// before staging more work.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_ops
    }

    /// Moves the batch to `next`, rejecting transitions the state machine
    /// does not allow.
    pub fn transition(&mut self, next: BufferState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.may_become(next) {
            return Err(SelvaError::InvalidArgument(format!(
                "buffer cannot move from {:?} to {next:?}",
                self.state
            )));
        }
        trace!(from = ?self.state, to = ?next, "buffer state transition");
        self.state = next;
        Ok(())
    }

    /// Stages an operation, cancelling an opposite pending operation on
    /// the same id instead of growing the buffer.
    ///
    /// Returns an error when the buffer is full; the caller flushes and
    /// retries (backpressure).
    pub fn stage(&mut self, kind: OpKind, entry: SpatialEntry) -> Result<()> {
        match kind {
            OpKind::Insertion => {
                self.tracer.trace_object(&entry, TraceOp::InsertToBuffer);
                self.stats.staged_insertions += 1;
            }
            OpKind::Deletion => {
                self.tracer.trace_object(&entry, TraceOp::RemoveFromBuffer);
                self.stats.staged_deletions += 1;
            }
        }

        if let Some(existing) = self.pending.get(&entry.id) {
            if existing.applied {
                // The earlier operation already reached the tree; it only
                // awaits completion bookkeeping. Retire it and stage the new
                // operation on its own, never cancel against it.
                let done = self.pending.remove(&entry.id).expect("pending op present");
                self.tracer
                    .trace_update_entry(done.kind, &done.entry, TraceOp::CompleteOperation, None);
            } else if existing.kind == kind.opposite() {
                let cancelled = self
                    .pending
                    .remove(&entry.id)
                    .expect("pending op present");
                match kind {
                    OpKind::Insertion => self.stats.annihilations_insertion_deletion += 1,
                    OpKind::Deletion => self.stats.annihilations_deletion_insertion += 1,
                }
                self.tracer.trace_update_entry(
                    cancelled.kind,
                    &cancelled.entry,
                    TraceOp::Annihilation,
                    Some(cancelled.seq),
                );
                if self.pending.is_empty() {
                    self.state = BufferState::Empty;
                }
                return Ok(());
            }
        }

        if self.is_full() {
            return Err(SelvaError::CapacityExhausted(
                "update buffer is full".into(),
            ));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        // A same-kind restage replaces the earlier operation but keeps its
        // position in the replay order.
        let seq = match self.pending.get(&entry.id) {
            Some(existing) => existing.seq,
            None => seq,
        };
        self.pending.insert(
            entry.id,
            PendingOp {
                seq,
                kind,
                entry,
                applied: false,
            },
        );
        self.transition(BufferState::Accumulating)?;
        Ok(())
    }

    /// Pending operations in staging order.
    pub fn ops_in_order(&self) -> Vec<PendingOp> {
        let mut ops: Vec<PendingOp> = self.pending.values().copied().collect();
        ops.sort_unstable_by_key(|op| op.seq);
        ops
    }

    /// Unapplied pending operations in staging order.
    pub fn unapplied_in_order(&self) -> Vec<PendingOp> {
        let mut ops: Vec<PendingOp> = self
            .pending
            .values()
            .filter(|op| !op.applied)
            .copied()
            .collect();
        ops.sort_unstable_by_key(|op| op.seq);
        ops
    }

    /// Unapplied operations whose rectangles intersect `region`.
    pub fn unapplied_overlapping(&self, region: &Rect) -> Vec<PendingOp> {
        let mut ops: Vec<PendingOp> = self
            .pending
            .values()
            .filter(|op| !op.applied && op.entry.mbr.intersects(region))
            .copied()
            .collect();
        ops.sort_unstable_by_key(|op| op.seq);
        ops
    }

    /// Smallest rectangle covering all unapplied operations.
    pub fn unapplied_bounds(&self) -> Option<Rect> {
        self.pending
            .values()
            .filter(|op| !op.applied)
            .map(|op| op.entry.mbr)
            .reduce(|acc, mbr| acc.union(&mbr))
    }

    /// Marks an operation as applied to the persistent structure.
    pub fn mark_applied(&mut self, id: u64, via_piggyback: bool) {
        if let Some(op) = self.pending.get_mut(&id) {
            if !op.applied {
                op.applied = true;
                if via_piggyback {
                    self.stats.piggybacked += 1;
                } else {
                    self.stats.bulk_applied += 1;
                }
            }
        }
    }

    /// Returns the batch to accumulation after a failed flush.
    ///
    /// Applied marks survive, so the retried flush only re-applies the
    /// unapplied remainder.
    pub fn abort_flush(&mut self) {
        self.state = if self.pending.is_empty() {
            BufferState::Empty
        } else {
            BufferState::Accumulating
        };
    }

    /// Drops applied operations from the buffer, tracing their completion.
    pub fn drain_applied(&mut self) {
        let drained: Vec<PendingOp> = self
            .pending
            .values()
            .filter(|op| op.applied)
            .copied()
            .collect();
        for op in drained {
            self.pending.remove(&op.entry.id);
            self.tracer.trace_update_entry(
                op.kind,
                &op.entry,
                TraceOp::CompleteOperation,
                None,
            );
        }
        if self.pending.is_empty() && self.state == BufferState::Accumulating {
            self.state = BufferState::Empty;
        }
    }
}
