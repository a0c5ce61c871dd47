use std::sync::Arc;

use tracing::debug;

use crate::buffer::{BufferState, BufferStats, BulkReloader, OpKind, UpdateBuffer};
use crate::error::Result;
use crate::pager::PageStore;
use crate::spatial::{RTree, Rect, SpatialEntry};
use crate::tracer::{ObjectTracer, TraceOp};

/// Behavior switches for a [`BufferedTree`].
#[derive(Clone, Copy, Debug)]
pub struct BufferedTreeOptions {
    /// Pending operations that trigger an inline flush.
    pub max_pending_ops: usize,
    /// Apply pending work onto leaves visited by queries.
    pub query_piggybacking: bool,
    /// Run a piggyback sweep before the bulk pass of a flush.
    pub flush_piggybacking: bool,
}

impl Default for BufferedTreeOptions {
    fn default() -> Self {
        Self {
            max_pending_ops: 64,
            query_piggybacking: true,
            flush_piggybacking: true,
        }
    }
}

/// Spatial index whose updates are deferred through an [`UpdateBuffer`].
///
/// Inserts and deletes stage into the buffer; when the buffer fills, the
/// next update flushes inline (backpressure). Queries see buffered and
/// applied state merged, and opportunistically apply pending work to the
/// leaves they visit anyway.
pub struct BufferedTree<S: PageStore> {
    tree: RTree<S>,
    buffer: UpdateBuffer,
    reloader: BulkReloader,
    opts: BufferedTreeOptions,
}

impl<S: PageStore> BufferedTree<S> {
    /// Wraps `tree` with buffering per `opts`, reporting to `tracer`.
    pub fn new(tree: RTree<S>, opts: BufferedTreeOptions, tracer: Arc<dyn ObjectTracer>) -> Self {
        Self {
            tree,
            buffer: UpdateBuffer::new(opts.max_pending_ops, Arc::clone(&tracer)),
            reloader: BulkReloader::new(tracer),
            opts,
        }
    }

    /// Stages an insertion, flushing first when the buffer is full.
    pub fn insert(&mut self, entry: SpatialEntry) -> Result<()> {
        self.make_room()?;
        self.buffer.stage(OpKind::Insertion, entry)
    }

    /// Stages a deletion, flushing first when the buffer is full.
    pub fn remove(&mut self, entry: SpatialEntry) -> Result<()> {
        self.make_room()?;
        self.buffer.stage(OpKind::Deletion, entry)
    }

    fn make_room(&mut self) -> Result<()> {
        if self.buffer.is_full() {
            debug!(
                pending = self.buffer.len(),
                "buffer full, flushing before accepting more work"
            );
            self.flush()?;
        }
        Ok(())
    }

    /// Returns entries intersecting `region`, buffered operations included.
    pub fn query(&mut self, region: &Rect) -> Result<Vec<SpatialEntry>> {
        if self.opts.query_piggybacking && !self.buffer.is_empty() {
            self.piggyback_leaves(region)?;
            self.buffer.drain_applied();
        }

        let mut results = self.tree.query(region)?;
        for op in self.buffer.ops_in_order() {
            match op.kind {
                OpKind::Deletion => results.retain(|e| e.id != op.entry.id),
                OpKind::Insertion => {
                    if op.entry.mbr.intersects(region)
                        && !results.iter().any(|e| e.id == op.entry.id)
                    {
                        results.push(op.entry);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Applies every pending operation to the tree.
    ///
    /// A failure mid-flush leaves already-applied operations marked, so a
    /// retried flush applies only the remainder.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.flush_inner();
        if result.is_err() {
            self.buffer.abort_flush();
        }
        result
    }

    fn flush_inner(&mut self) -> Result<()> {
        self.buffer.transition(BufferState::FlushPending)?;

        if self.opts.flush_piggybacking {
            self.buffer.transition(BufferState::PiggybackApplying)?;
            if let Some(bounds) = self.buffer.unapplied_bounds() {
                self.piggyback_leaves(&bounds)?;
            }
            self.buffer.drain_applied();
        }

        self.buffer.transition(BufferState::BulkReloading)?;
        self.reloader.run(&mut self.tree, &mut self.buffer)?;
        self.buffer.drain_applied();
        self.buffer.transition(BufferState::Empty)?;
        Ok(())
    }

    /// Applies pending operations onto leaves intersecting `region` that a
    /// traversal visits anyway.
    ///
    /// Deletions apply wherever their target is found, leaving ancestors
    /// loose rather than rewriting them; insertions apply only where the
    /// leaf's current rectangle already covers them, so no ancestor needs
    /// to grow.
    fn piggyback_leaves(&mut self, region: &Rect) -> Result<()> {
        let Self {
            tree,
            buffer,
            reloader,
            ..
        } = self;
        let max_entries = tree.node_capacity();
        let tracer = reloader.tracer();
        tree.traverse_leaves(region, |visit, entries| {
            let mut modified = false;
            for op in buffer.unapplied_overlapping(&visit.mbr) {
                match op.kind {
                    OpKind::Deletion => {
                        let Some(pos) = entries.iter().position(|e| e.id == op.entry.id) else {
                            continue;
                        };
                        // Never empty a leaf here; structural cleanup
                        // belongs to the dedicated pass.
                        if entries.len() <= 1 {
                            continue;
                        }
                        entries.remove(pos);
                        buffer.mark_applied(op.entry.id, true);
                        tracer.trace_update_entry(
                            op.kind,
                            &op.entry,
                            TraceOp::LeafNodePiggybacking,
                            Some(visit.node),
                        );
                        modified = true;
                    }
                    OpKind::Insertion => {
                        if entries.len() < max_entries
                            && visit.mbr.contains(&op.entry.mbr)
                            && !entries.iter().any(|e| e.id == op.entry.id)
                        {
                            entries.push(op.entry);
                            buffer.mark_applied(op.entry.id, true);
                            tracer.trace_update_entry(
                                op.kind,
                                &op.entry,
                                TraceOp::LeafNodePiggybacking,
                                Some(visit.node),
                            );
                            modified = true;
                        }
                    }
                }
            }
            Ok(modified)
        })
    }

    /// Every entry the index logically contains: tree contents overlaid
    /// with pending operations.
    pub fn contents(&mut self) -> Result<Vec<SpatialEntry>> {
        let mut all = self.tree.iter_all()?;
        for op in self.buffer.ops_in_order() {
            match op.kind {
                OpKind::Deletion => all.retain(|e| e.id != op.entry.id),
                OpKind::Insertion => {
                    if !all.iter().any(|e| e.id == op.entry.id) {
                        all.push(op.entry);
                    }
                }
            }
        }
        Ok(all)
    }

    /// Number of operations currently buffered.
    pub fn pending_ops(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer activity counters.
    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Current phase of the buffered batch.
    pub fn buffer_state(&self) -> BufferState {
        self.buffer.state()
    }

    /// The underlying tree.
    pub fn tree_mut(&mut self) -> &mut RTree<S> {
        &mut self.tree
    }
}
