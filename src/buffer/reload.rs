use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::{OpKind, PendingOp, UpdateBuffer};
use crate::error::Result;
use crate::pager::PageStore;
use crate::spatial::{RTree, SpatialEntry};
use crate::tracer::{ObjectTracer, TraceOp};

/// Group key for operations no root child covers.
const ORPHAN_GROUP: u64 = u64::MAX;

/// Outcome of a bulk-reload pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct BulkReloadOutcome {
    /// Operations applied by the pass.
    pub applied: usize,
    /// Ancestor nodes rewritten by the second, re-tightening pass.
    pub retightened: usize,
}

/// Applies buffered operations not piggybacked by flush time in a
/// dedicated pass.
///
/// Operations are grouped by the root child whose rectangle covers them;
/// each group descends once, in staging order. A second pass re-tightens
/// ancestor rectangles, since piggybacked leaf rewrites may have left
/// them stale.
pub struct BulkReloader {
    tracer: Arc<dyn ObjectTracer>,
}

impl BulkReloader {
    /// Creates a reloader reporting to `tracer`.
    pub fn new(tracer: Arc<dyn ObjectTracer>) -> Self {
        Self { tracer }
    }

    /// The tracer this reloader reports to.
    pub fn tracer(&self) -> Arc<dyn ObjectTracer> {
        Arc::clone(&self.tracer)
    }

    /// Runs the pass, marking every applied operation in `buffer`.
    ///
    /// Already-applied operations are skipped, so a retry after a partial
    /// failure only applies the remainder.
    pub fn run<S: PageStore>(
        &self,
        tree: &mut RTree<S>,
        buffer: &mut UpdateBuffer,
    ) -> Result<BulkReloadOutcome> {
        let ops = buffer.unapplied_in_order();
        if ops.is_empty() {
            return Ok(BulkReloadOutcome::default());
        }

        let children = tree.root_children()?;
        let mut groups: BTreeMap<u64, Vec<PendingOp>> = BTreeMap::new();
        for op in ops {
            let key = children
                .iter()
                .find(|child| child.mbr.contains(&op.entry.mbr))
                .map(|child| child.id)
                .unwrap_or(ORPHAN_GROUP);
            groups.entry(key).or_default().push(op);
        }

        // Orphans whose rectangle still overlaps a descending group join it
        // instead of forcing a separate root-level descent.
        if let Some(orphans) = groups.remove(&ORPHAN_GROUP) {
            let mut remaining = Vec::new();
            for op in orphans {
                let host = children.iter().find(|child| {
                    groups.contains_key(&child.id) && child.mbr.intersects(&op.entry.mbr)
                });
                match host {
                    Some(child) => {
                        self.tracer.trace_update_entry(
                            op.kind,
                            &op.entry,
                            TraceOp::IndexNodePiggybacking,
                            Some(child.id),
                        );
                        groups
                            .get_mut(&child.id)
                            .expect("host group exists")
                            .push(op);
                    }
                    None => remaining.push(op),
                }
            }
            if !remaining.is_empty() {
                groups.insert(ORPHAN_GROUP, remaining);
            }
        }

        debug!(
            groups = groups.len(),
            ops = groups.values().map(Vec::len).sum::<usize>(),
            "bulk reload pass starting"
        );

        let mut outcome = BulkReloadOutcome::default();
        for (group_key, group) in groups {
            for op in &group {
                self.tracer.trace_update_entry(
                    op.kind,
                    &op.entry,
                    TraceOp::GroupUpdateStart,
                    Some(group_key),
                );
            }
            for op in group {
                match op.kind {
                    OpKind::Insertion => tree.insert(op.entry)?,
                    OpKind::Deletion => {
                        // A deletion finding nothing is complete: the pair
                        // never reached the tree.
                        let _ = tree.delete(&op.entry)?;
                    }
                }
                self.tracer.trace_update_entry(
                    op.kind,
                    &op.entry,
                    TraceOp::BulkReloadFirstPassWrite,
                    Some(group_key),
                );
                buffer.mark_applied(op.entry.id, false);
                outcome.applied += 1;
            }
        }

        let tracer = Arc::clone(&self.tracer);
        outcome.retightened = tree.retighten(|visit| {
            tracer.trace_object(
                &SpatialEntry::new(visit.mbr, visit.node),
                TraceOp::BulkReloadSecondPassWrite,
            );
        })?;
        debug!(
            applied = outcome.applied,
            retightened = outcome.retightened,
            "bulk reload pass finished"
        );
        Ok(outcome)
    }
}
