use std::sync::Arc;

use crate::pager::{DEFAULT_CACHE_SIZE, DEFAULT_PAGE_SIZE};
use crate::record::{BestFitEmptiest, FirstFit, Hybrid, IdStrategyKind, PlacementStrategy};
use crate::tracer::{default_tracer, ObjectTracer};

/// Built-in placement policies selectable at engine construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlacementKind {
    /// First page in map order with room.
    FirstFit,
    /// Tightest fit among the N emptiest pages; misses force a new page.
    BestFitEmptiest,
    /// Best-fit first, first-fit fallback.
    Hybrid,
}

/// Configuration supplied when opening a [`crate::engine::SpatialEngine`].
#[derive(Clone)]
pub struct EngineOptions {
    /// Page size of the backing store.
    pub page_size: usize,
    /// Page cache capacity for file-backed stores.
    pub cache_pages: usize,
    /// Placement policy for record pages.
    pub placement: PlacementKind,
    /// N for the best-fit-on-emptiest policies.
    pub emptiest_tracked: usize,
    /// Id-management variant of the record manager.
    pub id_strategy: IdStrategyKind,
    /// Bytes per page withheld from placement.
    pub reserved_bytes: usize,
    /// Minimum tree node fill after a split.
    pub min_node_entries: usize,
    /// Maximum entries per tree node.
    pub max_node_entries: usize,
    /// Buffered operations that trigger an inline flush.
    pub max_pending_ops: usize,
    /// Apply pending work onto leaves visited by queries.
    pub query_piggybacking: bool,
    /// Run a piggyback sweep before the bulk pass of a flush.
    pub flush_piggybacking: bool,
    /// Observer for buffer and flush lifecycle events.
    pub tracer: Arc<dyn ObjectTracer>,
}

impl EngineOptions {
    /// Creates options with defaults suitable for most workloads.
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_SIZE,
            placement: PlacementKind::Hybrid,
            emptiest_tracked: 8,
            id_strategy: IdStrategyKind::Mapped,
            reserved_bytes: 0,
            min_node_entries: 2,
            max_node_entries: 8,
            max_pending_ops: 64,
            query_piggybacking: true,
            flush_piggybacking: true,
            tracer: default_tracer(),
        }
    }

    /// Sets the store page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the file-store page cache capacity.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Selects the placement policy.
    pub fn placement(mut self, kind: PlacementKind) -> Self {
        self.placement = kind;
        self
    }

    /// Sets N for the best-fit-on-emptiest policies.
    pub fn emptiest_tracked(mut self, n: usize) -> Self {
        self.emptiest_tracked = n;
        self
    }

    /// Selects the id-management variant.
    pub fn id_strategy(mut self, kind: IdStrategyKind) -> Self {
        self.id_strategy = kind;
        self
    }

    /// Withholds `bytes` per page from placement.
    pub fn reserved_bytes(mut self, bytes: usize) -> Self {
        self.reserved_bytes = bytes;
        self
    }

    /// Sets tree node fill bounds.
    pub fn node_entries(mut self, min: usize, max: usize) -> Self {
        self.min_node_entries = min;
        self.max_node_entries = max;
        self
    }

    /// Sets the buffered-operation count that triggers a flush.
    pub fn max_pending_ops(mut self, ops: usize) -> Self {
        self.max_pending_ops = ops;
        self
    }

    /// Enables or disables piggybacking on query traversals.
    pub fn query_piggybacking(mut self, enabled: bool) -> Self {
        self.query_piggybacking = enabled;
        self
    }

    /// Enables or disables the piggyback sweep before bulk reloads.
    pub fn flush_piggybacking(mut self, enabled: bool) -> Self {
        self.flush_piggybacking = enabled;
        self
    }

    /// Installs an observer for buffer and flush events.
    pub fn tracer(mut self, tracer: Arc<dyn ObjectTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Builds the configured placement strategy.
    pub fn build_strategy(&self) -> Box<dyn PlacementStrategy> {
        match self.placement {
            PlacementKind::FirstFit => Box::new(FirstFit::new()),
            PlacementKind::BestFitEmptiest => Box::new(BestFitEmptiest::new(self.emptiest_tracked)),
            PlacementKind::Hybrid => {
                Box::new(Hybrid::best_fit_then_first_fit(self.emptiest_tracked))
            }
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}
