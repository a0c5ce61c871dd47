//! Selva: a buffered spatial index engine.
//!
//! Records live in fixed-size pages behind a pluggable placement strategy;
//! an R-tree stores its nodes through that record layer; index updates are
//! deferred in an annihilating operation buffer and applied either by
//! piggybacking on traversals that happen anyway or by dedicated
//! bulk-reload passes.

#![warn(missing_docs)]

/// Deferred-update buffering and the buffered tree facade.
pub mod buffer;
/// Engine configuration.
pub mod config;
/// The top-level engine facade.
pub mod engine;
/// Error types shared across the crate.
pub mod error;
/// Tracing subscriber setup.
pub mod logging;
/// Fixed-size page storage.
pub mod pager;
/// Page-based record storage with placement strategies.
pub mod record;
/// Spatial primitives and the R-tree.
pub mod spatial;
/// Observability hooks for buffer and flush lifecycles.
pub mod tracer;

pub use buffer::{BufferState, BufferStats, BufferedTree, BufferedTreeOptions, OpKind, UpdateBuffer};
pub use config::{EngineOptions, PlacementKind};
pub use engine::SpatialEngine;
pub use error::{Result, SelvaError};
pub use pager::{FilePageStore, MemoryPageStore, PageId, PageStore};
pub use record::{
    BestFitEmptiest, FirstFit, Hybrid, IdStrategyKind, PlacementStrategy, RecordId, RecordManager,
    RecordManagerOptions,
};
pub use spatial::{RTree, RTreeOptions, Rect, SpatialEntry};
pub use tracer::{CountingTracer, NoopTracer, ObjectTracer, TraceOp};
