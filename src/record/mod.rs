//! Page-based record storage.
//!
//! A [`RecordManager`] maps logical record ids to slotted-page locations,
//! chains oversize records across pages with link records, and delegates
//! page choice to a pluggable [`PlacementStrategy`].

mod info;
mod manager;
/// Slotted-page layout over raw page buffers.
pub mod page;
mod slot;
mod strategy;

pub use info::{PageInfo, PageTable};
pub use manager::{
    Entries, IdStrategyKind, Objects, RecordCursor, RecordId, RecordManager,
    RecordManagerOptions, RecordPointer,
};
pub use page::RecordPage;
pub use slot::{encode_record, RecordHeader, RecordKind, LINK_POINTER_SIZE, RECORD_HEADER_SIZE};
pub use strategy::{BestFitEmptiest, FirstFit, Hybrid, PlacementStrategy, RecordDelta};
