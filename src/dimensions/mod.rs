//! Dimension universe, dimension graphs, data coordinates and records.
//!
//! The universe is supplied by configuration and never mutated; everything
//! else here is a value type derived from it.

mod coordinate;
mod graph;
mod record;
mod universe;

pub use coordinate::{DataCoordinate, DataIdValue};
pub use graph::DimensionGraph;
pub use record::{DataIdKey, DimensionRecord, RecordInput};
pub use universe::{
    DimensionConfig, DimensionElement, DimensionUniverse, ElementConfig, ElementRef, KeyField,
    KeyType, MetadataField,
};
