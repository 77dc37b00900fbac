//! Core data model definitions shared across flagstream crates.

pub mod flag;
pub mod item;
pub mod segment;

pub use flag::{Clause, FeatureFlag, FlagRule, Prerequisite, VariationOrRollout};
pub use item::{DataKind, FullDataSet, KindAndKey, StoreItem, Tombstone};
pub use segment::{Segment, SegmentRule};
