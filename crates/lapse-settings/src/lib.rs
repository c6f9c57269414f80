//! Camera configuration model.
//!
//! The camera exposes its settings as a tree of widgets. This crate flattens
//! that tree into addressable leaf entries, normalizes user supplied values
//! per entry kind and stages a batch of changes so that either every value is
//! written or none is.

mod error;
mod model;
mod normalize;
mod tree;
mod value;

pub use error::ValidationError;
pub use model::{apply, query, stage, ConfigStore};
pub use normalize::{aligns_to_step, normalize, snap_to_step, StepPolicy};
pub use tree::{flatten, ConfigNode, RangeBounds, SettingEntry, SettingKind};
pub use value::{RawValue, SettingValue};
