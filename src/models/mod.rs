//! Core data models: element types, typed scalar fields and wire formats.

pub mod binary;
pub mod dtype;
pub mod points;

pub use binary::BinaryFormat;
pub use dtype::{Dtype, ScalarField, ScalarValues};
pub use points::{ColumnPointList, MappedPoint, PointList};
