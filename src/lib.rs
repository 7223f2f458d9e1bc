//! Transform service - point lookups in chunked volumes and neuroglancer
//! segment properties compiled from SeaTable rows.
//!
//! This library provides shared types and modules for the server binary.

pub mod annotations;
pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod seatable;
pub mod volume;

pub use config::Config;
pub use error::ServiceError;
pub use models::{Dtype, ScalarField, ScalarValues};
