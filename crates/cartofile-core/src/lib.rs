//! Core traits, types, and error types for the cartofile feature store.
//!
//! This crate defines the shared interfaces (`GeometrySource`, `AttributeSource`,
//! `FeatureSource`), the predicate/query model, sibling-file-set handling,
//! configuration, and the workspace-wide error type (`StoreError`) used across
//! all cartofile crates.
//!
//! It has minimal external dependencies and is intended to be depended on by
//! every other crate in the workspace.

pub mod config;
pub mod error;
pub mod files;
pub mod predicate;
pub mod screen_map;
pub mod tracing_config;
pub mod traits;
pub mod types;

pub use config::{DEFAULT_SPATIAL_CACHE_BYTES, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use files::{FID_INDEX_EXT, SPATIAL_INDEX_EXT, SiblingFiles};
pub use predicate::{Predicate, Query};
pub use screen_map::ScreenMap;
pub use traits::{AttributeSource, FeatureSource, GeometrySource};
pub use types::{Candidate, Envelope, FeatureId, FeatureRow, Value};
