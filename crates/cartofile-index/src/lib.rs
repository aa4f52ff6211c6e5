//! Sibling index files and query planning for a file-backed feature store.
//!
//! A geometry file gets two optional siblings: a `.fix` FID index mapping
//! stable feature identities to record positions, and a `.qix` quadtree over
//! record envelopes. The [`IndexedStore`] orchestrator decides per query
//! whether either index helps, keeps both fresh on writable stores, and
//! degrades to a forward scan whenever an index is missing or broken.
//!
//! Layout:
//!
//! - [`fid`]: `.fix` format, interpolation-search reader, rewrite sessions.
//! - [`quadtree`]: `.qix` format, in-memory and memory-mapped search.
//! - [`builder`]: spatial index construction from a geometry stream.
//! - [`reader`]: candidate refinement and feature-row assembly.
//! - [`store`]: the per-query access-path decision.

pub mod builder;
pub mod fid;
pub mod quadtree;
pub mod reader;
pub mod store;

pub use builder::SpatialIndexer;
pub use fid::{FidEntry, FidIndexReader, FidIndexWriter};
pub use quadtree::{MappedQuadTree, QuadTree};
pub use reader::{Candidates, FeatureReader, FidSource};
pub use store::IndexedStore;
