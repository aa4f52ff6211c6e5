//! Tracing conventions for cartofile.
//!
//! All cartofile crates emit `tracing` spans and events under a stable target
//! prefix; consumers bring their own subscriber. This module centralizes the
//! targets and span names so filters stay consistent:
//!
//! ```text
//! RUST_LOG=cartofile=debug
//! ```

/// Target prefix shared by all cartofile tracing spans and events.
pub const TARGET_PREFIX: &str = "cartofile";

/// Event and span targets, one per subsystem stage.
pub mod targets {
    /// Query planning: access-path decision and candidate counts.
    pub const QUERY: &str = "cartofile::query";
    /// Candidate refinement in the feature reader.
    pub const READ: &str = "cartofile::read";
    /// FID index availability and upkeep decisions.
    pub const FID: &str = "cartofile::fid";
    /// Spatial index availability and degradation.
    pub const SPATIAL: &str = "cartofile::spatial";
    /// Spatial index construction.
    pub const SPATIAL_BUILD: &str = "cartofile::spatial_build";
    /// FID index generation from scratch.
    pub const FID_GENERATE: &str = "cartofile::fid_generate";
    /// FID index rewrite at the end of a writer session.
    pub const FID_REWRITE: &str = "cartofile::fid_rewrite";
}

/// Span names, paired with the target of the same name.
pub mod span_names {
    pub const SPATIAL_BUILD: &str = "spatial_build";
    pub const FID_GENERATE: &str = "fid_generate";
    pub const FID_REWRITE: &str = "fid_rewrite";
}
