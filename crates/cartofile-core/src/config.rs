//! Explicit configuration for the indexed store.
//!
//! The original store read its cache threshold and index toggles from
//! process-global state; here everything is a plain value passed into the
//! orchestrator so two store instances can disagree.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Default byte threshold under which the persisted spatial index is loaded
/// into memory and cached for the lifetime of the store instance.
pub const DEFAULT_SPATIAL_CACHE_BYTES: u64 = 16 * 1024 * 1024;

/// Per-instance configuration for the indexed store orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Consult the spatial index for bounding-box queries. When false the
    /// store answers every spatial query with a full scan.
    pub use_spatial_index: bool,
    /// Build missing or stale indexes on demand during reads. Explicit
    /// maintenance calls ignore this toggle.
    pub create_index: bool,
    /// Whether the store may write sibling index files at all. Read-only
    /// stores never auto-generate and treat missing indexes as unavailable.
    pub writable: bool,
    /// Spatial index files at or above this size are never cached in memory;
    /// queries stream the on-disk structure instead. `0` disables caching.
    pub spatial_cache_bytes: u64,
    /// Fixed spatial tree depth. `None` auto-tunes from the record count.
    pub max_depth: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            use_spatial_index: true,
            create_index: true,
            writable: true,
            spatial_cache_bytes: DEFAULT_SPATIAL_CACHE_BYTES,
            max_depth: None,
        }
    }
}

impl StoreConfig {
    /// Validate field combinations that cannot be expressed in the type.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidConfig` for a zero `max_depth`.
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_depth == Some(0) {
            return Err(StoreError::InvalidConfig {
                field: "max_depth".into(),
                value: "0".into(),
                reason: "spatial tree depth must be at least 1; use None to auto-tune".into(),
            });
        }
        Ok(())
    }
}
