use std::path::PathBuf;

/// Unified error type covering all failure modes across the cartofile indexing
/// subsystem.
///
/// Every variant includes an actionable error message guiding the consumer
/// toward resolution. The `IndexedStore` orchestrator catches transient index
/// failures and degrades gracefully: a missing or broken spatial index falls
/// back to a full scan, a missing FID index falls back to sequential identity
/// synthesis. Corruption variants are fatal to the affected index and require
/// regeneration.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    // === FID index errors ===
    /// The `.fix` file is structurally invalid (truncated header, partial record).
    #[error(
        "FID index corrupted at {path}: {detail}. Delete the .fix file or call generate_fid_index() to rebuild."
    )]
    FidIndexCorrupted {
        /// Path to the corrupted file.
        path: PathBuf,
        /// Nature of the corruption.
        detail: String,
    },

    /// The `.fix` header version byte does not match what this build expects.
    #[error(
        "FID index version mismatch at {path}: expected v{expected}, found v{found}. Regenerate the index."
    )]
    FidIndexVersionMismatch {
        /// The version this library expects.
        expected: u8,
        /// The version found in the file.
        found: u8,
        /// Path to the offending file.
        path: PathBuf,
    },

    // === Spatial index errors ===
    /// The `.qix` file is structurally invalid (bad magic, CRC mismatch, truncated node).
    #[error(
        "Spatial index corrupted at {path}: {detail}. Delete the .qix file or call create_spatial_index(true) to rebuild."
    )]
    SpatialIndexCorrupted {
        /// Path to the corrupted file.
        path: PathBuf,
        /// Nature of the corruption.
        detail: String,
    },

    // === Addressing errors ===
    /// A record number fell outside the store's record range.
    #[error("Record {record} out of range: store holds {count} records.")]
    RecordOutOfRange {
        /// The requested 0-based record number.
        record: u32,
        /// Number of records actually present.
        count: u64,
    },

    /// The geometry store reports more records than the index formats can
    /// address with their 32-bit record numbers.
    #[error("Store reports {count} records; the index formats address at most {max}.")]
    TooManyRecords {
        /// Number of records the geometry store reports.
        count: u64,
        /// Largest addressable record count.
        max: u32,
    },

    // === Configuration errors ===
    /// A configuration value is invalid.
    #[error("Invalid config: {field} = \"{value}\": {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    // === I/O errors ===
    /// Wraps `std::io::Error` for file operations.
    #[error("I/O error: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    // === Collaborator errors ===
    /// Wraps errors from external record sources (geometry parser, attribute
    /// decoder). Always present so match arms stay stable regardless of which
    /// collaborator implementation is plugged in.
    #[error("{subsystem} error: {source}")]
    Subsystem {
        /// Which collaborator produced the error (e.g., "geometry", "attributes").
        subsystem: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Convenience alias used throughout the cartofile crate hierarchy.
pub type StoreResult<T> = Result<T, StoreError>;
