//! Collaborator traits at the boundary of the indexing subsystem.
//!
//! The raw geometry/attribute binary formats are external concerns: the index
//! layer only needs to seek to a record, read its envelope cheaply, and decode
//! the full payload when a candidate survives pre-filtering.

use crate::error::StoreResult;
use crate::types::{Envelope, Value};

/// Positioned access to the geometry file.
///
/// Implementations keep a cursor: `seek` positions it on a record boundary and
/// the decode methods read the record under the cursor without advancing it.
/// A cheap `envelope` call must be possible without paying for a full
/// `geometry` decode.
pub trait GeometrySource {
    /// Decoded geometry payload. Opaque to the index layer.
    type Geometry;

    /// Total number of records in the file.
    fn record_count(&self) -> u64;

    /// Full extent of the dataset, typically available from the file header
    /// without scanning.
    ///
    /// # Errors
    ///
    /// Propagates decode or I/O failures from the underlying format.
    fn bounds(&self) -> StoreResult<Envelope>;

    /// Byte offset of a 0-based record number.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RecordOutOfRange` past the end of the file.
    fn offset_of(&self, record: u32) -> StoreResult<u64>;

    /// Position the cursor at a record's byte offset.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; offsets are trusted to come from `offset_of`
    /// or an index file.
    fn seek(&mut self, offset: u64) -> StoreResult<()>;

    /// Envelope of the record under the cursor, without a full decode.
    ///
    /// # Errors
    ///
    /// Propagates decode or I/O failures.
    fn envelope(&mut self) -> StoreResult<Envelope>;

    /// Fully decode the record under the cursor.
    ///
    /// # Errors
    ///
    /// Propagates decode or I/O failures.
    fn geometry(&mut self) -> StoreResult<Self::Geometry>;

    /// Decode a simplified stand-in for the record under the cursor, for
    /// envelopes that collapsed below `distance`. `None` means the format
    /// cannot simplify this record and the caller should fall back to
    /// [`GeometrySource::geometry`].
    ///
    /// # Errors
    ///
    /// Propagates decode or I/O failures.
    fn simplified_geometry(&mut self, distance: f64) -> StoreResult<Option<Self::Geometry>>;
}

/// Random access to decoded attribute rows, addressed by record number.
pub trait AttributeSource {
    /// Decode the attribute row of a 0-based record number.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RecordOutOfRange` past the end, and propagates
    /// decode or I/O failures.
    fn read_row(&mut self, record: u32) -> StoreResult<Vec<Value>>;
}

/// Factory for the per-query store handles the candidate reader owns.
///
/// Each query opens fresh geometry/attribute handles so concurrent readers of
/// the same files never share cursors.
pub trait FeatureSource {
    /// Geometry payload type produced by this source's readers.
    type Geometry;
    /// Concrete geometry reader.
    type Geometries: GeometrySource<Geometry = Self::Geometry>;
    /// Concrete attribute reader.
    type Attributes: AttributeSource;

    /// Open a geometry reader.
    ///
    /// # Errors
    ///
    /// Propagates open/parse failures from the underlying format.
    fn open_geometry(&self) -> StoreResult<Self::Geometries>;

    /// Open an attribute reader.
    ///
    /// # Errors
    ///
    /// Propagates open/parse failures from the underlying format.
    fn open_attributes(&self) -> StoreResult<Self::Attributes>;
}
