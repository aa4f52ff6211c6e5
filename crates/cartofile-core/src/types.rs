//! Shared data types for the cartofile indexing subsystem.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─── Feature identity ───────────────────────────────────────────────────────

/// Stable string identity for one feature within a type: `<typeName>.<n>`.
///
/// Identities are assigned sequentially in file order at generation time and
/// never change except on full regeneration. Any string that does not match
/// the `<typeName>.<nonNegativeInteger>` shape is "foreign" and is silently
/// ignored by identity-set resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureId {
    /// Type name shared by every feature of one store (the geometry file's
    /// base name by convention).
    pub type_name: String,
    /// The numeric suffix: 1-based position in file order at assignment time.
    pub number: u64,
}

impl FeatureId {
    /// Build an identity from its parts.
    pub fn new(type_name: impl Into<String>, number: u64) -> Self {
        Self {
            type_name: type_name.into(),
            number,
        }
    }

    /// Parse a raw identity string, splitting at the last `.`.
    ///
    /// Returns `None` for strings without a dot, with an empty type name, or
    /// with a suffix that is not a non-negative integer.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (type_name, suffix) = raw.rsplit_once('.')?;
        if type_name.is_empty() {
            return None;
        }
        let number: u64 = suffix.parse().ok()?;
        Some(Self::new(type_name, number))
    }

    /// Parse a raw identity string and return the numeric suffix only when the
    /// type-name prefix matches `type_name` exactly.
    ///
    /// This is the foreign-identity filter: mismatched prefix, negative or
    /// non-numeric suffix all yield `None`, never an error.
    #[must_use]
    pub fn number_for(raw: &str, type_name: &str) -> Option<u64> {
        let parsed = Self::parse(raw)?;
        (parsed.type_name == type_name).then_some(parsed.number)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.number)
    }
}

// ─── Envelope ────────────────────────────────────────────────────────────────

/// Axis-aligned bounding box. The "null" envelope (`max < min`) is the empty
/// sentinel: it intersects nothing and is contained by everything.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Build an envelope from ordered bounds.
    #[must_use]
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The empty envelope.
    #[must_use]
    pub fn null() -> Self {
        Self {
            min_x: 0.0,
            min_y: 0.0,
            max_x: -1.0,
            max_y: -1.0,
        }
    }

    /// True when this envelope is the empty sentinel.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.max_x < self.min_x || self.max_y < self.min_y
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_x - self.min_x
        }
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_y - self.min_y
        }
    }

    /// True when the two envelopes share at least one point. A null envelope
    /// on either side never intersects.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// True when `other` lies entirely within this envelope. A null `other`
    /// is contained by everything.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        if other.is_null() {
            return true;
        }
        if self.is_null() {
            return false;
        }
        self.min_x <= other.min_x
            && self.max_x >= other.max_x
            && self.min_y <= other.min_y
            && self.max_y >= other.max_y
    }

    /// Grow this envelope to cover `other`. A null `other` is a no-op; a null
    /// `self` becomes `other`.
    pub fn expand_to_include(&mut self, other: &Self) {
        if other.is_null() {
            return;
        }
        if self.is_null() {
            *self = *other;
            return;
        }
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Center point, used for quadrant assignment during spatial-index builds.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

// ─── Candidate ───────────────────────────────────────────────────────────────

/// A record position returned by an index path, pending confirmation against
/// exact predicates. Candidates must be consumed in ascending `offset` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// 0-based record number in the geometry store.
    pub record: u32,
    /// Byte offset of the record in the geometry file.
    pub offset: u64,
}

// ─── Attribute values ────────────────────────────────────────────────────────

/// Decoded attribute cell. The attribute format itself is an external
/// collaborator; this is the smallest common denominator the candidate reader
/// hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

// ─── Assembled rows ──────────────────────────────────────────────────────────

/// One assembled feature row: record position, resolved identity, decoded
/// geometry, and (optionally) attribute values.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow<G> {
    /// 0-based record number.
    pub record: u32,
    /// Stable identity, resolved from the FID index when one is usable or
    /// synthesized as `<type>.<record + 1>` otherwise.
    pub id: FeatureId,
    /// Decoded geometry. May be a simplified substitute when the row's
    /// envelope collapsed below the configured simplification distance.
    pub geometry: G,
    /// Attribute values; empty when attributes were not requested.
    pub attributes: Vec<Value>,
}
