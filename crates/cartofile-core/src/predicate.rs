//! Query predicate model and access-path classification.
//!
//! The orchestrator accelerates exactly two predicate shapes: a pure
//! identity-set (FID index path) and a predicate containing an extractable
//! bounding box (spatial index path). Everything else falls back to a full
//! forward scan.

use crate::screen_map::ScreenMap;
use crate::types::Envelope;

/// Filter tree over features. `Opaque` stands in for attribute expressions the
/// index layer cannot accelerate; they are evaluated downstream of the
/// candidate reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every feature.
    All,
    /// Matches features whose identity string is in the set. Foreign or
    /// unresolved identities are dropped silently during resolution.
    Ids(Vec<String>),
    /// Matches features whose envelope intersects the box.
    Intersects(Envelope),
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
    /// An attribute expression opaque to the index layer.
    Opaque(String),
}

impl Predicate {
    /// The identity set, when this predicate is a single identity-set term
    /// with no spatial or attribute parts.
    #[must_use]
    pub fn as_pure_id_set(&self) -> Option<&[String]> {
        match self {
            Self::Ids(ids) => Some(ids),
            _ => None,
        }
    }

    /// Union of every spatial sub-expression's box, or `None` when the
    /// predicate carries no usable spatial constraint.
    ///
    /// The union is a conservative superset for both conjunctions and
    /// disjunctions. A spatial term under `Not` poisons extraction entirely:
    /// such a predicate can match features outside its box, so pruning by it
    /// would drop matches.
    #[must_use]
    pub fn extract_bbox(&self) -> Option<Envelope> {
        if self.has_negated_spatial() {
            return None;
        }
        let mut bbox = Envelope::null();
        self.union_spatial(&mut bbox);
        (!bbox.is_null()).then_some(bbox)
    }

    fn union_spatial(&self, acc: &mut Envelope) {
        match self {
            Self::Intersects(env) => acc.expand_to_include(env),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.union_spatial(acc);
                }
            }
            Self::Not(_) | Self::All | Self::Ids(_) | Self::Opaque(_) => {}
        }
    }

    fn has_negated_spatial(&self) -> bool {
        match self {
            Self::Not(inner) => inner.contains_spatial(),
            Self::And(children) | Self::Or(children) => {
                children.iter().any(Self::has_negated_spatial)
            }
            _ => false,
        }
    }

    fn contains_spatial(&self) -> bool {
        match self {
            Self::Intersects(_) => true,
            Self::And(children) | Self::Or(children) => {
                children.iter().any(Self::contains_spatial)
            }
            Self::Not(inner) => inner.contains_spatial(),
            Self::All | Self::Ids(_) | Self::Opaque(_) => false,
        }
    }
}

/// One read request against the store: a predicate plus row-assembly options.
#[derive(Debug)]
pub struct Query {
    /// The filter to accelerate.
    pub predicate: Predicate,
    /// Decode attribute rows alongside geometries.
    pub read_attributes: bool,
    /// Envelopes smaller than this distance in both dimensions are treated as
    /// collapsible: deduplicated via the screen map and decoded through the
    /// cheap simplified path.
    pub simplification_distance: Option<f64>,
    /// Dedup grid for collapsible geometries at the current query resolution.
    pub screen_map: Option<ScreenMap>,
}

impl Query {
    /// Query with default assembly options: attributes on, no simplification.
    #[must_use]
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            read_attributes: true,
            simplification_distance: None,
            screen_map: None,
        }
    }

    /// Geometry-only variant of [`Query::new`].
    #[must_use]
    pub fn geometry_only(predicate: Predicate) -> Self {
        Self {
            read_attributes: false,
            ..Self::new(predicate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Predicate {
        Predicate::Intersects(Envelope::new(min_x, min_y, max_x, max_y))
    }

    #[test]
    fn pure_id_set_detection() {
        let ids = Predicate::Ids(vec!["roads.1".into(), "roads.2".into()]);
        assert_eq!(ids.as_pure_id_set().map(<[String]>::len), Some(2));

        let wrapped = Predicate::And(vec![ids]);
        assert!(wrapped.as_pure_id_set().is_none(), "only a bare id set counts");
        assert!(Predicate::All.as_pure_id_set().is_none());
    }

    #[test]
    fn bbox_extraction_unions_spatial_terms() {
        let pred = Predicate::And(vec![
            boxed(0.0, 0.0, 1.0, 1.0),
            Predicate::Opaque("name = 'A1'".into()),
            Predicate::Or(vec![boxed(5.0, 5.0, 6.0, 6.0), Predicate::All]),
        ]);
        let bbox = pred.extract_bbox().expect("has spatial terms");
        assert_eq!(bbox, Envelope::new(0.0, 0.0, 6.0, 6.0));
    }

    #[test]
    fn no_spatial_terms_yields_none() {
        assert_eq!(Predicate::All.extract_bbox(), None);
        assert_eq!(
            Predicate::Opaque("pop > 1000".into()).extract_bbox(),
            None
        );
        assert_eq!(
            Predicate::Ids(vec!["roads.3".into()]).extract_bbox(),
            None
        );
    }

    #[test]
    fn negated_spatial_poisons_extraction() {
        let pred = Predicate::And(vec![
            boxed(0.0, 0.0, 1.0, 1.0),
            Predicate::Not(Box::new(boxed(0.2, 0.2, 0.4, 0.4))),
        ]);
        assert_eq!(pred.extract_bbox(), None);

        // A negated attribute term is harmless.
        let pred = Predicate::And(vec![
            boxed(0.0, 0.0, 1.0, 1.0),
            Predicate::Not(Box::new(Predicate::Opaque("type = 'bridge'".into()))),
        ]);
        assert_eq!(pred.extract_bbox(), Some(Envelope::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn query_constructors() {
        let q = Query::new(Predicate::All);
        assert!(q.read_attributes);
        let q = Query::geometry_only(Predicate::All);
        assert!(!q.read_attributes);
        assert!(q.screen_map.is_none());
    }
}
