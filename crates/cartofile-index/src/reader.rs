//! Candidate reader: turns an access path's candidate records into fully
//! decoded feature rows, applying per-candidate refinement on the way.
//!
//! Index searches return supersets (node-level quadtree hits, offset-sorted
//! id matches), so every candidate is re-checked against the real record
//! envelope before its geometry is decoded. Rendering hints are honored here
//! too: sub-pixel records deduplicate through the screen map and decode a
//! simplified substitute instead of the full payload.

use cartofile_core::tracing_config::targets;
use cartofile_core::{
    AttributeSource, Candidate, Envelope, FeatureId, FeatureRow, FeatureSource, GeometrySource,
    ScreenMap, StoreResult,
};
use tracing::trace;

use crate::fid::FidIndexReader;

// ─── Candidate streams ──────────────────────────────────────────────────────

/// Where candidate records come from: a pre-resolved list (FID or spatial
/// path) or a sequential sweep over every record (full scan).
#[derive(Debug)]
pub enum Candidates {
    /// Explicit records in ascending offset order.
    List(std::vec::IntoIter<Candidate>),
    /// Every record in file order.
    FullScan { next: u32, count: u64 },
}

impl Candidates {
    /// A full-scan stream over `count` records.
    #[must_use]
    pub fn full_scan(count: u64) -> Self {
        Self::FullScan { next: 0, count }
    }

    fn next_candidate<G: GeometrySource>(
        &mut self,
        geometry: &G,
    ) -> StoreResult<Option<Candidate>> {
        match self {
            Self::List(iter) => Ok(iter.next()),
            Self::FullScan { next, count } => {
                if u64::from(*next) >= *count {
                    return Ok(None);
                }
                let record = *next;
                *next += 1;
                Ok(Some(Candidate {
                    record,
                    offset: geometry.offset_of(record)?,
                }))
            }
        }
    }
}

/// How feature identities are assembled for emitted rows.
///
/// With a usable FID index, slot `k` of the index holds the preserved
/// identity of record `k`. Without one, identities are synthesized as
/// `record + 1`, matching what a fresh index generation would assign.
#[derive(Debug)]
pub enum FidSource {
    Indexed {
        reader: FidIndexReader,
        type_name: String,
    },
    Sequential {
        type_name: String,
    },
}

impl FidSource {
    /// Identity of a record number.
    #[must_use]
    pub fn id_for(&self, record: u32) -> FeatureId {
        match self {
            Self::Indexed { reader, type_name } => {
                let number = reader
                    .entry_at(u64::from(record))
                    .and_then(|entry| u64::try_from(entry.identity).ok())
                    .unwrap_or(u64::from(record) + 1);
                FeatureId::new(type_name.clone(), number)
            }
            Self::Sequential { type_name } => {
                FeatureId::new(type_name.clone(), u64::from(record) + 1)
            }
        }
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────────

/// Two-phase iteration state. `has_next` moves Idle to Positioned or
/// Exhausted; `next` hands the positioned row out and returns to Idle.
/// Repeated `has_next` calls never reseek or re-decode.
#[derive(Debug)]
enum ReadState<G> {
    Idle,
    Positioned(FeatureRow<G>),
    Exhausted,
}

/// Streaming reader over the candidates of one query.
///
/// Owns its geometry and attribute handles, so concurrent readers over the
/// same files never share cursors.
pub struct FeatureReader<S: FeatureSource> {
    geometry: S::Geometries,
    attributes: Option<S::Attributes>,
    candidates: Candidates,
    fids: FidSource,
    bbox: Option<Envelope>,
    simplification_distance: Option<f64>,
    screen_map: Option<ScreenMap>,
    state: ReadState<S::Geometry>,
}

impl<S: FeatureSource> FeatureReader<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        geometry: S::Geometries,
        attributes: Option<S::Attributes>,
        candidates: Candidates,
        fids: FidSource,
        bbox: Option<Envelope>,
        simplification_distance: Option<f64>,
        screen_map: Option<ScreenMap>,
    ) -> Self {
        Self {
            geometry,
            attributes,
            candidates,
            fids,
            bbox,
            simplification_distance,
            screen_map,
            state: ReadState::Idle,
        }
    }

    /// Whether another row remains. Positions the reader on it as a side
    /// effect; calling this repeatedly is free.
    ///
    /// # Errors
    ///
    /// Propagates decode and I/O failures from advancing.
    pub fn has_next(&mut self) -> StoreResult<bool> {
        if matches!(self.state, ReadState::Idle) {
            self.state = match self.advance()? {
                Some(row) => ReadState::Positioned(row),
                None => ReadState::Exhausted,
            };
        }
        Ok(matches!(self.state, ReadState::Positioned(_)))
    }

    /// The row `has_next` positioned on.
    ///
    /// # Errors
    ///
    /// Propagates decode and I/O failures when called without a preceding
    /// `has_next`.
    ///
    /// # Panics
    ///
    /// Panics when the reader is exhausted; guard with
    /// [`has_next`](Self::has_next).
    pub fn next(&mut self) -> StoreResult<FeatureRow<S::Geometry>> {
        if !self.has_next()? {
            panic!("next() called past the end of the reader");
        }
        match std::mem::replace(&mut self.state, ReadState::Idle) {
            ReadState::Positioned(row) => Ok(row),
            _ => unreachable!("has_next() returned true"),
        }
    }

    /// Release the underlying handles.
    pub fn close(self) {
        drop(self);
    }

    /// Decode candidates until one survives refinement.
    fn advance(&mut self) -> StoreResult<Option<FeatureRow<S::Geometry>>> {
        while let Some(candidate) = self.candidates.next_candidate(&self.geometry)? {
            self.geometry.seek(candidate.offset)?;
            let envelope = self.geometry.envelope()?;

            if let Some(bbox) = &self.bbox {
                if !bbox.intersects(&envelope) {
                    trace!(
                        target: targets::READ,
                        record = candidate.record,
                        "candidate envelope outside query bbox"
                    );
                    continue;
                }
            }

            let geometry = match self.decode_refined(&envelope)? {
                Some(geometry) => geometry,
                None => continue,
            };

            let attributes = match &mut self.attributes {
                Some(source) => source.read_row(candidate.record)?,
                None => Vec::new(),
            };

            return Ok(Some(FeatureRow {
                record: candidate.record,
                id: self.fids.id_for(candidate.record),
                geometry,
                attributes,
            }));
        }
        Ok(None)
    }

    /// Decode the record under the cursor, substituting simplified geometry
    /// for sub-resolution records and dropping screen-map duplicates.
    /// `None` means the candidate was deduplicated away.
    fn decode_refined(&mut self, envelope: &Envelope) -> StoreResult<Option<S::Geometry>> {
        let Some(distance) = self.simplification_distance else {
            return self.geometry.geometry().map(Some);
        };
        let sub_resolution = envelope.width() < distance && envelope.height() < distance;
        if !sub_resolution {
            return self.geometry.geometry().map(Some);
        }
        if let Some(screen_map) = &mut self.screen_map {
            if screen_map.is_set_and_mark(envelope) {
                return Ok(None);
            }
        }
        match self.geometry.simplified_geometry(distance)? {
            Some(geometry) => Ok(Some(geometry)),
            None => self.geometry.geometry().map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartofile_core::{StoreError, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    const RECORD_STRIDE: u64 = 24;
    const HEADER_BYTES: u64 = 100;

    /// Distinguishes which decode path produced a row.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestGeom {
        Full(u32),
        Simplified(u32),
    }

    #[derive(Debug, Clone)]
    struct TestDataset {
        envelopes: Vec<Envelope>,
        can_simplify: bool,
    }

    struct TestGeometries {
        dataset: TestDataset,
        cursor: u32,
        full_decodes: Rc<RefCell<u32>>,
    }

    impl GeometrySource for TestGeometries {
        type Geometry = TestGeom;

        fn record_count(&self) -> u64 {
            self.dataset.envelopes.len() as u64
        }

        fn bounds(&self) -> StoreResult<Envelope> {
            let mut bounds = Envelope::null();
            for envelope in &self.dataset.envelopes {
                bounds.expand_to_include(envelope);
            }
            Ok(bounds)
        }

        fn offset_of(&self, record: u32) -> StoreResult<u64> {
            if u64::from(record) >= self.record_count() {
                return Err(StoreError::RecordOutOfRange {
                    record,
                    count: self.record_count(),
                });
            }
            Ok(u64::from(record) * RECORD_STRIDE + HEADER_BYTES)
        }

        fn seek(&mut self, offset: u64) -> StoreResult<()> {
            #[allow(clippy::cast_possible_truncation)]
            {
                self.cursor = ((offset - HEADER_BYTES) / RECORD_STRIDE) as u32;
            }
            Ok(())
        }

        fn envelope(&mut self) -> StoreResult<Envelope> {
            Ok(self.dataset.envelopes[self.cursor as usize])
        }

        fn geometry(&mut self) -> StoreResult<TestGeom> {
            *self.full_decodes.borrow_mut() += 1;
            Ok(TestGeom::Full(self.cursor))
        }

        fn simplified_geometry(&mut self, _distance: f64) -> StoreResult<Option<TestGeom>> {
            if self.dataset.can_simplify {
                Ok(Some(TestGeom::Simplified(self.cursor)))
            } else {
                Ok(None)
            }
        }
    }

    struct TestAttributes;

    impl AttributeSource for TestAttributes {
        fn read_row(&mut self, record: u32) -> StoreResult<Vec<Value>> {
            Ok(vec![
                Value::Int(i64::from(record)),
                Value::Text(format!("row {record}")),
            ])
        }
    }

    struct TestSource {
        dataset: TestDataset,
        full_decodes: Rc<RefCell<u32>>,
    }

    impl FeatureSource for TestSource {
        type Geometry = TestGeom;
        type Geometries = TestGeometries;
        type Attributes = TestAttributes;

        fn open_geometry(&self) -> StoreResult<TestGeometries> {
            Ok(TestGeometries {
                dataset: self.dataset.clone(),
                cursor: 0,
                full_decodes: Rc::clone(&self.full_decodes),
            })
        }

        fn open_attributes(&self) -> StoreResult<TestAttributes> {
            Ok(TestAttributes)
        }
    }

    fn unit_envelopes(n: u32) -> Vec<Envelope> {
        (0..n)
            .map(|i| {
                let base = f64::from(i) * 10.0;
                Envelope::new(base, base, base + 1.0, base + 1.0)
            })
            .collect()
    }

    fn source(envelopes: Vec<Envelope>, can_simplify: bool) -> TestSource {
        TestSource {
            dataset: TestDataset {
                envelopes,
                can_simplify,
            },
            full_decodes: Rc::new(RefCell::new(0)),
        }
    }

    fn reader_over(
        source: &TestSource,
        candidates: Candidates,
        bbox: Option<Envelope>,
        attributes: bool,
        simplification: Option<f64>,
        screen_map: Option<ScreenMap>,
    ) -> FeatureReader<TestSource> {
        FeatureReader::new(
            source.open_geometry().expect("geometry"),
            attributes.then(|| source.open_attributes().expect("attributes")),
            candidates,
            FidSource::Sequential {
                type_name: "roads".into(),
            },
            bbox,
            simplification,
            screen_map,
        )
    }

    #[test]
    fn full_scan_emits_every_record_in_order() {
        let source = source(unit_envelopes(5), false);
        let mut reader = reader_over(&source, Candidates::full_scan(5), None, true, None, None);

        let mut rows = Vec::new();
        while reader.has_next().expect("has_next") {
            rows.push(reader.next().expect("next"));
        }
        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            let record = u32::try_from(i).expect("small");
            assert_eq!(row.record, record);
            assert_eq!(row.id.to_string(), format!("roads.{}", record + 1));
            assert_eq!(row.geometry, TestGeom::Full(record));
            assert_eq!(row.attributes[0], Value::Int(i64::from(record)));
        }
    }

    #[test]
    fn bbox_prefilter_skips_non_intersecting_candidates() {
        let source = source(unit_envelopes(10), false);
        // Candidates include records far outside the bbox; only 0..3 survive.
        let mut reader = reader_over(
            &source,
            Candidates::full_scan(10),
            Some(Envelope::new(0.0, 0.0, 25.0, 25.0)),
            false,
            None,
            None,
        );

        let mut records = Vec::new();
        while reader.has_next().expect("has_next") {
            records.push(reader.next().expect("next").record);
        }
        assert_eq!(records, vec![0, 1, 2]);
        // Pruned candidates were never fully decoded.
        assert_eq!(*source.full_decodes.borrow(), 3);
    }

    #[test]
    fn repeated_has_next_does_not_reposition() {
        let source = source(unit_envelopes(3), false);
        let mut reader = reader_over(&source, Candidates::full_scan(3), None, false, None, None);

        assert!(reader.has_next().expect("has_next"));
        assert!(reader.has_next().expect("has_next"));
        assert!(reader.has_next().expect("has_next"));
        // The positioned row decoded exactly once despite three peeks.
        assert_eq!(*source.full_decodes.borrow(), 1);
        assert_eq!(reader.next().expect("next").record, 0);
    }

    #[test]
    fn exhausted_reader_reports_false_without_error() {
        let source = source(unit_envelopes(1), false);
        let mut reader = reader_over(&source, Candidates::full_scan(1), None, false, None, None);

        assert_eq!(reader.next().expect("next").record, 0);
        assert!(!reader.has_next().expect("has_next"));
        assert!(!reader.has_next().expect("has_next"));
    }

    #[test]
    #[should_panic(expected = "past the end of the reader")]
    fn next_past_end_panics() {
        let source = source(unit_envelopes(0), false);
        let mut reader = reader_over(&source, Candidates::full_scan(0), None, false, None, None);
        let _ = reader.next();
    }

    #[test]
    fn attributes_left_empty_when_not_requested() {
        let source = source(unit_envelopes(2), false);
        let mut reader = reader_over(&source, Candidates::full_scan(2), None, false, None, None);
        let row = reader.next().expect("next");
        assert!(row.attributes.is_empty());
    }

    #[test]
    fn explicit_candidate_list_drives_the_reader() {
        let source = source(unit_envelopes(10), false);
        let list = vec![
            Candidate {
                record: 2,
                offset: 2 * RECORD_STRIDE + HEADER_BYTES,
            },
            Candidate {
                record: 7,
                offset: 7 * RECORD_STRIDE + HEADER_BYTES,
            },
        ];
        let mut reader = reader_over(
            &source,
            Candidates::List(list.into_iter()),
            None,
            false,
            None,
            None,
        );
        assert_eq!(reader.next().expect("next").record, 2);
        assert_eq!(reader.next().expect("next").record, 7);
        assert!(!reader.has_next().expect("has_next"));
    }

    #[test]
    fn sub_resolution_records_decode_simplified() {
        let source = source(unit_envelopes(3), true);
        // Unit envelopes sit below a distance of 5; all are sub-resolution.
        let mut reader = reader_over(
            &source,
            Candidates::full_scan(3),
            None,
            false,
            Some(5.0),
            None,
        );
        let row = reader.next().expect("next");
        assert_eq!(row.geometry, TestGeom::Simplified(0));
        assert_eq!(*source.full_decodes.borrow(), 0);
    }

    #[test]
    fn simplification_falls_back_to_full_decode() {
        let source = source(unit_envelopes(1), false);
        let mut reader = reader_over(
            &source,
            Candidates::full_scan(1),
            None,
            false,
            Some(5.0),
            None,
        );
        assert_eq!(reader.next().expect("next").geometry, TestGeom::Full(0));
    }

    #[test]
    fn records_above_resolution_always_decode_fully() {
        let source = source(vec![Envelope::new(0.0, 0.0, 50.0, 50.0)], true);
        let mut reader = reader_over(
            &source,
            Candidates::full_scan(1),
            None,
            false,
            Some(5.0),
            None,
        );
        assert_eq!(reader.next().expect("next").geometry, TestGeom::Full(0));
    }

    #[test]
    fn screen_map_deduplicates_cohabiting_records() {
        // Three tiny records in the same screen cell, one elsewhere.
        let envelopes = vec![
            Envelope::new(1.0, 1.0, 1.1, 1.1),
            Envelope::new(1.2, 1.2, 1.3, 1.3),
            Envelope::new(1.4, 1.4, 1.5, 1.5),
            Envelope::new(80.0, 80.0, 80.1, 80.1),
        ];
        let extent = Envelope::new(0.0, 0.0, 100.0, 100.0);
        let source = source(envelopes, true);
        let mut reader = reader_over(
            &source,
            Candidates::full_scan(4),
            None,
            false,
            Some(5.0),
            Some(ScreenMap::new(extent, 10, 10)),
        );

        let mut records = Vec::new();
        while reader.has_next().expect("has_next") {
            records.push(reader.next().expect("next").record);
        }
        // First occupant of the cell wins; the far record has its own cell.
        assert_eq!(records, vec![0, 3]);
    }

    #[test]
    fn indexed_fid_source_preserves_identities() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("roads.vec");
        std::fs::write(&geom, b"x").expect("geometry file");
        let files = cartofile_core::SiblingFiles::new(geom);

        // Build an index, remove identity 2, leaving records 0..=2 mapping
        // to identities 1, 3, 4.
        crate::fid::generate(&files, 4).expect("generate");
        let mut writer = crate::fid::FidIndexWriter::open(&files).expect("writer");
        writer.next().expect("next");
        writer.write().expect("write");
        writer.next().expect("next");
        writer.remove();
        writer.close().expect("close");

        let fids = FidSource::Indexed {
            reader: FidIndexReader::open(&files.fid_index()).expect("reader"),
            type_name: "roads".into(),
        };
        assert_eq!(fids.id_for(0).to_string(), "roads.1");
        assert_eq!(fids.id_for(1).to_string(), "roads.3");
        assert_eq!(fids.id_for(2).to_string(), "roads.4");
        // Past the index, numbering falls back to sequential.
        assert_eq!(fids.id_for(9).to_string(), "roads.10");
    }
}
