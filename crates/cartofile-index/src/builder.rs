//! Spatial index construction: one streaming pass over the geometry store's
//! record envelopes into a [`QuadTree`], persisted as a sibling `.qix` file.

use tracing::info;

use cartofile_core::tracing_config::{span_names, targets};
use cartofile_core::{GeometrySource, SiblingFiles, StoreError, StoreResult};

use crate::quadtree::QuadTree;

/// Records between progress callbacks during a build.
pub const PROGRESS_INTERVAL: u64 = 4096;

/// Builds and persists the spatial index for a geometry store.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialIndexer {
    max_depth: Option<u32>,
}

impl SpatialIndexer {
    /// An indexer that auto-tunes tree depth from the record count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the auto-tuned depth. Deep trees trade insert locality for
    /// finer pruning; the default suits most datasets.
    #[must_use]
    pub fn with_max_depth(max_depth: u32) -> Self {
        Self {
            max_depth: Some(max_depth),
        }
    }

    /// Depth such that a fully split tree has roughly eight records per node:
    /// grow one level while `4^depth * 8` still falls short of the count.
    #[must_use]
    pub fn auto_depth(record_count: u64) -> u32 {
        let mut nodes: u64 = 1;
        let mut depth: u32 = 1;
        while nodes.saturating_mul(8) < record_count {
            nodes = nodes.saturating_mul(4);
            depth += 1;
        }
        depth
    }

    /// Stream every record envelope into a fresh tree and atomically replace
    /// the `.qix` sibling. Records with a null envelope carry no spatial
    /// extent and are skipped; they can only surface through a full scan.
    ///
    /// # Errors
    ///
    /// Returns `TooManyRecords` for sources past the 32-bit record space,
    /// and propagates geometry-store read errors and I/O errors persisting
    /// the index; on failure any previous index file is untouched.
    pub fn build<G: GeometrySource>(
        &self,
        files: &SiblingFiles,
        source: &mut G,
    ) -> StoreResult<QuadTree> {
        self.build_with_progress(files, source, |_| {})
    }

    /// [`build`](Self::build) with a callback reporting records processed,
    /// invoked every [`PROGRESS_INTERVAL`] records and once at the end.
    ///
    /// # Errors
    ///
    /// Same as [`build`](Self::build).
    pub fn build_with_progress<G, F>(
        &self,
        files: &SiblingFiles,
        source: &mut G,
        mut progress: F,
    ) -> StoreResult<QuadTree>
    where
        G: GeometrySource,
        F: FnMut(u64),
    {
        let record_count = source.record_count();
        // Record numbers are 32-bit throughout the index formats.
        if record_count > u64::from(u32::MAX) {
            return Err(StoreError::TooManyRecords {
                count: record_count,
                max: u32::MAX,
            });
        }
        let depth = self
            .max_depth
            .unwrap_or_else(|| Self::auto_depth(record_count));
        let bounds = source.bounds()?;
        let span = tracing::debug_span!(
            target: targets::SPATIAL_BUILD,
            span_names::SPATIAL_BUILD,
            record_count,
            depth
        );
        let _guard = span.enter();

        let mut tree = QuadTree::new(bounds, depth);
        let mut skipped: u64 = 0;
        #[allow(clippy::cast_possible_truncation)]
        for record in 0..record_count as u32 {
            let offset = source.offset_of(record)?;
            source.seek(offset)?;
            let envelope = source.envelope()?;
            if u64::from(record) % PROGRESS_INTERVAL == 0 {
                progress(u64::from(record));
            }
            if envelope.is_null() {
                skipped += 1;
                continue;
            }
            tree.insert(record, &envelope);
        }
        progress(record_count);

        let path = files.spatial_index();
        tree.store(&path)?;
        let index_bytes = files.index_len(&path)?.unwrap_or(0);
        info!(
            target: targets::SPATIAL_BUILD,
            path = %path.display(),
            record_count = tree.record_count(),
            skipped,
            depth,
            index_bytes,
            "spatial index built"
        );
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quadtree::MappedQuadTree;
    use cartofile_core::{Envelope, StoreError};

    /// Geometry source over a fixed envelope list; offsets are synthetic.
    struct EnvelopeSource {
        envelopes: Vec<Envelope>,
        position: usize,
    }

    impl EnvelopeSource {
        fn new(envelopes: Vec<Envelope>) -> Self {
            Self {
                envelopes,
                position: 0,
            }
        }
    }

    impl GeometrySource for EnvelopeSource {
        type Geometry = ();

        fn record_count(&self) -> u64 {
            self.envelopes.len() as u64
        }

        fn bounds(&self) -> StoreResult<Envelope> {
            let mut bounds = Envelope::null();
            for envelope in &self.envelopes {
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
            Ok(u64::from(record) * 24 + 100)
        }

        fn seek(&mut self, offset: u64) -> StoreResult<()> {
            self.position = ((offset - 100) / 24) as usize;
            Ok(())
        }

        fn envelope(&mut self) -> StoreResult<Envelope> {
            Ok(self.envelopes[self.position])
        }

        fn geometry(&mut self) -> StoreResult<Self::Geometry> {
            Ok(())
        }

        fn simplified_geometry(&mut self, _distance: f64) -> StoreResult<Option<Self::Geometry>> {
            Ok(None)
        }
    }

    #[test]
    fn auto_depth_grows_with_record_count() {
        assert_eq!(SpatialIndexer::auto_depth(0), 1);
        assert_eq!(SpatialIndexer::auto_depth(8), 1);
        assert_eq!(SpatialIndexer::auto_depth(9), 2);
        assert_eq!(SpatialIndexer::auto_depth(32), 2);
        assert_eq!(SpatialIndexer::auto_depth(33), 3);
        assert!(SpatialIndexer::auto_depth(1_000_000) > 5);
    }

    #[test]
    fn build_covers_every_record_with_an_extent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("parcels.vec");
        std::fs::write(&geom, b"x").expect("geometry file");
        let files = SiblingFiles::new(geom);

        let envelopes: Vec<Envelope> = (0..50)
            .map(|i| {
                let base = f64::from(i);
                Envelope::new(base, base, base + 0.5, base + 0.5)
            })
            .collect();
        let mut source = EnvelopeSource::new(envelopes);

        let tree = SpatialIndexer::new().build(&files, &mut source).expect("build");
        assert_eq!(tree.record_count(), 50);

        // A whole-world search through the persisted file sees every record.
        let mapped = MappedQuadTree::open(&files.spatial_index()).expect("open");
        let hits = mapped.search(tree.bounds()).expect("search");
        assert_eq!(hits, (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn null_envelopes_are_left_out_of_the_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("parcels.vec");
        std::fs::write(&geom, b"x").expect("geometry file");
        let files = SiblingFiles::new(geom);

        let mut source = EnvelopeSource::new(vec![
            Envelope::new(0.0, 0.0, 1.0, 1.0),
            Envelope::null(),
            Envelope::new(2.0, 2.0, 3.0, 3.0),
        ]);
        let tree = SpatialIndexer::new().build(&files, &mut source).expect("build");
        assert_eq!(tree.record_count(), 2);

        let hits = tree.search(&Envelope::new(-10.0, -10.0, 10.0, 10.0));
        assert_eq!(hits, vec![0, 2]);
    }

    /// Reports a record count past the 32-bit record space without backing
    /// storage; the builder must reject it before touching any record.
    struct OversizedSource;

    impl GeometrySource for OversizedSource {
        type Geometry = ();

        fn record_count(&self) -> u64 {
            u64::from(u32::MAX) + 1
        }

        fn bounds(&self) -> StoreResult<Envelope> {
            Ok(Envelope::new(0.0, 0.0, 1.0, 1.0))
        }

        fn offset_of(&self, record: u32) -> StoreResult<u64> {
            Ok(u64::from(record))
        }

        fn seek(&mut self, _offset: u64) -> StoreResult<()> {
            Ok(())
        }

        fn envelope(&mut self) -> StoreResult<Envelope> {
            Ok(Envelope::new(0.0, 0.0, 1.0, 1.0))
        }

        fn geometry(&mut self) -> StoreResult<Self::Geometry> {
            Ok(())
        }

        fn simplified_geometry(&mut self, _distance: f64) -> StoreResult<Option<Self::Geometry>> {
            Ok(None)
        }
    }

    #[test]
    fn oversized_source_is_rejected_before_building() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("parcels.vec");
        std::fs::write(&geom, b"x").expect("geometry file");
        let files = SiblingFiles::new(geom);

        let err = SpatialIndexer::new()
            .build(&files, &mut OversizedSource)
            .unwrap_err();
        assert!(matches!(err, StoreError::TooManyRecords { .. }));
        assert!(!files.spatial_index().exists(), "nothing written");
    }

    #[test]
    fn progress_reports_monotonically_and_finishes_at_the_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("parcels.vec");
        std::fs::write(&geom, b"x").expect("geometry file");
        let files = SiblingFiles::new(geom);

        let mut source = EnvelopeSource::new(
            (0..10)
                .map(|i| {
                    let base = f64::from(i);
                    Envelope::new(base, base, base + 0.5, base + 0.5)
                })
                .collect(),
        );
        let mut reports = Vec::new();
        SpatialIndexer::new()
            .build_with_progress(&files, &mut source, |n| reports.push(n))
            .expect("build");

        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reports.last().copied(), Some(10));
    }

    #[test]
    fn explicit_depth_overrides_auto_tuning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("parcels.vec");
        std::fs::write(&geom, b"x").expect("geometry file");
        let files = SiblingFiles::new(geom);

        let envelopes: Vec<Envelope> = (0..100)
            .map(|i| {
                let base = f64::from(i);
                Envelope::new(base, base, base + 0.1, base + 0.1)
            })
            .collect();

        // Depth 0 means a single flat node: every intersecting query sees all.
        let mut source = EnvelopeSource::new(envelopes);
        let tree = SpatialIndexer::with_max_depth(0)
            .build(&files, &mut source)
            .expect("build");
        let hits = tree.search(&Envelope::new(0.0, 0.0, 0.05, 0.05));
        assert_eq!(hits.len(), 100);
    }
}
