//! Query orchestrator: picks an access path per query, keeps sibling index
//! files usable, and degrades to a full scan whenever an index cannot help.
//!
//! Index trouble during a read is never fatal. A missing, stale, or corrupt
//! index is rebuilt when the store may write, and otherwise the query falls
//! back to scanning; only geometry-store errors and explicit maintenance
//! failures surface to the caller.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use cartofile_core::tracing_config::targets;
use cartofile_core::{
    Candidate, Envelope, FeatureSource, GeometrySource, Query, SiblingFiles, StoreConfig,
    StoreError, StoreResult,
};

use crate::builder::SpatialIndexer;
use crate::fid::{self, FidIndexReader};
use crate::quadtree::{MappedQuadTree, QuadTree};
use crate::reader::{Candidates, FeatureReader, FidSource};

/// Outcome of consulting the spatial index for a query box.
enum SpatialOutcome {
    /// Superset of matching records, unsorted by offset.
    Hits(Vec<u32>),
    /// The box covers the whole tree; scanning is cheaper than walking it.
    CoversAll,
    /// No usable index; scan instead.
    Unavailable,
}

/// A geometry store with sibling FID and spatial indexes.
///
/// The store holds no open file handles between queries; each query opens
/// fresh geometry and attribute readers through its [`FeatureSource`].
#[derive(Debug)]
pub struct IndexedStore<S: FeatureSource> {
    source: S,
    files: SiblingFiles,
    config: StoreConfig,
    /// Deserialized spatial index, kept when the file fits the cache budget.
    cached_tree: Option<QuadTree>,
    /// Cleared when the spatial index proves unusable, so one broken file
    /// does not cost a rebuild attempt on every query.
    spatial_available: bool,
}

impl<S: FeatureSource> IndexedStore<S> {
    /// Wrap a feature source and its sibling files.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidConfig` for a rejected configuration.
    pub fn new(source: S, files: SiblingFiles, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let spatial_available = config.use_spatial_index;
        Ok(Self {
            source,
            files,
            config,
            cached_tree: None,
            spatial_available,
        })
    }

    /// Sibling file set this store operates on.
    #[must_use]
    pub fn files(&self) -> &SiblingFiles {
        &self.files
    }

    // ─── Querying ───────────────────────────────────────────────────────

    /// Open a streaming reader over the features matching `query`.
    ///
    /// Exactly two predicate shapes are accelerated: a pure identity set
    /// resolves through the FID index, and a predicate with an extractable
    /// bounding box consults the spatial index. Everything else, and every
    /// degraded case, is a forward scan; the bounding box still prefilters
    /// scan candidates when one exists.
    ///
    /// # Errors
    ///
    /// Propagates geometry-store open and read errors. Index failures
    /// degrade with a warning instead of erroring.
    pub fn query(&mut self, query: Query) -> StoreResult<FeatureReader<S>> {
        let geometry = self.source.open_geometry()?;
        let record_count = geometry.record_count();
        // Record numbers are 32-bit throughout the index formats.
        if record_count > u64::from(u32::MAX) {
            return Err(StoreError::TooManyRecords {
                count: record_count,
                max: u32::MAX,
            });
        }
        let bbox = query.predicate.extract_bbox();

        if let Some(ids) = query.predicate.as_pure_id_set() {
            if let Some(fid_reader) = self.ensure_fid_index(record_count) {
                let ids = ids.to_vec();
                return self.id_set_reader(query, geometry, &ids, fid_reader);
            }
            // No usable index; the scan below emits everything and identity
            // filtering happens downstream.
        }

        if let Some(query_box) = bbox {
            match self.spatial_candidates(&query_box) {
                SpatialOutcome::Hits(hits) => {
                    return self.candidate_list_reader(query, geometry, hits, query_box);
                }
                SpatialOutcome::CoversAll | SpatialOutcome::Unavailable => {}
            }
        }

        debug!(
            target: targets::QUERY,
            access_path = "scan",
            candidate_count = record_count,
            "query planned"
        );
        let attributes = self.attributes_for(&query)?;
        let fids = self.lookup_fid_source();
        Ok(FeatureReader::new(
            geometry,
            attributes,
            Candidates::full_scan(record_count),
            fids,
            bbox,
            query.simplification_distance,
            query.screen_map,
        ))
    }

    fn id_set_reader(
        &self,
        query: Query,
        geometry: S::Geometries,
        ids: &[String],
        fid_reader: FidIndexReader,
    ) -> StoreResult<FeatureReader<S>> {
        // Dedup raw strings first; resolution is the expensive part.
        let unique: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let mut candidates = Vec::with_capacity(unique.len());
        for raw in unique {
            // Foreign and unresolved identities are dropped, not errors.
            if let Some(entry) = fid_reader.find_fid(raw, self.files.type_name()) {
                candidates.push(Candidate {
                    record: entry.record,
                    offset: geometry.offset_of(entry.record)?,
                });
            }
        }
        candidates.sort_unstable_by_key(|c| c.offset);
        debug!(
            target: targets::QUERY,
            access_path = "fid",
            requested = ids.len(),
            candidate_count = candidates.len(),
            "query planned"
        );

        let attributes = self.attributes_for(&query)?;
        Ok(FeatureReader::new(
            geometry,
            attributes,
            Candidates::List(candidates.into_iter()),
            FidSource::Indexed {
                reader: fid_reader,
                type_name: self.files.type_name().to_string(),
            },
            None,
            query.simplification_distance,
            query.screen_map,
        ))
    }

    fn candidate_list_reader(
        &self,
        query: Query,
        geometry: S::Geometries,
        hits: Vec<u32>,
        query_box: Envelope,
    ) -> StoreResult<FeatureReader<S>> {
        let mut candidates = Vec::with_capacity(hits.len());
        for record in hits {
            candidates.push(Candidate {
                record,
                offset: geometry.offset_of(record)?,
            });
        }
        candidates.sort_unstable_by_key(|c| c.offset);
        debug!(
            target: targets::QUERY,
            access_path = "spatial",
            candidate_count = candidates.len(),
            "query planned"
        );

        let attributes = self.attributes_for(&query)?;
        let fids = self.lookup_fid_source();
        Ok(FeatureReader::new(
            geometry,
            attributes,
            Candidates::List(candidates.into_iter()),
            fids,
            Some(query_box),
            query.simplification_distance,
            query.screen_map,
        ))
    }

    fn attributes_for(&self, query: &Query) -> StoreResult<Option<S::Attributes>> {
        if query.read_attributes {
            Ok(Some(self.source.open_attributes()?))
        } else {
            Ok(None)
        }
    }

    /// Known bounds of the features matching `query`, when computable from
    /// headers and indexes alone. `None` asks the caller to derive bounds
    /// from the features themselves.
    ///
    /// # Errors
    ///
    /// Propagates geometry-store errors.
    pub fn bounds(&mut self, query: &Query) -> StoreResult<Option<Envelope>> {
        let mut geometry = self.source.open_geometry()?;
        match query.predicate.as_pure_id_set() {
            None => {
                if query.predicate == cartofile_core::Predicate::All {
                    geometry.bounds().map(Some)
                } else {
                    Ok(None)
                }
            }
            Some(ids) => {
                let Some(fid_reader) = self.ensure_fid_index(geometry.record_count()) else {
                    return Ok(None);
                };
                let mut bounds = Envelope::null();
                let unique: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
                for raw in unique {
                    if let Some(entry) = fid_reader.find_fid(raw, self.files.type_name()) {
                        let offset = geometry.offset_of(entry.record)?;
                        geometry.seek(offset)?;
                        bounds.expand_to_include(&geometry.envelope()?);
                    }
                }
                Ok(Some(bounds))
            }
        }
    }

    // ─── FID index upkeep ───────────────────────────────────────────────

    /// Rebuild the FID index unconditionally, assigning fresh sequential
    /// identities. Existing identities are not preserved.
    ///
    /// # Errors
    ///
    /// Propagates geometry-store and I/O errors; this explicit maintenance
    /// call never degrades silently.
    pub fn generate_fid_index(&mut self) -> StoreResult<u64> {
        let geometry = self.source.open_geometry()?;
        fid::generate(&self.files, geometry.record_count())
    }

    /// A reader over a usable FID index, generating or regenerating the file
    /// when needed and allowed. `None` degrades the query to a scan.
    fn ensure_fid_index(&self, record_count: u64) -> Option<FidIndexReader> {
        let path = self.files.fid_index();
        let may_generate = self.config.writable && self.config.create_index;

        let existing = match FidIndexReader::open(&path) {
            Ok(reader) => Some(reader),
            Err(err) => {
                warn!(
                    target: targets::FID,
                    path = %path.display(),
                    error = %err,
                    "FID index unusable"
                );
                None
            }
        };
        let stale = self.files.index_is_stale(&path).unwrap_or(true);
        let unusable = match &existing {
            None => true,
            Some(_) if stale => true,
            Some(reader) => reader.record_count() == 0 && record_count > 0,
        };

        if unusable {
            if !may_generate {
                return None;
            }
            return self.regenerate_fid_index(record_count);
        }

        let reader = existing?;
        // Compaction heuristic: once most ever-assigned identities are gone,
        // lookups pay for a sparse identity space. Regeneration resets the
        // identity sequence, so it only happens on a writable store.
        if may_generate && reader.removed_ratio() > 0.5 {
            info!(
                target: targets::FID,
                path = %path.display(),
                removed_count = reader.removed_count(),
                record_count = reader.record_count(),
                "regenerating FID index, removal ratio past half"
            );
            if let Some(fresh) = self.regenerate_fid_index(record_count) {
                return Some(fresh);
            }
            // Regeneration failed; the old index still answers correctly.
            return FidIndexReader::open(&path).ok();
        }
        Some(reader)
    }

    fn regenerate_fid_index(&self, record_count: u64) -> Option<FidIndexReader> {
        match fid::generate(&self.files, record_count) {
            Ok(_) => FidIndexReader::open(&self.files.fid_index()).ok(),
            Err(err) => {
                warn!(
                    target: targets::FID,
                    path = %self.files.fid_index().display(),
                    error = %err,
                    "FID index generation failed, falling back to scan"
                );
                None
            }
        }
    }

    /// FID source for non-id access paths: the index is consulted for
    /// identity assembly when present and fresh, never built for the purpose.
    fn lookup_fid_source(&self) -> FidSource {
        let type_name = self.files.type_name().to_string();
        let path = self.files.fid_index();
        if !self.files.index_is_stale(&path).unwrap_or(true) {
            if let Ok(reader) = FidIndexReader::open(&path) {
                if reader.record_count() > 0 {
                    return FidSource::Indexed { reader, type_name };
                }
            }
        }
        FidSource::Sequential { type_name }
    }

    // ─── Spatial index upkeep ───────────────────────────────────────────

    /// Build the spatial index now. With `force` false this is a no-op when
    /// the existing index is fresh.
    ///
    /// # Errors
    ///
    /// Propagates geometry-store and I/O errors; this explicit maintenance
    /// call never degrades silently.
    pub fn create_spatial_index(&mut self, force: bool) -> StoreResult<()> {
        let path = self.files.spatial_index();
        if !force && !self.files.index_is_stale(&path)? {
            return Ok(());
        }
        self.build_spatial_index()?;
        self.spatial_available = self.config.use_spatial_index;
        Ok(())
    }

    fn build_spatial_index(&mut self) -> StoreResult<()> {
        let mut geometry = self.source.open_geometry()?;
        let indexer = match self.config.max_depth {
            Some(depth) => SpatialIndexer::with_max_depth(depth),
            None => SpatialIndexer::new(),
        };
        let tree = indexer.build(&self.files, &mut geometry)?;
        // Re-evaluate the cache decision against the fresh file.
        self.cached_tree = None;
        let len = self.files.index_len(&self.files.spatial_index())?;
        if len.is_some_and(|len| len < self.config.spatial_cache_bytes) {
            self.cached_tree = Some(tree);
        }
        Ok(())
    }

    /// Consult the spatial index for a query box, rebuilding a stale index
    /// when allowed. Any implicit failure degrades to [`SpatialOutcome::Unavailable`].
    fn spatial_candidates(&mut self, query_box: &Envelope) -> SpatialOutcome {
        if !self.config.use_spatial_index || !self.spatial_available {
            return SpatialOutcome::Unavailable;
        }
        let path = self.files.spatial_index();

        if self.files.index_is_stale(&path).unwrap_or(true) {
            if !(self.config.writable && self.config.create_index) {
                return SpatialOutcome::Unavailable;
            }
            if let Err(err) = self.build_spatial_index() {
                warn!(
                    target: targets::SPATIAL,
                    path = %path.display(),
                    error = %err,
                    "spatial index build failed, degrading to scan"
                );
                self.spatial_available = false;
                return SpatialOutcome::Unavailable;
            }
        }

        if self.cached_tree.is_none() {
            let len = self.files.index_len(&path).ok().flatten();
            if len.is_some_and(|len| len < self.config.spatial_cache_bytes) {
                match QuadTree::load(&path) {
                    Ok(tree) => self.cached_tree = Some(tree),
                    Err(err) => {
                        warn!(
                            target: targets::SPATIAL,
                            path = %path.display(),
                            error = %err,
                            "spatial index unreadable, degrading to scan"
                        );
                        self.spatial_available = false;
                        return SpatialOutcome::Unavailable;
                    }
                }
            }
        }

        if let Some(tree) = &self.cached_tree {
            if query_box.contains(tree.bounds()) {
                return SpatialOutcome::CoversAll;
            }
            return SpatialOutcome::Hits(tree.search(query_box));
        }

        match MappedQuadTree::open(&path).and_then(|mapped| {
            if query_box.contains(mapped.bounds()) {
                Ok(None)
            } else {
                mapped.search(query_box).map(Some)
            }
        }) {
            Ok(Some(hits)) => SpatialOutcome::Hits(hits),
            Ok(None) => SpatialOutcome::CoversAll,
            Err(err) => {
                warn!(
                    target: targets::SPATIAL,
                    path = %path.display(),
                    error = %err,
                    "spatial index unreadable, degrading to scan"
                );
                self.spatial_available = false;
                SpatialOutcome::Unavailable
            }
        }
    }

    #[cfg(test)]
    fn spatial_cache_active(&self) -> bool {
        self.cached_tree.is_some()
    }
}
