//! Sibling file set: a geometry file and the index files that share its base
//! name under different extensions.
//!
//! This module only answers existence, length, and modification-time
//! questions; locking between cooperating writers is the caller's concern.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::StoreResult;

/// Extension of the persistent FID index.
pub const FID_INDEX_EXT: &str = "fix";
/// Extension of the persistent spatial index.
pub const SPATIAL_INDEX_EXT: &str = "qix";

/// The geometry file plus its index siblings.
#[derive(Debug, Clone)]
pub struct SiblingFiles {
    geometry: PathBuf,
    type_name: String,
}

impl SiblingFiles {
    /// Describe the sibling set rooted at `geometry`. The feature type name is
    /// the file stem.
    pub fn new(geometry: impl Into<PathBuf>) -> Self {
        let geometry = geometry.into();
        let type_name = geometry
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            geometry,
            type_name,
        }
    }

    /// Path of the geometry file itself.
    #[must_use]
    pub fn geometry(&self) -> &Path {
        &self.geometry
    }

    /// Feature type name shared by all identities of this store.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Path of the `.fix` sibling.
    #[must_use]
    pub fn fid_index(&self) -> PathBuf {
        self.geometry.with_extension(FID_INDEX_EXT)
    }

    /// Path of the `.qix` sibling.
    #[must_use]
    pub fn spatial_index(&self) -> PathBuf {
        self.geometry.with_extension(SPATIAL_INDEX_EXT)
    }

    /// Whether an index sibling is stale relative to the geometry file.
    ///
    /// An absent index is always stale; an absent geometry file makes nothing
    /// stale (there is nothing to index). Otherwise the index is stale exactly
    /// when the geometry file's modification time is strictly newer.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` when metadata of an existing file cannot be
    /// read.
    pub fn index_is_stale(&self, index: &Path) -> StoreResult<bool> {
        if !index.exists() {
            return Ok(true);
        }
        if !self.geometry.exists() {
            return Ok(false);
        }
        let geometry_mtime = mtime(&self.geometry)?;
        let index_mtime = mtime(index)?;
        Ok(geometry_mtime > index_mtime)
    }

    /// Byte length of an index sibling, or `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` when metadata of an existing file cannot be
    /// read.
    pub fn index_len(&self, index: &Path) -> StoreResult<Option<u64>> {
        if !index.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::metadata(index)?.len()))
    }
}

fn mtime(path: &Path) -> StoreResult<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sibling_paths_share_base_name() {
        let files = SiblingFiles::new("/data/roads.vec");
        assert_eq!(files.type_name(), "roads");
        assert_eq!(files.fid_index(), PathBuf::from("/data/roads.fix"));
        assert_eq!(files.spatial_index(), PathBuf::from("/data/roads.qix"));
    }

    #[test]
    fn absent_index_is_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("roads.vec");
        fs::write(&geom, b"geometry").expect("write geometry");

        let files = SiblingFiles::new(&geom);
        assert!(files.index_is_stale(&files.fid_index()).expect("stale"));
    }

    #[test]
    fn newer_geometry_makes_index_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("roads.vec");
        fs::write(&geom, b"geometry").expect("write geometry");

        let files = SiblingFiles::new(&geom);
        let fix = files.fid_index();
        fs::write(&fix, b"index").expect("write index");

        // Index at least as new as the geometry: not stale.
        assert!(!files.index_is_stale(&fix).expect("stale check"));

        // Push the geometry mtime past the index.
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let file = fs::File::options()
            .append(true)
            .open(&geom)
            .expect("reopen");
        file.set_modified(later).expect("set mtime");
        assert!(files.index_is_stale(&fix).expect("stale check"));
    }

    #[test]
    fn index_len_reports_existing_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geom = dir.path().join("roads.vec");
        let files = SiblingFiles::new(&geom);

        assert_eq!(files.index_len(&files.fid_index()).expect("len"), None);
        fs::write(files.fid_index(), [0u8; 13]).expect("write index");
        assert_eq!(files.index_len(&files.fid_index()).expect("len"), Some(13));
    }
}
