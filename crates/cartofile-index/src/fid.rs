//! Persistent FID index (`.fix`): a mapping from stable feature identities to
//! record positions, with removal accounting.
//!
//! # File Layout
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ Header (13 bytes)                   │
//! │   version: u8 = 1                   │
//! │   record_count: u64                 │
//! │   removed_count: u32                │
//! ├─────────────────────────────────────┤
//! │ Records (12 bytes each)             │
//! │   identity: i64                     │
//! │   record_number: i32                │
//! └─────────────────────────────────────┘
//! ```
//!
//! Identities are assigned sequentially in file order, so slots are sorted by
//! identity and slot `k` always describes record `k`. Removal never compacts
//! the mapping in place: it only bumps `removed_count`, and the next full
//! writer session compacts by omitting removed slots. Because the largest
//! identity ever assigned equals `record_count + removed_count`, fresh
//! identities are synthesized past that watermark and removed identities are
//! never reused.
//!
//! A reader and a writer must not interleave on the same file; coordinating
//! that is the caller's concern.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use cartofile_core::tracing_config::{span_names, targets};
use cartofile_core::{FeatureId, SiblingFiles, StoreError, StoreResult};

/// Current `.fix` format version.
pub const FID_INDEX_VERSION: u8 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 13;

/// Size of one index record in bytes.
pub const RECORD_SIZE: usize = 12;

/// Window size below which interpolation search degrades to a linear scan.
const LINEAR_SEARCH_WINDOW: i64 = 10;

/// Buffer size for writer sessions.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// One stored index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FidEntry {
    /// Numeric identity suffix.
    pub identity: i64,
    /// 0-based record number in the geometry store.
    pub record: u32,
}

// ─── Reader ─────────────────────────────────────────────────────────────────

/// Memory-mapped read-only view of a `.fix` file.
///
/// An absent or zero-length file parses as an empty index; any other
/// structural problem is fatal and requires regeneration.
#[derive(Debug)]
pub struct FidIndexReader {
    path: PathBuf,
    mmap: Option<Mmap>,
    record_count: u64,
    removed_count: u32,
}

impl FidIndexReader {
    /// Open and validate a `.fix` file.
    ///
    /// # Errors
    ///
    /// Returns `FidIndexVersionMismatch` for an unknown version byte and
    /// `FidIndexCorrupted` when the file length does not match the header's
    /// record count exactly.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let empty = |path: &Path| Self {
            path: path.to_path_buf(),
            mmap: None,
            record_count: 0,
            removed_count: 0,
        };

        if !path.exists() {
            return Ok(empty(path));
        }
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(empty(path));
        }
        if (len as usize) < HEADER_SIZE {
            return Err(StoreError::FidIndexCorrupted {
                path: path.to_path_buf(),
                detail: format!("file too small for header: {len} bytes"),
            });
        }

        // SAFETY: read-only map; the file must not be truncated while mapped.
        // Writer sessions replace the file via rename, which leaves existing
        // maps pointing at the old, consistent version.
        let mmap = unsafe { Mmap::map(&file)? };

        let version = mmap[0];
        if version != FID_INDEX_VERSION {
            return Err(StoreError::FidIndexVersionMismatch {
                expected: FID_INDEX_VERSION,
                found: version,
                path: path.to_path_buf(),
            });
        }
        let record_count = u64::from_be_bytes(mmap[1..9].try_into().expect("8 bytes"));
        let removed_count = u32::from_be_bytes(mmap[9..13].try_into().expect("4 bytes"));

        let expected = record_count
            .checked_mul(RECORD_SIZE as u64)
            .and_then(|v| v.checked_add(HEADER_SIZE as u64))
            .ok_or_else(|| StoreError::FidIndexCorrupted {
                path: path.to_path_buf(),
                detail: "record count overflows file size".into(),
            })?;
        if len != expected {
            return Err(StoreError::FidIndexCorrupted {
                path: path.to_path_buf(),
                detail: format!(
                    "length {len} does not match header: {record_count} records need {expected} bytes"
                ),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap: Some(mmap),
            record_count,
            removed_count,
        })
    }

    /// Number of live records in the index.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Number of identities removed since the last regeneration.
    #[must_use]
    pub fn removed_count(&self) -> u32 {
        self.removed_count
    }

    /// Fraction of ever-assigned identities that have been removed. Drives
    /// the proactive-regeneration heuristic (rebuild past one half).
    #[must_use]
    pub fn removed_ratio(&self) -> f64 {
        let total = self.record_count + u64::from(self.removed_count);
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                f64::from(self.removed_count) / total as f64
            }
        }
    }

    /// Path this reader was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The entry stored in `slot`, or `None` past the end.
    ///
    /// Slot `k` always describes record `k`; this doubles as the reverse
    /// lookup from a record number to its identity.
    #[must_use]
    pub fn entry_at(&self, slot: u64) -> Option<FidEntry> {
        if slot >= self.record_count {
            return None;
        }
        let mmap = self.mmap.as_ref()?;
        let start = HEADER_SIZE + (slot as usize) * RECORD_SIZE;
        let identity = i64::from_be_bytes(mmap[start..start + 8].try_into().expect("8 bytes"));
        let record = u32::from_be_bytes(mmap[start + 8..start + 12].try_into().expect("4 bytes"));
        Some(FidEntry { identity, record })
    }

    /// Resolve a raw identity string against this index.
    ///
    /// Foreign strings (wrong type prefix, negative or non-numeric suffix)
    /// resolve to `None`, never an error.
    #[must_use]
    pub fn find_fid(&self, raw: &str, type_name: &str) -> Option<FidEntry> {
        let number = FeatureId::number_for(raw, type_name)?;
        let desired = i64::try_from(number).ok()?;
        self.find(desired)
    }

    /// Interpolation search for a numeric identity.
    ///
    /// Identities are sequential in file order, so the slot holding identity
    /// `d` is usually near slot `d`; the search extrapolates from the offset
    /// between the desired and observed identity and converges in O(1) probes
    /// for near-sequential access. Small windows degrade to a directed linear
    /// scan, and a prediction that makes no progress means the identity is
    /// absent.
    #[must_use]
    pub fn find(&self, desired: i64) -> Option<FidEntry> {
        let count = i64::try_from(self.record_count).ok()?;
        if count == 0 || desired < 0 {
            return None;
        }

        // Open window: slots strictly between min and max remain candidates.
        let mut min: i64 = -1;
        let mut max: i64 = count;
        let mut predicted: i64 = desired.min(count - 1);
        let mut scan_direction: i64 = 0;

        loop {
            if predicted <= min || predicted >= max {
                return None;
            }
            let entry = self.entry_at(predicted as u64)?;
            if entry.identity == desired {
                return Some(entry);
            }

            if max - min < LINEAR_SEARCH_WINDOW {
                // Linear fallback. Identities are sorted, so a direction flip
                // means we stepped over the gap where `desired` would live.
                let direction = if entry.identity < desired { 1 } else { -1 };
                if scan_direction != 0 && direction != scan_direction {
                    return None;
                }
                scan_direction = direction;
                predicted += direction;
                continue;
            }

            let previous = predicted;
            if entry.identity < desired {
                min = predicted;
            } else {
                max = predicted;
            }
            if max - min < 2 {
                return None;
            }
            // Extrapolate in i128: identity offsets can exceed the i64 range.
            let next = i128::from(previous) + (i128::from(desired) - i128::from(entry.identity));
            let next = next.clamp(i128::from(min) + 1, i128::from(max) - 1) as i64;
            if next == previous {
                return None;
            }
            predicted = next;
        }
    }
}

// ─── Writer ─────────────────────────────────────────────────────────────────

/// One writer session over a `.fix` file: streams existing identities through
/// (preserving them across a rewrite), synthesizes fresh ones past the
/// watermark, and atomically replaces the file on [`close`](Self::close).
///
/// The session owns a temp file until `close`; dropping an unclosed writer
/// discards the temp file and leaves the original index untouched.
#[derive(Debug)]
pub struct FidIndexWriter {
    existing: Option<FidIndexReader>,
    cursor: u64,
    out: Option<BufWriter<File>>,
    temp_path: PathBuf,
    final_path: PathBuf,
    records_written: u64,
    removed_count: u32,
    last_id: i64,
    pending: Option<i64>,
    finished: bool,
}

impl FidIndexWriter {
    /// Begin a rewrite session that streams the existing index through.
    ///
    /// # Errors
    ///
    /// Propagates reader validation errors for the existing file and I/O
    /// errors creating the temp file.
    pub fn open(files: &SiblingFiles) -> StoreResult<Self> {
        let existing = FidIndexReader::open(&files.fid_index())?;
        Self::start(files, Some(existing))
    }

    /// Begin a session that ignores any existing index, assigning fresh
    /// sequential identities from 1. Used by full regeneration.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors creating the temp file.
    pub fn create(files: &SiblingFiles) -> StoreResult<Self> {
        Self::start(files, None)
    }

    fn start(files: &SiblingFiles, existing: Option<FidIndexReader>) -> StoreResult<Self> {
        let final_path = files.fid_index();
        let temp_path = final_path.with_extension("fix.tmp");
        let (count, removed) = existing
            .as_ref()
            .map_or((0, 0), |r| (r.record_count(), r.removed_count()));

        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, File::create(&temp_path)?);
        // Header placeholder; the real counts land here on close.
        out.write_all(&[0u8; HEADER_SIZE])?;

        Ok(Self {
            existing,
            cursor: 0,
            out: Some(out),
            temp_path,
            final_path,
            records_written: 0,
            removed_count: removed,
            // Largest identity ever assigned; removed ids stay burned.
            last_id: (count + u64::from(removed)) as i64,
            pending: None,
            finished: false,
        })
    }

    /// Advance to the next pending identity: the next unread entry of the
    /// existing index when one remains, else a fresh `last_id + 1`. An
    /// identity still pending from a previous `next()` is committed (copied
    /// through) first.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from committing the previous pending identity.
    pub fn next(&mut self) -> StoreResult<i64> {
        if self.pending.is_some() {
            self.write()?;
        }
        let id = match self.peek_existing() {
            Some(entry) => {
                self.cursor += 1;
                entry.identity
            }
            None => {
                self.last_id += 1;
                self.last_id
            }
        };
        self.pending = Some(id);
        Ok(id)
    }

    /// Commit the pending identity to the next output slot.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors writing to the temp file.
    ///
    /// # Panics
    ///
    /// Panics when no identity is pending: `write()` requires a prior
    /// [`next`](Self::next).
    pub fn write(&mut self) -> StoreResult<()> {
        let Some(identity) = self.pending.take() else {
            panic!("write() called without a pending identity: call next() first");
        };
        self.emit(identity)
    }

    /// Mark the pending identity as deleted: nothing is written for it and
    /// the removal counter is bumped.
    ///
    /// # Panics
    ///
    /// Panics when no identity is pending: `remove()` requires a prior
    /// [`next`](Self::next).
    pub fn remove(&mut self) {
        assert!(
            self.pending.take().is_some(),
            "remove() called without a pending identity: call next() first"
        );
        self.removed_count += 1;
    }

    /// Whether unread entries of the existing index remain.
    #[must_use]
    pub fn has_remaining(&self) -> bool {
        self.peek_existing().is_some() || self.pending.is_some()
    }

    /// Drain the remaining existing entries unchanged, write the final
    /// header, and atomically replace the index file.
    ///
    /// Consuming `self` makes use-after-close unrepresentable.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; on failure the original index is untouched and
    /// the temp file is discarded on drop.
    pub fn close(mut self) -> StoreResult<()> {
        let span = tracing::debug_span!(
            target: targets::FID_REWRITE,
            span_names::FID_REWRITE,
            path = %self.final_path.display()
        );
        let _guard = span.enter();
        if self.pending.is_some() {
            self.write()?;
        }
        while let Some(entry) = self.peek_existing() {
            self.cursor += 1;
            self.emit(entry.identity)?;
        }

        let out = self.out.take().expect("writer stream present until close");
        let mut file = out
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FID_INDEX_VERSION;
        header[1..9].copy_from_slice(&self.records_written.to_be_bytes());
        header[9..13].copy_from_slice(&self.removed_count.to_be_bytes());
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;
        drop(file);

        // Release the old map before replacing the file it covers.
        self.existing = None;
        fs::rename(&self.temp_path, &self.final_path)?;
        self.finished = true;

        if let Some(parent) = self.final_path.parent() {
            if let Ok(dir) = File::open(parent) {
                if let Err(sync_err) = dir.sync_all() {
                    tracing::warn!(
                        target: targets::FID_REWRITE,
                        dir = %parent.display(),
                        error = %sync_err,
                        "directory fsync failed after FID index rewrite"
                    );
                }
            }
        }

        debug!(
            target: targets::FID_REWRITE,
            record_count = self.records_written,
            removed_count = self.removed_count,
            "FID index rewritten"
        );
        Ok(())
    }

    fn peek_existing(&self) -> Option<FidEntry> {
        self.existing.as_ref().and_then(|r| r.entry_at(self.cursor))
    }

    fn emit(&mut self, identity: i64) -> StoreResult<()> {
        let mut buf = [0u8; RECORD_SIZE];
        buf[..8].copy_from_slice(&identity.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf[8..].copy_from_slice(&(self.records_written as u32).to_be_bytes());
        self.out
            .as_mut()
            .expect("writer stream present until close")
            .write_all(&buf)?;
        self.records_written += 1;
        Ok(())
    }
}

impl Drop for FidIndexWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.out = None;
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

// ─── Generation ─────────────────────────────────────────────────────────────

/// Build the FID index from scratch: one entry per geometry record, with
/// identities `1..=record_count` in file order. Replaces any existing index.
///
/// # Errors
///
/// Returns `TooManyRecords` for counts past the 32-bit record space, and
/// propagates I/O errors from the writer session; on failure the previous
/// index (if any) is untouched.
pub fn generate(files: &SiblingFiles, record_count: u64) -> StoreResult<u64> {
    // Record numbers are 32-bit in the on-disk entry.
    if record_count > u64::from(u32::MAX) {
        return Err(StoreError::TooManyRecords {
            count: record_count,
            max: u32::MAX,
        });
    }
    let span = tracing::debug_span!(
        target: targets::FID_GENERATE,
        span_names::FID_GENERATE,
        path = %files.fid_index().display(),
        record_count
    );
    let _guard = span.enter();

    let mut writer = FidIndexWriter::create(files)?;
    for _ in 0..record_count {
        writer.next()?;
        writer.write()?;
    }
    writer.close()?;
    debug!(target: targets::FID_GENERATE, record_count, "FID index generated");
    Ok(record_count)
}
