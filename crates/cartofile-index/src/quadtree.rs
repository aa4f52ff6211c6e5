//! Spatial index (`.qix`): a bounded-depth quadtree over record envelopes,
//! persisted with per-node skip offsets so it can be searched either fully
//! deserialized or streamed through a memory map.
//!
//! # File Layout
//!
//! All multi-byte integers and floats are little-endian.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ Header (15 bytes)                   │
//! │   magic: b"CQIX"                    │
//! │   byte_order: u8 = 1 (LE)           │
//! │   version: u16 = 1                  │
//! │   record_count: u32                 │
//! │   header_crc32: u32                 │
//! ├─────────────────────────────────────┤
//! │ Root node, recursively:             │
//! │   subtree_len: u32 (bytes after     │
//! │     this field, children included)  │
//! │   bounds: 4 × f64                   │
//! │   id_count: u32                     │
//! │   ids: id_count × u32               │
//! │   child_count: u8 (0 or 4)          │
//! │   children: child_count × node      │
//! └─────────────────────────────────────┘
//! ```
//!
//! `subtree_len` lets a search skip an entire non-intersecting subtree in one
//! seek, which is what makes the mapped variant cheap on large files.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use tracing::warn;

use cartofile_core::tracing_config::targets;
use cartofile_core::{Envelope, StoreError, StoreResult};

/// Magic bytes at the start of every `.qix` file.
pub const SPATIAL_INDEX_MAGIC: [u8; 4] = *b"CQIX";

/// Current `.qix` format version.
pub const SPATIAL_INDEX_VERSION: u16 = 1;

/// Byte-order marker: this implementation always writes little-endian.
const BYTE_ORDER_LE: u8 = 1;

/// Size of the fixed header in bytes.
const QIX_HEADER_SIZE: usize = 15;

fn corrupted(path: &Path, detail: impl Into<String>) -> StoreError {
    StoreError::SpatialIndexCorrupted {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

// ─── In-memory tree ─────────────────────────────────────────────────────────

/// One quadtree node. A node holds the records whose envelopes do not fit
/// entirely inside any single child quadrant.
#[derive(Debug, Clone, PartialEq)]
struct Node {
    bounds: Envelope,
    records: Vec<u32>,
    /// Empty, or exactly four quadrants.
    children: Vec<Node>,
}

impl Node {
    fn leaf(bounds: Envelope) -> Self {
        Self {
            bounds,
            records: Vec::new(),
            children: Vec::new(),
        }
    }

    fn quadrants(&self) -> [Envelope; 4] {
        let (cx, cy) = self.bounds.center();
        [
            Envelope::new(self.bounds.min_x, self.bounds.min_y, cx, cy),
            Envelope::new(cx, self.bounds.min_y, self.bounds.max_x, cy),
            Envelope::new(self.bounds.min_x, cy, cx, self.bounds.max_y),
            Envelope::new(cx, cy, self.bounds.max_x, self.bounds.max_y),
        ]
    }

    fn insert(&mut self, record: u32, envelope: &Envelope, depth_left: u32) {
        if depth_left > 0 {
            if self.children.is_empty() {
                self.children = self.quadrants().into_iter().map(Node::leaf).collect();
            }
            for child in &mut self.children {
                if child.bounds.contains(envelope) {
                    child.insert(record, envelope, depth_left - 1);
                    return;
                }
            }
        }
        self.records.push(record);
    }

    fn search_into(&self, query: &Envelope, hits: &mut Vec<u32>) {
        if !self.bounds.intersects(query) {
            return;
        }
        hits.extend_from_slice(&self.records);
        for child in &self.children {
            child.search_into(query, hits);
        }
    }

    /// Serialized size of this node excluding its own `subtree_len` field.
    fn encoded_len(&self) -> usize {
        32 + 4
            + self.records.len() * 4
            + 1
            + self
                .children
                .iter()
                .map(|c| 4 + c.encoded_len())
                .sum::<usize>()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.encoded_len() as u32).to_le_bytes());
        for coord in [
            self.bounds.min_x,
            self.bounds.min_y,
            self.bounds.max_x,
            self.bounds.max_y,
        ] {
            out.extend_from_slice(&coord.to_le_bytes());
        }
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        for record in &self.records {
            out.extend_from_slice(&record.to_le_bytes());
        }
        #[allow(clippy::cast_possible_truncation)]
        out.push(self.children.len() as u8);
        for child in &self.children {
            child.encode(out);
        }
    }
}

/// Fully in-memory quadtree. Built by the indexer, or deserialized whole when
/// the file is small enough to cache.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadTree {
    root: Node,
    record_count: u32,
    max_depth: u32,
}

impl QuadTree {
    /// A new empty tree covering `bounds`, splitting at most `max_depth`
    /// levels below the root.
    #[must_use]
    pub fn new(bounds: Envelope, max_depth: u32) -> Self {
        Self {
            root: Node::leaf(bounds),
            record_count: 0,
            max_depth,
        }
    }

    /// Bounds this tree covers.
    #[must_use]
    pub fn bounds(&self) -> &Envelope {
        &self.root.bounds
    }

    /// Number of record envelopes inserted.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Insert a record envelope. It descends as long as a single quadrant
    /// fully contains the envelope and lodges where it no longer fits.
    pub fn insert(&mut self, record: u32, envelope: &Envelope) {
        self.root.insert(record, envelope, self.max_depth);
        self.record_count += 1;
    }

    /// Records whose node bounds intersect the query, sorted and deduplicated.
    /// This is a superset of the exact matches; callers refine against real
    /// geometry envelopes.
    #[must_use]
    pub fn search(&self, query: &Envelope) -> Vec<u32> {
        let mut hits = Vec::new();
        self.root.search_into(query, &mut hits);
        hits.sort_unstable();
        hits.dedup();
        hits
    }

    /// Serialize and atomically replace the index file at `path`.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; on failure any previous file is untouched.
    pub fn store(&self, path: &Path) -> StoreResult<()> {
        let mut bytes = Vec::with_capacity(QIX_HEADER_SIZE + 4 + self.root.encoded_len());
        bytes.extend_from_slice(&SPATIAL_INDEX_MAGIC);
        bytes.push(BYTE_ORDER_LE);
        bytes.extend_from_slice(&SPATIAL_INDEX_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.record_count.to_le_bytes());
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        self.root.encode(&mut bytes);

        let temp_path = path.with_extension("qix.tmp");
        let mut file = File::create(&temp_path)?;
        if let Err(write_err) = file.write_all(&bytes).and_then(|()| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&temp_path);
            return Err(write_err.into());
        }
        drop(file);
        fs::rename(&temp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                if let Err(sync_err) = dir.sync_all() {
                    warn!(
                        target: targets::SPATIAL,
                        dir = %parent.display(),
                        error = %sync_err,
                        "directory fsync failed after spatial index store"
                    );
                }
            }
        }
        Ok(())
    }

    /// Deserialize a whole `.qix` file.
    ///
    /// # Errors
    ///
    /// Returns `SpatialIndexCorrupted` for any structural problem; callers
    /// treat that as "rebuild or degrade", never as fatal to the store.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let bytes = fs::read(path)?;
        let record_count = validate_header(path, &bytes)?;
        let mut cursor = Cursor::new(path, &bytes, QIX_HEADER_SIZE);
        let root = cursor.read_node()?;
        if cursor.offset != bytes.len() {
            return Err(corrupted(path, "trailing bytes after root node"));
        }
        Ok(Self {
            root,
            record_count,
            // Depth only matters for inserts; a loaded tree is read-only.
            max_depth: 0,
        })
    }
}

/// Validate magic, byte order, version, and header checksum. Returns the
/// stored record count.
fn validate_header(path: &Path, bytes: &[u8]) -> StoreResult<u32> {
    if bytes.len() < QIX_HEADER_SIZE {
        return Err(corrupted(
            path,
            format!("file too small for header: {} bytes", bytes.len()),
        ));
    }
    if bytes[..4] != SPATIAL_INDEX_MAGIC {
        return Err(corrupted(path, "bad magic, not a spatial index file"));
    }
    if bytes[4] != BYTE_ORDER_LE {
        return Err(corrupted(
            path,
            format!("unsupported byte order marker {}", bytes[4]),
        ));
    }
    let version = u16::from_le_bytes(bytes[5..7].try_into().expect("2 bytes"));
    if version != SPATIAL_INDEX_VERSION {
        return Err(corrupted(
            path,
            format!("unsupported version {version}, expected {SPATIAL_INDEX_VERSION}"),
        ));
    }
    let record_count = u32::from_le_bytes(bytes[7..11].try_into().expect("4 bytes"));
    let stored_crc = u32::from_le_bytes(bytes[11..15].try_into().expect("4 bytes"));
    let actual_crc = crc32fast::hash(&bytes[..11]);
    if stored_crc != actual_crc {
        return Err(corrupted(
            path,
            format!("header checksum mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"),
        ));
    }
    Ok(record_count)
}

/// Bounds-checked reader over serialized node bytes, shared by full
/// deserialization and the mapped walk.
struct Cursor<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(path: &'a Path, bytes: &'a [u8], offset: usize) -> Self {
        Self {
            path,
            bytes,
            offset,
        }
    }

    fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| corrupted(self.path, "node data past end of file"))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> StoreResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_f64(&mut self) -> StoreResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn read_bounds(&mut self) -> StoreResult<Envelope> {
        Ok(Envelope::new(
            self.read_f64()?,
            self.read_f64()?,
            self.read_f64()?,
            self.read_f64()?,
        ))
    }

    fn read_node(&mut self) -> StoreResult<Node> {
        let subtree_len = self.read_u32()? as usize;
        let subtree_end = self
            .offset
            .checked_add(subtree_len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| corrupted(self.path, "subtree length past end of file"))?;

        let bounds = self.read_bounds()?;
        let id_count = self.read_u32()? as usize;
        let mut records = Vec::with_capacity(id_count.min(subtree_len / 4));
        for _ in 0..id_count {
            records.push(self.read_u32()?);
        }
        let child_count = self.take(1)?[0];
        if child_count != 0 && child_count != 4 {
            return Err(corrupted(
                self.path,
                format!("node has {child_count} children, expected 0 or 4"),
            ));
        }
        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            children.push(self.read_node()?);
        }
        if self.offset != subtree_end {
            return Err(corrupted(self.path, "subtree length does not match content"));
        }
        Ok(Node {
            bounds,
            records,
            children,
        })
    }

    /// Walk one node during a mapped search, skipping non-intersecting
    /// subtrees via their stored lengths.
    fn search_node(&mut self, query: &Envelope, hits: &mut Vec<u32>) -> StoreResult<()> {
        let subtree_len = self.read_u32()? as usize;
        let subtree_end = self
            .offset
            .checked_add(subtree_len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| corrupted(self.path, "subtree length past end of file"))?;

        let bounds = self.read_bounds()?;
        if !bounds.intersects(query) {
            self.offset = subtree_end;
            return Ok(());
        }
        let id_count = self.read_u32()? as usize;
        for _ in 0..id_count {
            hits.push(self.read_u32()?);
        }
        let child_count = self.take(1)?[0];
        for _ in 0..child_count {
            self.search_node(query, hits)?;
        }
        if self.offset != subtree_end {
            return Err(corrupted(self.path, "subtree length does not match content"));
        }
        Ok(())
    }
}

// ─── Mapped variant ─────────────────────────────────────────────────────────

/// Memory-mapped `.qix` search that never materializes the tree. Used when
/// the file exceeds the in-memory cache threshold.
#[derive(Debug)]
pub struct MappedQuadTree {
    path: std::path::PathBuf,
    mmap: Mmap,
    bounds: Envelope,
    record_count: u32,
}

impl MappedQuadTree {
    /// Map the file and validate its header and root bounds.
    ///
    /// # Errors
    ///
    /// Returns `SpatialIndexCorrupted` for structural problems and I/O errors
    /// from opening or mapping.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = File::open(path)?;
        // SAFETY: read-only map; index files are replaced by rename, never
        // truncated in place.
        let mmap = unsafe { Mmap::map(&file)? };
        let record_count = validate_header(path, &mmap)?;
        let mut cursor = Cursor::new(path, &mmap, QIX_HEADER_SIZE);
        let _subtree_len = cursor.read_u32()?;
        let bounds = cursor.read_bounds()?;
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            bounds,
            record_count,
        })
    }

    /// Root bounds of the stored tree.
    #[must_use]
    pub fn bounds(&self) -> &Envelope {
        &self.bounds
    }

    /// Number of record envelopes in the stored tree.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Streaming equivalent of [`QuadTree::search`].
    ///
    /// # Errors
    ///
    /// Returns `SpatialIndexCorrupted` when the walk runs past the mapped
    /// bytes or a subtree length disagrees with its content.
    pub fn search(&self, query: &Envelope) -> StoreResult<Vec<u32>> {
        let mut hits = Vec::new();
        let mut cursor = Cursor::new(&self.path, &self.mmap, QIX_HEADER_SIZE);
        cursor.search_node(query, &mut hits)?;
        hits.sort_unstable();
        hits.dedup();
        Ok(hits)
    }
}
