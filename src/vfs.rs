//! Compressed storage for database files.
//!
//! The storage layer compresses a database file transparently, chunk by
//! chunk, with zstd. [`PageStore`] implements the file format: a logical
//! byte file is divided into fixed-size chunks (the *outer page size* of
//! the tuning configuration), each stored as one zstd frame inside a flat
//! container file. Reads and writes may touch arbitrary byte ranges; the
//! store decompresses and recompresses the affected chunks.
//!
//! The container starts with a reserved header page naming the format, the
//! chunk size, the logical file size and the location of the *directory*,
//! a compressed table mapping each chunk to its extent. Frames live in
//! byte-granular extents managed by a free list. A commit ([`PageStore::sync`])
//! writes new frames into free or fresh space, syncs the data, then writes
//! a new directory and header and syncs again. Extents freed by a commit
//! are not reallocated until the following commit, so an interrupted sync
//! leaves the previous generation fully intact.
//!
//! Chunk compression is striped over a bounded pool of worker threads
//! (the `threads` tuning key). The pool is per-store and invisible to
//! callers except through latency and memory.
//!
//! The [`shim`] submodule registers this store with the host engine as a
//! virtual file system, which is how SQLite databases end up stored in
//! this format. Application SQL never sees any of it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread;

use tracing::debug;

pub mod shim;


//-----------------------------------------------------------------------------

/// Name under which the compressed VFS is registered with the host engine.
pub const VFS_NAME: &str = "zstd";

// Container format magic; the first bytes of every compressed database.
pub(crate) const STORE_MAGIC: [u8; 8] = *b"GSQLZSTD";

const FORMAT_VERSION: u32 = 1;

// The header page; frame extents start after it.
const HEADER_SIZE: u64 = 4096;

// Encoded header fields occupy the start of the header page.
const HEADER_BYTES: usize = 68;

// Allocation granularity for frame extents. Rounding keeps the free list
// reusable when a rewritten chunk compresses to a slightly different size.
const ALLOC_ALIGN: u64 = 64;

// Decompressed chunks kept around for reading.
const CACHE_CHUNKS: usize = 16;

/// Default chunk size in bytes (the `outer_page_KiB` tuning default).
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default zstd compression level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 6;

/// Chunk sizes accepted by the container format, in bytes.
pub const CHUNK_SIZES: [usize; 7] = [
    1024, 2 * 1024, 4 * 1024, 8 * 1024, 16 * 1024, 32 * 1024, 64 * 1024,
];

//-----------------------------------------------------------------------------

/// Parameters for creating or opening a [`PageStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreParams {
    /// Chunk size in bytes; fixed at creation, one of [`CHUNK_SIZES`].
    pub chunk_size: usize,
    /// Zstd compression level for newly written chunks, in [-5, 22].
    pub zstd_level: i32,
    /// Worker threads for chunk compression during a commit.
    pub threads: usize,
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            zstd_level: DEFAULT_ZSTD_LEVEL,
            threads: 1,
        }
    }
}

impl StoreParams {
    /// Validates the parameters.
    pub fn validate(&self) -> io::Result<()> {
        if !CHUNK_SIZES.contains(&self.chunk_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid chunk size: {}", self.chunk_size),
            ));
        }
        if !(-5..=22).contains(&self.zstd_level) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid zstd level: {}", self.zstd_level),
            ));
        }
        if self.threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "threads must be greater than 0",
            ));
        }
        Ok(())
    }
}

//-----------------------------------------------------------------------------

// Extent of a zstd frame in the container. Frame lengths are exact; the
// allocator works in ALLOC_ALIGN units. Offset 0 marks an absent chunk
// (a hole), as no extent can start inside the header page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Extent {
    offset: u64,
    len: u32,
}

impl Extent {
    const NONE: Extent = Extent { offset: 0, len: 0 };

    fn is_some(&self) -> bool {
        self.offset != 0
    }

    fn alloc_len(&self) -> u64 {
        round_up(self.len as u64, ALLOC_ALIGN)
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn chunk_count(logical_size: u64, chunk_size: usize) -> u64 {
    logical_size.div_ceil(chunk_size as u64)
}

//-----------------------------------------------------------------------------

/// A compressed chunk store backed by a single container file.
///
/// The store presents a logical byte file of [`PageStore::logical_size`]
/// bytes. Writes accumulate in memory until [`PageStore::sync`] commits
/// them durably. Reads observe uncommitted writes.
#[derive(Debug)]
pub struct PageStore {
    file: File,
    path: PathBuf,
    writable: bool,
    chunk_size: usize,
    zstd_level: i32,
    threads: usize,

    logical_size: u64,
    generation: u64,
    // Committed chunk extents, indexed by chunk number.
    chunks: Vec<Extent>,
    dir_extent: Extent,
    dir_raw_len: u64,
    // Free extents (offset -> length in ALLOC_ALIGN units) and the end of
    // the allocated region.
    free: BTreeMap<u64, u64>,
    data_end: u64,

    // Uncommitted chunk contents, and extents freed since the last commit.
    dirty: BTreeMap<u64, Vec<u8>>,
    pending_free: Vec<Extent>,
    meta_dirty: bool,

    // Decompressed chunks kept for reading.
    cache: HashMap<u64, Vec<u8>>,
    cache_order: VecDeque<u64>,
}

//-----------------------------------------------------------------------------

/// Creating and opening.
impl PageStore {
    /// Creates a new, empty store in the given file.
    ///
    /// The chunk size is fixed for the lifetime of the container. Fails if
    /// the file already exists with content.
    pub fn create<P: AsRef<Path>>(path: P, params: &StoreParams) -> io::Result<Self> {
        params.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() > 0 {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file {} is not empty", path.as_ref().display()),
            ));
        }

        let mut store = PageStore {
            file,
            path: path.as_ref().to_path_buf(),
            writable: true,
            chunk_size: params.chunk_size,
            zstd_level: params.zstd_level,
            threads: params.threads,
            logical_size: 0,
            generation: 0,
            chunks: Vec::new(),
            dir_extent: Extent::NONE,
            dir_raw_len: 0,
            free: BTreeMap::new(),
            data_end: HEADER_SIZE,
            dirty: BTreeMap::new(),
            pending_free: Vec::new(),
            meta_dirty: false,
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
        };
        store.write_header()?;
        store.file.sync_data()?;
        debug!(path = %store.path.display(), chunk_size = store.chunk_size, "created page store");
        Ok(store)
    }

    /// Opens an existing store.
    ///
    /// The chunk size comes from the container header; `params` supplies
    /// the compression level and worker budget for subsequent writes.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool, params: &StoreParams) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;

        let mut header = [0u8; HEADER_BYTES];
        file.read_exact_at(&mut header, 0).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file {} is not a compressed database", path.as_ref().display()),
            )
        })?;
        if header[0..8] != STORE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file {} is not a compressed database", path.as_ref().display()),
            ));
        }
        let version = read_u32(&header, 8);
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported container version: {}", version),
            ));
        }
        let chunk_size = read_u32(&header, 12) as usize;
        if !CHUNK_SIZES.contains(&chunk_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid chunk size in header: {}", chunk_size),
            ));
        }
        let logical_size = read_u64(&header, 24);
        let generation = read_u64(&header, 32);
        let dir_extent = Extent {
            offset: read_u64(&header, 40),
            len: read_u32(&header, 48),
        };
        let dir_raw_len = read_u64(&header, 52);
        let data_end = read_u64(&header, 60);

        let chunks = if dir_extent.is_some() {
            let mut frame = vec![0u8; dir_extent.len as usize];
            file.read_exact_at(&mut frame, dir_extent.offset)?;
            let raw = zstd::bulk::decompress(&frame, dir_raw_len as usize)?;
            parse_directory(&raw)?
        } else {
            Vec::new()
        };
        if (chunks.len() as u64) < chunk_count(logical_size, chunk_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "directory does not cover the logical file",
            ));
        }
        let free = reconstruct_free(&chunks, dir_extent, data_end)?;

        debug!(
            path = %path.as_ref().display(),
            generation, logical_size,
            chunks = chunks.len(),
            "opened page store"
        );
        Ok(PageStore {
            file,
            path: path.as_ref().to_path_buf(),
            writable,
            chunk_size,
            zstd_level: params.zstd_level,
            threads: params.threads.max(1),
            logical_size,
            generation,
            chunks,
            dir_extent,
            dir_raw_len,
            free,
            data_end,
            dirty: BTreeMap::new(),
            pending_free: Vec::new(),
            meta_dirty: false,
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
        })
    }

    /// Returns the size of the logical (uncompressed) file in bytes.
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    /// Returns the chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the commit generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` if there are uncommitted changes.
    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.pending_free.is_empty() || self.meta_dirty
    }
}

//-----------------------------------------------------------------------------

/// Reading and writing.
impl PageStore {
    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// Bytes in chunks that were never written read as zero. The caller is
    /// responsible for not reading past [`PageStore::logical_size`]; bytes
    /// beyond it are not meaningful.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let chunk_size = self.chunk_size as u64;
        let mut pos = 0;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let index = abs / chunk_size;
            let within = (abs % chunk_size) as usize;
            let n = (self.chunk_size - within).min(buf.len() - pos);
            self.read_chunk_into(index, within, &mut buf[pos..pos + n])?;
            pos += n;
        }
        Ok(())
    }

    /// Writes `data` starting at `offset`, extending the logical file if
    /// needed. The write is buffered until the next [`PageStore::sync`].
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check_writable()?;
        let chunk_size = self.chunk_size as u64;
        let mut pos = 0;
        while pos < data.len() {
            let abs = offset + pos as u64;
            let index = abs / chunk_size;
            let within = (abs % chunk_size) as usize;
            let n = (self.chunk_size - within).min(data.len() - pos);
            if within == 0 && n == self.chunk_size {
                self.cache_remove(index);
                self.dirty.insert(index, data[pos..pos + n].to_vec());
            } else {
                let mut chunk = self.take_chunk(index)?;
                chunk[within..within + n].copy_from_slice(&data[pos..pos + n]);
                self.dirty.insert(index, chunk);
            }
            pos += n;
        }
        self.logical_size = self.logical_size.max(offset + data.len() as u64);
        Ok(())
    }

    /// Truncates or extends the logical file to `size` bytes.
    pub fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.check_writable()?;
        if size < self.logical_size {
            let keep = chunk_count(size, self.chunk_size);
            // The tail of the boundary chunk must read as zeros if the
            // file grows again.
            let within = (size % self.chunk_size as u64) as usize;
            if within != 0 {
                let index = keep - 1;
                let mut chunk = self.take_chunk(index)?;
                chunk[within..].fill(0);
                self.dirty.insert(index, chunk);
            }
            self.dirty.retain(|index, _| *index < keep);
            let dropped: Vec<u64> = self.cache.keys().copied().filter(|i| *i >= keep).collect();
            for index in dropped {
                self.cache.remove(&index);
            }
            while self.chunks.len() as u64 > keep {
                if let Some(extent) = self.chunks.pop() {
                    if extent.is_some() {
                        self.pending_free.push(extent);
                    }
                }
            }
        }
        self.logical_size = size;
        self.meta_dirty = true;
        Ok(())
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "page store is read-only",
            ))
        }
    }

    // Returns an owned copy of the chunk, sized to chunk_size, removing it
    // from the dirty map and the cache.
    fn take_chunk(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if let Some(chunk) = self.dirty.remove(&index) {
            return Ok(chunk);
        }
        if let Some(chunk) = self.cache.remove(&index) {
            return Ok(chunk);
        }
        self.load_chunk(index)
    }

    // Reads and decompresses a committed chunk, or returns zeros for a
    // hole. Shorter frames are zero-extended.
    fn load_chunk(&self, index: u64) -> io::Result<Vec<u8>> {
        let extent = match self.chunks.get(index as usize) {
            Some(extent) if extent.is_some() => *extent,
            _ => return Ok(vec![0u8; self.chunk_size]),
        };
        let mut frame = vec![0u8; extent.len as usize];
        self.file.read_exact_at(&mut frame, extent.offset)?;
        let mut chunk = zstd::bulk::decompress(&frame, self.chunk_size)?;
        if chunk.len() != self.chunk_size {
            chunk.resize(self.chunk_size, 0);
        }
        Ok(chunk)
    }

    fn read_chunk_into(&mut self, index: u64, within: usize, out: &mut [u8]) -> io::Result<()> {
        if let Some(chunk) = self.dirty.get(&index) {
            out.copy_from_slice(&chunk[within..within + out.len()]);
            return Ok(());
        }
        if !self.cache.contains_key(&index) {
            let chunk = self.load_chunk(index)?;
            self.cache_insert(index, chunk);
        }
        let chunk = self.cache.get(&index).unwrap();
        out.copy_from_slice(&chunk[within..within + out.len()]);
        Ok(())
    }

    fn cache_insert(&mut self, index: u64, chunk: Vec<u8>) {
        if self.cache.insert(index, chunk).is_none() {
            self.cache_order.push_back(index);
        }
        while self.cache.len() > CACHE_CHUNKS {
            match self.cache_order.pop_front() {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn cache_remove(&mut self, index: u64) {
        self.cache.remove(&index);
    }
}

//-----------------------------------------------------------------------------

/// Committing.
impl PageStore {
    /// Commits all buffered writes durably.
    ///
    /// Dirty chunks are compressed (in parallel when the worker budget
    /// allows), written into free or fresh extents, and synced; only then
    /// are the new directory and header written and synced. Extents freed
    /// by this commit become allocatable at the next one, so the previous
    /// generation remains intact if the commit is interrupted.
    pub fn sync(&mut self) -> io::Result<()> {
        if !self.has_dirty() {
            return Ok(());
        }
        self.check_writable()?;

        let dirty: Vec<(u64, Vec<u8>)> = mem::take(&mut self.dirty).into_iter().collect();
        let mut pending = mem::take(&mut self.pending_free);
        let compressed = compress_chunks(dirty, self.zstd_level, self.threads)?;

        // Place the new frames. Extents are assigned in chunk order, which
        // keeps the container layout deterministic for a given write
        // history.
        let count = chunk_count(self.logical_size, self.chunk_size) as usize;
        if self.chunks.len() < count {
            self.chunks.resize(count, Extent::NONE);
        }
        let mut written = 0usize;
        for (index, frame, raw) in compressed {
            let old = self.chunks[index as usize];
            if old.is_some() {
                pending.push(old);
            }
            let extent = self.allocate(frame.len() as u32);
            self.file.write_all_at(&frame, extent.offset)?;
            written += frame.len();
            self.chunks[index as usize] = extent;
            self.cache_insert(index, raw);
        }

        // New directory, then the commit point: the header.
        let raw_dir = serialize_directory(&self.chunks);
        let dir_frame = zstd::bulk::compress(&raw_dir, self.zstd_level)?;
        if self.dir_extent.is_some() {
            pending.push(self.dir_extent);
        }
        let dir_extent = self.allocate(dir_frame.len() as u32);
        self.file.write_all_at(&dir_frame, dir_extent.offset)?;
        self.file.sync_data()?;

        self.generation += 1;
        self.dir_extent = dir_extent;
        self.dir_raw_len = raw_dir.len() as u64;
        self.write_header()?;
        self.file.sync_data()?;

        for extent in pending {
            self.release(extent);
        }
        self.meta_dirty = false;
        debug!(
            path = %self.path.display(),
            generation = self.generation,
            bytes = written,
            "committed page store"
        );
        Ok(())
    }

    fn write_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; HEADER_BYTES];
        header[0..8].copy_from_slice(&STORE_MAGIC);
        write_u32(&mut header, 8, FORMAT_VERSION);
        write_u32(&mut header, 12, self.chunk_size as u32);
        write_u32(&mut header, 16, self.zstd_level as u32);
        write_u32(&mut header, 20, 0);
        write_u64(&mut header, 24, self.logical_size);
        write_u64(&mut header, 32, self.generation);
        write_u64(&mut header, 40, self.dir_extent.offset);
        write_u32(&mut header, 48, self.dir_extent.len);
        write_u64(&mut header, 52, self.dir_raw_len);
        write_u64(&mut header, 60, self.data_end);
        self.file.write_all_at(&header, 0)
    }

    // First-fit allocation from the free list, extending the container
    // when nothing fits.
    fn allocate(&mut self, len: u32) -> Extent {
        let need = round_up(len as u64, ALLOC_ALIGN).max(ALLOC_ALIGN);
        let found = self
            .free
            .iter()
            .find(|(_, run)| **run >= need)
            .map(|(offset, run)| (*offset, *run));
        if let Some((offset, run)) = found {
            self.free.remove(&offset);
            if run > need {
                self.free.insert(offset + need, run - need);
            }
            return Extent { offset, len };
        }
        let offset = self.data_end;
        self.data_end += need;
        Extent { offset, len }
    }

    fn release(&mut self, extent: Extent) {
        let mut offset = extent.offset;
        let mut len = extent.alloc_len();
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        self.free.insert(offset, len);
    }
}

//-----------------------------------------------------------------------------

// Chunk compression, striped over worker threads: contiguous batches,
// results joined in order so the extent layout stays deterministic.
fn compress_chunks(
    chunks: Vec<(u64, Vec<u8>)>,
    level: i32,
    threads: usize,
) -> io::Result<Vec<(u64, Vec<u8>, Vec<u8>)>> {
    let compress_batch = move |batch: Vec<(u64, Vec<u8>)>| -> io::Result<Vec<(u64, Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::with_capacity(batch.len());
        for (index, raw) in batch {
            let frame = zstd::bulk::compress(&raw, level)?;
            out.push((index, frame, raw));
        }
        Ok(out)
    };

    if threads <= 1 || chunks.len() < 2 {
        return compress_batch(chunks);
    }

    let workers = threads.min(chunks.len());
    let stripe = chunks.len().div_ceil(workers);
    let mut remaining = chunks;
    let mut handles = Vec::with_capacity(workers);
    while !remaining.is_empty() {
        let rest = remaining.split_off(stripe.min(remaining.len()));
        let batch = mem::replace(&mut remaining, rest);
        handles.push(thread::spawn(move || compress_batch(batch)));
    }

    let mut out = Vec::new();
    for handle in handles {
        let part = handle
            .join()
            .map_err(|_| io::Error::other("compression worker panicked"))??;
        out.extend(part);
    }
    Ok(out)
}

//-----------------------------------------------------------------------------

// Directory and header encoding. Fixed-width little-endian fields.

fn serialize_directory(chunks: &[Extent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + chunks.len() * 12);
    out.extend_from_slice(&(chunks.len() as u64).to_le_bytes());
    for extent in chunks {
        out.extend_from_slice(&extent.offset.to_le_bytes());
        out.extend_from_slice(&extent.len.to_le_bytes());
    }
    out
}

fn parse_directory(raw: &[u8]) -> io::Result<Vec<Extent>> {
    let bad = || io::Error::new(io::ErrorKind::InvalidData, "malformed container directory");
    if raw.len() < 8 {
        return Err(bad());
    }
    let count = read_u64(raw, 0) as usize;
    if raw.len() != 8 + count * 12 {
        return Err(bad());
    }
    let mut chunks = Vec::with_capacity(count);
    for i in 0..count {
        let base = 8 + i * 12;
        chunks.push(Extent {
            offset: read_u64(raw, base),
            len: read_u32(raw, base + 8),
        });
    }
    Ok(chunks)
}

// The free list is not persisted; it is the complement of the allocated
// extents within the data region.
fn reconstruct_free(
    chunks: &[Extent],
    dir_extent: Extent,
    data_end: u64,
) -> io::Result<BTreeMap<u64, u64>> {
    let mut allocated: Vec<(u64, u64)> = chunks
        .iter()
        .chain(std::iter::once(&dir_extent))
        .filter(|extent| extent.is_some())
        .map(|extent| (extent.offset, extent.alloc_len()))
        .collect();
    allocated.sort_unstable();

    let mut free = BTreeMap::new();
    let mut cursor = HEADER_SIZE;
    for (offset, len) in allocated {
        if offset < cursor {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "overlapping extents in container directory",
            ));
        }
        if offset > cursor {
            free.insert(cursor, offset - cursor);
        }
        cursor = offset + len;
    }
    if cursor > data_end {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "container extents extend past the data region",
        ));
    }
    if cursor < data_end {
        free.insert(cursor, data_end - cursor);
    }
    Ok(free)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

//-----------------------------------------------------------------------------
