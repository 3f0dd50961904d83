//! Unlinked, mmap-readable temporary streams.
//!
//! A [`TempStore`] is an anonymous temp file: created in the configured
//! directory and unlinked before the handle is returned, so it vanishes if
//! the process dies. Writes are append-only through a small internal buffer;
//! reads go through positioned I/O or a memory map, never through the file
//! cursor, so one handle can be written and read without seek fights.
//!
//! A [`MemFile`] keeps its first bytes in memory and spills the remainder
//! to a `TempStore` only once a threshold is crossed. Consumers that merge
//! pools must handle the two-region (memory + file) case.

use memmap2::{Advice, Mmap, MmapMut};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tilepress_core::error::{Error, Result};

/// Buffered bytes held before each write-through.
const FLUSH_THRESHOLD: usize = 256 * 1024;

/// An append-only unlinked temporary file.
#[derive(Debug)]
pub struct TempStore {
    what: String,
    file: File,
    buf: Vec<u8>,
    len: u64,
}

impl TempStore {
    /// Create an unlinked temp file in `dir`. `what` labels errors.
    pub fn create(dir: &Path, what: &str) -> Result<Self> {
        let file = tempfile::tempfile_in(dir)
            .map_err(|e| Error::open(format!("temporary {} in {}", what, dir.display()), e))?;
        Ok(Self {
            what: what.to_string(),
            file,
            buf: Vec::with_capacity(FLUSH_THRESHOLD),
            len: 0,
        })
    }

    /// Append bytes, returning the offset they begin at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let off = self.len;
        self.buf.extend_from_slice(bytes);
        self.len += bytes.len() as u64;
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(off)
    }

    /// Logical length, including bytes still in the write buffer.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push buffered bytes to the descriptor.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file
                .write_all(&self.buf)
                .map_err(|e| Error::write(self.what.clone(), e))?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Positioned read; does not disturb the append position.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.flush()?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::read(self.what.clone(), e))
    }

    /// Positioned overwrite of already-written bytes.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.flush()?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::write(self.what.clone(), e))
    }

    /// Map the full stream read-only. The store must be non-empty.
    pub fn map(&mut self) -> Result<Mmap> {
        self.flush()?;
        let map = unsafe { Mmap::map(&self.file) }
            .map_err(|e| Error::map(self.what.clone(), e))?;
        Ok(map)
    }

    /// Map the full stream read-write (used only for the minzoom fixup).
    pub fn map_mut(&mut self) -> Result<MmapMut> {
        self.flush()?;
        let map = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| Error::map(self.what.clone(), e))?;
        Ok(map)
    }

    /// The underlying descriptor.
    pub fn file(&mut self) -> Result<&File> {
        self.flush()?;
        Ok(&self.file)
    }

    /// Consume the store, returning the flushed descriptor.
    pub fn into_file(mut self) -> Result<File> {
        self.flush()?;
        Ok(self.file)
    }

    pub fn what(&self) -> &str {
        &self.what
    }
}

/// Advise the kernel about an access pattern; advice failures are not
/// actionable and are ignored, as the original tool ignored `madvise`.
pub fn advise(map: &Mmap, advice: Advice) {
    let _ = map.advise(advice);
}

// ============================================================================
// MemFile
// ============================================================================

/// A stream whose first bytes stay in memory, spilling past a threshold.
pub struct MemFile {
    what: String,
    dir: PathBuf,
    mem: Vec<u8>,
    spill: Option<TempStore>,
    limit: usize,
}

impl MemFile {
    pub fn new(dir: &Path, what: &str, limit: usize) -> Self {
        Self {
            what: what.to_string(),
            dir: dir.to_path_buf(),
            mem: Vec::new(),
            spill: None,
            limit,
        }
    }

    /// Append bytes, returning the offset they begin at. The memory region
    /// never grows past the limit once the spill store exists.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let off = self.off();
        if self.spill.is_none() && self.mem.len() + bytes.len() > self.limit {
            self.spill = Some(TempStore::create(&self.dir, &self.what)?);
        }
        match &mut self.spill {
            None => {
                self.mem.extend_from_slice(bytes);
            }
            Some(store) => {
                store.append(bytes)?;
            }
        }
        Ok(off)
    }

    /// Total logical length across both regions.
    pub fn off(&self) -> u64 {
        self.mem.len() as u64 + self.spill.as_ref().map_or(0, |s| s.len())
    }

    /// The in-memory region (always the first bytes of the stream).
    pub fn mem_part(&self) -> &[u8] {
        &self.mem
    }

    /// The spilled region, if any bytes went to disk.
    pub fn spilled(&mut self) -> Option<&mut TempStore> {
        self.spill.as_mut()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_returns_pre_write_offset() {
        let dir = TempDir::new().unwrap();
        let mut ts = TempStore::create(dir.path(), "geom").unwrap();
        assert_eq!(ts.append(b"hello").unwrap(), 0);
        assert_eq!(ts.append(b" world").unwrap(), 5);
        assert_eq!(ts.len(), 11);

        let mut back = [0u8; 11];
        ts.read_at(&mut back, 0).unwrap();
        assert_eq!(&back, b"hello world");
    }

    #[test]
    fn test_map_sees_buffered_writes() {
        let dir = TempDir::new().unwrap();
        let mut ts = TempStore::create(dir.path(), "index").unwrap();
        ts.append(b"abcdef").unwrap();
        let map = ts.map().unwrap();
        assert_eq!(&map[..], b"abcdef");
    }

    #[test]
    fn test_write_at_patches_in_place() {
        let dir = TempDir::new().unwrap();
        let mut ts = TempStore::create(dir.path(), "geom").unwrap();
        ts.append(&[0u8; 8]).unwrap();
        ts.append(b"rest").unwrap();
        ts.write_at(&42u64.to_le_bytes(), 0).unwrap();

        let map = ts.map().unwrap();
        assert_eq!(u64::from_le_bytes(map[0..8].try_into().unwrap()), 42);
        assert_eq!(&map[8..], b"rest");
    }

    #[test]
    fn test_memfile_stays_in_memory_below_limit() {
        let dir = TempDir::new().unwrap();
        let mut mf = MemFile::new(dir.path(), "pool", 64);
        assert_eq!(mf.append(b"abc").unwrap(), 0);
        assert_eq!(mf.append(b"defg").unwrap(), 3);
        assert_eq!(mf.off(), 7);
        assert_eq!(mf.mem_part(), b"abcdefg");
        assert!(mf.spilled().is_none());
    }

    #[test]
    fn test_memfile_spills_past_limit() {
        let dir = TempDir::new().unwrap();
        let mut mf = MemFile::new(dir.path(), "pool", 8);
        mf.append(b"12345").unwrap();
        let off = mf.append(b"67890").unwrap();
        assert_eq!(off, 5);
        assert_eq!(mf.off(), 10);

        // First region intact in memory, overflow on disk.
        assert_eq!(mf.mem_part(), b"12345");
        let spill = mf.spilled().unwrap();
        assert_eq!(spill.len(), 5);
        let mut back = [0u8; 5];
        spill.read_at(&mut back, 0).unwrap();
        assert_eq!(&back, b"67890");
    }
}
