//! Deduplicating string pools and the post-ingest pool merge.
//!
//! Each worker owns a byte pool of NUL-terminated UTF-8 strings backed by a
//! [`MemFile`]. Interning is served by an in-memory reverse map from the
//! string's xxh3-128 hash to its pool offset; at 128 bits a collision is
//! negligible, so repeat interns never re-read the pool. The reverse map is
//! the dedup structure only: it is dropped when ingest finishes, and just
//! the byte pool survives into the merge.
//!
//! After ingest, [`merge_pools`] concatenates the per-worker pools into one
//! stream and records each worker's base offset. A `(segment, local)`
//! string reference globalizes as `base[segment] + local`.

use crate::temp_store::{advise, MemFile, TempStore};
use memmap2::Advice;
use rustc_hash::FxHashMap;
use std::path::Path;
use tilepress_core::error::Result;
use xxhash_rust::xxh3::xxh3_128;

/// One worker's interning pool.
pub struct StringPool {
    pool: MemFile,
    index: FxHashMap<u128, u64>,
}

impl StringPool {
    pub fn new(dir: &Path, spill_limit: usize) -> Self {
        Self {
            pool: MemFile::new(dir, "pool", spill_limit),
            index: FxHashMap::default(),
        }
    }

    /// Intern a string, returning its worker-local pool offset. Interior
    /// NUL bytes are dropped so the pool's NUL-termination contract holds.
    pub fn intern(&mut self, s: &str) -> Result<u64> {
        let hash = xxh3_128(s.as_bytes());
        if let Some(&off) = self.index.get(&hash) {
            return Ok(off);
        }

        let off = if s.as_bytes().contains(&0) {
            let cleaned: Vec<u8> = s.bytes().filter(|&b| b != 0).chain([0]).collect();
            self.pool.append(&cleaned)?
        } else {
            let off = self.pool.append(s.as_bytes())?;
            self.pool.append(&[0])?;
            off
        };
        self.index.insert(hash, off);
        Ok(off)
    }

    /// Bytes interned so far.
    pub fn off(&self) -> u64 {
        self.pool.off()
    }

    /// Finish interning: the dedup index is discarded here and only the
    /// byte pool survives.
    pub fn into_pool(self) -> MemFile {
        self.pool
    }
}

// ============================================================================
// Pool merge
// ============================================================================

/// The merged string pool plus per-segment base offsets.
#[derive(Debug)]
pub struct MergedPool {
    pub store: TempStore,
    /// `base[segment] + local_offset` is the global offset. Sized with one
    /// slot per ingest worker plus one per tiling thread.
    pub base: Vec<u64>,
}

/// Concatenate per-worker pools in worker order. In-memory regions are
/// copied directly; spilled regions are mapped and appended.
pub fn merge_pools(pools: Vec<MemFile>, dir: &Path, total_slots: usize) -> Result<MergedPool> {
    let mut store = TempStore::create(dir, "pool")?;
    let mut base = vec![0u64; total_slots.max(pools.len())];

    for (i, mut pool) in pools.into_iter().enumerate() {
        base[i] = store.len();
        store.append(pool.mem_part())?;
        if let Some(spill) = pool.spilled() {
            if !spill.is_empty() {
                let map = spill.map()?;
                advise(&map, Advice::Sequential);
                store.append(&map)?;
            }
        }
    }

    tracing::debug!(bytes = store.len(), "merged string pool");
    Ok(MergedPool { store, base })
}

/// Read the NUL-terminated string at `offset` in a merged (or worker) pool.
pub fn pool_str(pool: &[u8], offset: u64) -> Option<&str> {
    let start = offset as usize;
    if start >= pool.len() {
        return None;
    }
    let rest = &pool[start..];
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_intern_dedups() {
        let dir = TempDir::new().unwrap();
        let mut pool = StringPool::new(dir.path(), 1 << 20);
        let a = pool.intern("name").unwrap();
        let b = pool.intern("highway").unwrap();
        let a2 = pool.intern("name").unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(pool.off(), "name".len() as u64 + "highway".len() as u64 + 2);
    }

    #[test]
    fn test_pool_strings_nul_terminated() {
        let dir = TempDir::new().unwrap();
        let mut pool = StringPool::new(dir.path(), 1 << 20);
        let a = pool.intern("alpha").unwrap();
        let b = pool.intern("béta").unwrap();
        let mem = pool.into_pool();
        assert_eq!(pool_str(mem.mem_part(), a), Some("alpha"));
        assert_eq!(pool_str(mem.mem_part(), b), Some("béta"));
    }

    #[test]
    fn test_interior_nul_dropped() {
        let dir = TempDir::new().unwrap();
        let mut pool = StringPool::new(dir.path(), 1 << 20);
        let off = pool.intern("a\0b").unwrap();
        let mem = pool.into_pool();
        assert_eq!(pool_str(mem.mem_part(), off), Some("ab"));
    }

    #[test]
    fn test_merge_assigns_base_offsets() {
        let dir = TempDir::new().unwrap();

        let mut p0 = StringPool::new(dir.path(), 1 << 20);
        let k0 = p0.intern("road").unwrap();
        let mut p1 = StringPool::new(dir.path(), 1 << 20);
        p1.intern("rail").unwrap();
        let k1 = p1.intern("river").unwrap();

        let mut merged =
            merge_pools(vec![p0.into_pool(), p1.into_pool()], dir.path(), 4).unwrap();
        assert_eq!(merged.base.len(), 4);
        assert_eq!(merged.base[0], 0);
        assert_eq!(merged.base[1], "road".len() as u64 + 1);

        let map = merged.store.map().unwrap();
        assert_eq!(pool_str(&map, merged.base[0] + k0), Some("road"));
        assert_eq!(pool_str(&map, merged.base[1] + k1), Some("river"));
    }

    #[test]
    fn test_merge_handles_spilled_pool() {
        let dir = TempDir::new().unwrap();

        // Tiny limit so the second string spills.
        let mut p0 = StringPool::new(dir.path(), 8);
        let a = p0.intern("abcdef").unwrap();
        let b = p0.intern("ghijkl").unwrap();

        let mut merged = merge_pools(vec![p0.into_pool()], dir.path(), 2).unwrap();
        let map = merged.store.map().unwrap();
        assert_eq!(pool_str(&map, a), Some("abcdef"));
        assert_eq!(pool_str(&map, b), Some("ghijkl"));
    }
}
