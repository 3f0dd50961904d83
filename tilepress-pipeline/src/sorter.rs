//! External radix + in-memory merge sort over the feature index.
//!
//! Input is one `(geom, index)` stream pair per ingest worker. Entries are
//! bucketed by the high-order bits of their spatial key just past the
//! already-consumed prefix, copying each feature's geometry into its
//! bucket. A bucket that fits the memory budget is chunk-sorted in
//! parallel and k-way merged into the output; a bucket of one entry, or
//! one whose key prefix is exhausted, passes straight through; anything
//! else re-splits recursively with a reduced descriptor budget.
//!
//! The merge is where `feature_minzoom` is first assigned: each record is
//! copied without its final byte and the drop policy's zoom is appended,
//! so the output geometry stream is contiguous and the rewritten index
//! entries satisfy `entry[i].start == entry[i-1].end`.
//!
//! Progress counts a feature's bytes as 25% at the split and 75% at the
//! merge; when a bucket re-splits, the total grows rather than lying about
//! work already counted.

use crate::config::PipelineConfig;
use crate::drop_policy::DropPolicy;
use crate::merge::{KWayMerge, MergeSource};
use crate::progress::Progress;
use crate::temp_store::{advise, TempStore};
use memmap2::{Advice, Mmap};
use rayon::prelude::*;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use tilepress_core::error::{Error, Result};
use tilepress_core::{cmp_ix_seq, IndexEntry, INDEX_RECORD_SIZE};

/// Largest per-thread chunk sorted at once; sorting more at a time used to
/// break on some platforms and buys nothing.
const MAX_SORT_UNIT: u64 = 2 * 1024 * 1024 * 1024;

const PAGE: u64 = 4096;

/// Cursor over one sorted chunk of a mapped index region.
struct MapCursor<'m> {
    data: &'m [u8],
    pos: usize,
    current: Option<IndexEntry>,
}

impl<'m> MapCursor<'m> {
    fn new(data: &'m [u8]) -> Result<Self> {
        let current = if data.is_empty() {
            None
        } else {
            Some(IndexEntry::read_at(data, 0).map_err(index_err)?)
        };
        Ok(Self {
            data,
            pos: 0,
            current,
        })
    }
}

impl<'m> MergeSource<IndexEntry> for MapCursor<'m> {
    fn peek(&self) -> Option<&IndexEntry> {
        self.current.as_ref()
    }

    fn advance(&mut self) -> Result<()> {
        self.pos += INDEX_RECORD_SIZE;
        self.current = if self.pos < self.data.len() {
            Some(IndexEntry::read_at(self.data, self.pos).map_err(index_err)?)
        } else {
            None
        };
        Ok(())
    }
}

fn index_err(e: io::Error) -> Error {
    Error::read("index", e)
}

/// The spatial sorter. Owns the recursion state: descriptor budget and
/// progress accounting.
pub struct SpatialSorter<'a> {
    cfg: &'a PipelineConfig,
    policy: &'a mut DropPolicy,
    progress: &'a Progress,
    cpus: usize,
    availfiles: i64,
    progress_done: u64,
    progress_max: u64,
}

impl<'a> SpatialSorter<'a> {
    pub fn new(
        cfg: &'a PipelineConfig,
        policy: &'a mut DropPolicy,
        progress: &'a Progress,
        cpus: usize,
        availfiles: i64,
    ) -> Self {
        Self {
            cfg,
            policy,
            progress,
            cpus: cpus.max(1),
            availfiles,
            progress_done: 0,
            progress_max: 0,
        }
    }

    /// Sort the reader stream pairs into `out_geom`/`out_index` in
    /// `(ix, seq)` order, assigning each feature's minzoom byte as it is
    /// merged.
    pub fn sort(
        &mut self,
        inputs: Vec<(File, File)>,
        out_geom: &mut TempStore,
        out_index: &mut TempStore,
    ) -> Result<()> {
        let mut geom_total = 0u64;
        for (geom, _) in &inputs {
            geom_total += geom.metadata().map_err(|e| Error::stat("geom", e))?.len();
        }
        self.progress_max = geom_total;
        self.progress_done = 0;

        // Stay well under the budget; the whole point is not to thrash.
        let mem = if self.cfg.prefer_radix {
            8192
        } else {
            (self.cfg.memory_budget / 2) as u64
        };
        let splits = self.availfiles / 4;

        let before = self.availfiles;
        self.radix1(inputs, false, 0, splits, mem, out_geom, out_index)?;
        if self.availfiles != before {
            return Err(Error::Impossible(format!(
                "miscounted available file descriptors: {} vs {}",
                self.availfiles, before
            )));
        }
        Ok(())
    }

    fn radix1(
        &mut self,
        inputs: Vec<(File, File)>,
        inputs_charged: bool,
        prefix: u32,
        splits: i64,
        mem: u64,
        out_geom: &mut TempStore,
        out_index: &mut TempStore,
    ) -> Result<()> {
        // Bits to consume this round, bounded by what remains of the key.
        let mut splitbits: u32 = 1;
        while (1i64 << (splitbits + 1)) <= splits.max(2) && splitbits < 16 {
            splitbits += 1;
        }
        splitbits = splitbits.min(64 - prefix);
        let nsplits = 1usize << splitbits;

        let mut buckets: Vec<(TempStore, TempStore)> = Vec::with_capacity(nsplits);
        for _ in 0..nsplits {
            buckets.push((
                TempStore::create(&self.cfg.tmp_dir, "geom")?,
                TempStore::create(&self.cfg.tmp_dir, "index")?,
            ));
            self.availfiles -= 4;
        }

        // Distribute every input entry into its bucket, rewriting the
        // geometry byte range as it lands.
        for (geom_file, index_file) in inputs {
            let index_len = index_file
                .metadata()
                .map_err(|e| Error::stat("index", e))?
                .len();
            if index_len != 0 {
                let index_map =
                    unsafe { Mmap::map(&index_file) }.map_err(|e| Error::map("index", e))?;
                advise(&index_map, Advice::Sequential);
                advise(&index_map, Advice::WillNeed);
                let geom_map =
                    unsafe { Mmap::map(&geom_file) }.map_err(|e| Error::map("geom", e))?;
                advise(&geom_map, Advice::Sequential);
                advise(&geom_map, Advice::WillNeed);

                for off in (0..index_len as usize).step_by(INDEX_RECORD_SIZE) {
                    let mut e = IndexEntry::read_at(&index_map, off).map_err(index_err)?;
                    let which = ((e.ix << prefix) >> (64 - splitbits)) as usize;
                    let (bucket_geom, bucket_index) = &mut buckets[which];

                    let pos = bucket_geom.len();
                    bucket_geom.append(&geom_map[e.start as usize..e.end as usize])?;

                    // 25% now; the other 75% when the bucket merges.
                    self.progress_done += (e.end - e.start) / 4;
                    self.report();

                    e.start = pos;
                    e.end = bucket_geom.len();
                    bucket_index.append(&e.to_bytes())?;
                }
            }
            drop(index_file);
            drop(geom_file);
            if inputs_charged {
                self.availfiles += 4;
            }
        }

        // Buckets in order: bucket order is key order.
        for (mut bucket_geom, mut bucket_index) in buckets {
            let index_size = bucket_index.len();
            let geom_size = bucket_geom.len();

            if index_size == 0 {
                self.availfiles += 4;
                continue;
            }

            if index_size + geom_size < mem {
                self.sort_in_memory(&mut bucket_geom, &mut bucket_index, out_geom, out_index)?;
                self.availfiles += 4;
            } else if index_size as usize == INDEX_RECORD_SIZE || prefix + splitbits >= 64 {
                self.pass_through(&mut bucket_geom, &mut bucket_index, out_geom, out_index)?;
                self.availfiles += 4;
            } else {
                // Still too big: split further. The re-split re-counts this
                // bucket's split work, so grow the total to stay honest.
                self.progress_max += geom_size / 4;
                let pair = (bucket_geom.into_file()?, bucket_index.into_file()?);
                let sub_splits = self.availfiles / 4;
                self.radix1(
                    vec![pair],
                    true,
                    prefix + splitbits,
                    sub_splits,
                    mem,
                    out_geom,
                    out_index,
                )?;
            }
        }

        Ok(())
    }

    /// Chunk-sort the bucket's index in parallel, then k-way merge the
    /// chunks into the output.
    fn sort_in_memory(
        &mut self,
        bucket_geom: &mut TempStore,
        bucket_index: &mut TempStore,
        out_geom: &mut TempStore,
        out_index: &mut TempStore,
    ) -> Result<()> {
        let index_size = bucket_index.len();
        let bytes = INDEX_RECORD_SIZE as u64;

        let mut unit = (index_size / self.cpus as u64 + bytes - 1) / bytes * bytes;
        unit = unit.min(MAX_SORT_UNIT);
        // Page-align; a page is a whole number of records.
        unit = (unit + PAGE - 1) / PAGE * PAGE;
        unit = unit.max(PAGE);

        let nchunks = ((index_size + unit - 1) / unit) as usize;

        // Read each chunk into a heap buffer, sort, and write it back with
        // positioned I/O instead of sorting in writable mapped memory,
        // which behaves badly in containers.
        {
            let file = bucket_index.file()?;
            (0..nchunks)
                .into_par_iter()
                .try_for_each(|c| -> io::Result<()> {
                    let start = c as u64 * unit;
                    let end = (start + unit).min(index_size);
                    let mut raw = vec![0u8; (end - start) as usize];
                    file.read_exact_at(&mut raw, start)?;

                    let mut entries = Vec::with_capacity(raw.len() / INDEX_RECORD_SIZE);
                    for chunk in raw.chunks_exact(INDEX_RECORD_SIZE) {
                        entries.push(IndexEntry::read_le(chunk.try_into().unwrap())?);
                    }
                    entries.sort_unstable_by(cmp_ix_seq);
                    for (i, e) in entries.iter().enumerate() {
                        e.write_le(
                            (&mut raw[i * INDEX_RECORD_SIZE..(i + 1) * INDEX_RECORD_SIZE])
                                .try_into()
                                .unwrap(),
                        );
                    }
                    file.write_all_at(&raw, start)?;
                    Ok(())
                })
                .map_err(|e| Error::write("sort index chunk", e))?;
        }

        let index_map = bucket_index.map()?;
        // Sequential, but from several cursors at once.
        advise(&index_map, Advice::Random);
        advise(&index_map, Advice::WillNeed);
        let geom_map = bucket_geom.map()?;
        advise(&geom_map, Advice::Random);
        advise(&geom_map, Advice::WillNeed);

        let mut cursors = Vec::with_capacity(nchunks);
        for c in 0..nchunks {
            let start = (c as u64 * unit) as usize;
            let end = ((c as u64 * unit + unit).min(index_size)) as usize;
            cursors.push(MapCursor::new(&index_map[start..end])?);
        }

        let mut merge = KWayMerge::new(cursors, cmp_ix_seq);
        while let Some(mut e) = merge.next()? {
            self.emit(&geom_map, &mut e, out_geom, out_index)?;
        }
        Ok(())
    }

    /// Single entry or exhausted prefix: forward in stored order.
    fn pass_through(
        &mut self,
        bucket_geom: &mut TempStore,
        bucket_index: &mut TempStore,
        out_geom: &mut TempStore,
        out_index: &mut TempStore,
    ) -> Result<()> {
        let index_map = bucket_index.map()?;
        advise(&index_map, Advice::Sequential);
        advise(&index_map, Advice::WillNeed);
        let geom_map = bucket_geom.map()?;
        advise(&geom_map, Advice::Random);
        advise(&geom_map, Advice::WillNeed);

        for off in (0..index_map.len()).step_by(INDEX_RECORD_SIZE) {
            let mut e = IndexEntry::read_at(&index_map, off).map_err(index_err)?;
            self.emit(&geom_map, &mut e, out_geom, out_index)?;
        }
        Ok(())
    }

    /// Copy one feature to the output, replacing its final byte with the
    /// drop policy's minzoom, and rewrite its index entry for the new
    /// position.
    fn emit(
        &mut self,
        geom_map: &[u8],
        e: &mut IndexEntry,
        out_geom: &mut TempStore,
        out_index: &mut TempStore,
    ) -> Result<()> {
        let pos = out_geom.len();

        // The minzoom is the last byte of the serialized feature: write one
        // byte less and append the computed zoom.
        out_geom.append(&geom_map[e.start as usize..(e.end - 1) as usize])?;
        let minzoom = self.policy.feature_minzoom(e.ix, e.kind);
        out_geom.append(&[minzoom])?;

        self.progress_done += (e.end - e.start) * 3 / 4;
        self.report();

        e.start = pos;
        e.end = out_geom.len();
        out_index.append(&e.to_bytes())?;
        Ok(())
    }

    fn report(&self) {
        self.progress
            .percent("Reordering geometry", self.progress_done, self.progress_max);
    }
}

// ============================================================================
// Tests
// ============================================================================
