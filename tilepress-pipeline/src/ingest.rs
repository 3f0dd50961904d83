//! Ingest dispatch: one input source fanned out across workers.
//!
//! Mappable text sources are partitioned into one byte range per worker,
//! with boundaries nudged forward to the next record separator; each
//! worker's sequence counter starts at its byte offset, so global `seq`
//! order equals input byte order without any cross-worker coordination.
//!
//! Sources that cannot be mapped (standard input, gzip) fall back to a
//! serial reader that accumulates separator-aligned chunks of 10 MB to
//! 1 GB in an unlinked temp file and hands each chunk to a parser group.
//! At most one group is in flight; the reader blocks rather than buffer
//! unboundedly ahead of the parsers.

use crate::config::PipelineConfig;
use crate::geojson::parse_text_chunk;
use crate::progress::Progress;
use crate::serializer::{Reader, SerializationState, WarnLatches};
use crate::temp_store::{advise, TempStore};
use flate2::read::MultiGzDecoder;
use memmap2::{Advice, Mmap};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tilepress_core::error::{Error, Result};

/// Record separator byte for GeoJSON text sequences.
pub const RS: u8 = 0x1E;

/// Smallest chunk handed to a parser group in the serial fallback.
pub const PARSE_MIN: u64 = 10_000_000;

/// Largest chunk the serial reader will buffer while a group is running.
pub const PARSE_MAX: u64 = 1 << 30;

/// One input source.
#[derive(Debug, Clone, Default)]
pub struct Source {
    /// `None` reads standard input.
    pub file: Option<PathBuf>,
    /// Explicit layer name; derived from the file name when absent.
    pub layer: Option<String>,
    pub description: Option<String>,
    /// Format override for external binary-format parsers (flat-geobuf,
    /// geobuf, CSV). The core itself reads GeoJSON text sequences.
    pub format: Option<String>,
}

/// Ingest statistics accumulated across workers and sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestStats {
    pub dist_sum: f64,
    pub dist_count: u64,
    pub area_sum: f64,
    pub features: u64,
}

impl std::ops::AddAssign for IngestStats {
    fn add_assign(&mut self, rhs: Self) {
        self.dist_sum += rhs.dist_sum;
        self.dist_count += rhs.dist_count;
        self.area_sum += rhs.area_sum;
        self.features += rhs.features;
    }
}

/// Shared, immutable context captured by every parser thread.
#[derive(Clone)]
pub struct IngestContext {
    pub cfg: Arc<PipelineConfig>,
    pub progress: Arc<Progress>,
    pub warn: Arc<WarnLatches>,
}

// ============================================================================
// Parallel mapped ingest
// ============================================================================

/// Parse a mapped byte range with one worker per reader.
pub fn ingest_mapped(
    ctx: &IngestContext,
    data: &[u8],
    sep: u8,
    initial_offset: u64,
    fname: &str,
    layername: &str,
    readers: &mut [Reader],
) -> Result<IngestStats> {
    let cpus = readers.len();
    let len = data.len();

    // Segment boundaries, nudged forward to the next separator. Nudging is
    // monotone, so ranges stay well-formed even when records are huge.
    let mut segs = vec![0usize; cpus + 1];
    segs[cpus] = len;
    for i in 1..cpus {
        let mut s = len * i / cpus;
        while s < len && data[s] != sep {
            s += 1;
        }
        segs[i] = s;
    }

    let mut results: Vec<Result<IngestStats>> = Vec::with_capacity(cpus);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(cpus);
        for (i, reader) in readers.iter_mut().enumerate() {
            let range = &data[segs[i]..segs[i + 1]];
            let seq0 = initial_offset + segs[i] as u64;
            let cfg = &*ctx.cfg;
            let progress = &*ctx.progress;
            let warn = &*ctx.warn;
            handles.push(scope.spawn(move || -> Result<IngestStats> {
                let mut sst =
                    SerializationState::new(fname, i as u16, seq0, reader, cfg, progress, warn);
                parse_text_chunk(&mut sst, range, sep, layername)?;
                Ok(IngestStats {
                    dist_sum: sst.dist_sum,
                    dist_count: sst.dist_count,
                    area_sum: sst.area_sum,
                    features: sst.feature_count,
                })
            }));
        }
        for h in handles {
            results.push(
                h.join()
                    .unwrap_or_else(|_| Err(Error::Thread("parser panicked".to_string()))),
            );
        }
    });

    let mut total = IngestStats::default();
    for r in results {
        total += r?;
    }
    Ok(total)
}

// ============================================================================
// Serial fallback with chunked parallel parsing
// ============================================================================

type PendingParse = JoinHandle<Result<(Vec<Reader>, IngestStats)>>;

/// Read a non-mappable stream, parsing separator-aligned chunks with the
/// full worker group. Returns the stats and the number of bytes consumed.
pub fn ingest_stream<R: Read>(
    ctx: &IngestContext,
    mut input: R,
    fname: &str,
    layername: &str,
    initial_offset: u64,
    readers: &mut Vec<Reader>,
) -> Result<(IngestStats, u64)> {
    let mut stats = IngestStats::default();
    let mut sep: Option<u8> = None;
    let mut chunk = TempStore::create(&ctx.cfg.tmp_dir, "read")?;
    let mut ahead: u64 = 0;
    let mut offset = initial_offset;
    let mut pending: Option<PendingParse> = None;
    let mut buf = [0u8; 8192];

    loop {
        let n = input.read(&mut buf).map_err(|e| Error::read(fname, e))?;
        if n == 0 {
            break;
        }
        let s = *sep.get_or_insert(if buf[0] == RS { RS } else { b'\n' });
        chunk.append(&buf[..n])?;
        ahead += n as u64;

        if buf[n - 1] == s && ahead > PARSE_MIN {
            // Don't let the reader get far ahead of the parsers: hand off
            // only when the previous group finished, unless the buffered
            // input has grown past the hard cap.
            let finished = pending.as_ref().map_or(true, |h| h.is_finished());
            if finished || ahead >= PARSE_MAX {
                if let Some(h) = pending.take() {
                    let (r, st) = join_parse(h)?;
                    *readers = r;
                    stats += st;
                }

                let mut owned = std::mem::take(readers);
                let mut chunk_store = std::mem::replace(
                    &mut chunk,
                    TempStore::create(&ctx.cfg.tmp_dir, "read")?,
                );
                let ctx2 = ctx.clone();
                let fname2 = fname.to_string();
                let layer2 = layername.to_string();
                let chunk_offset = offset;
                pending = Some(
                    std::thread::Builder::new()
                        .name("parse-group".to_string())
                        .spawn(move || {
                            let map = chunk_store.map()?;
                            // Sequential, but from several cursors at once.
                            advise(&map, Advice::Random);
                            let st = ingest_mapped(
                                &ctx2,
                                &map,
                                s,
                                chunk_offset,
                                &fname2,
                                &layer2,
                                &mut owned,
                            )?;
                            Ok((owned, st))
                        })
                        .map_err(|e| Error::Thread(format!("spawn parser: {}", e)))?,
                );
                offset += ahead;
                ahead = 0;
            }
        }
    }

    if let Some(h) = pending.take() {
        let (r, st) = join_parse(h)?;
        *readers = r;
        stats += st;
    }

    if ahead > 0 {
        let map = chunk.map()?;
        advise(&map, Advice::Random);
        let s = sep.unwrap_or(b'\n');
        stats += ingest_mapped(ctx, &map, s, offset, fname, layername, readers)?;
        offset += ahead;
    }

    Ok((stats, offset - initial_offset))
}

fn join_parse(handle: PendingParse) -> Result<(Vec<Reader>, IngestStats)> {
    handle
        .join()
        .map_err(|_| Error::Thread("parser panicked".to_string()))?
}

// ============================================================================
// Source dispatch
// ============================================================================

/// Ingest one source, advancing the global byte offset. An unreadable
/// source file is skipped with a warning, as the original tool skipped it.
pub fn ingest_source(
    ctx: &IngestContext,
    source: &Source,
    layername: &str,
    overall_offset: &mut u64,
    readers: &mut Vec<Reader>,
) -> Result<IngestStats> {
    let path = match &source.file {
        None => {
            let stdin = std::io::stdin();
            let (stats, consumed) = ingest_stream(
                ctx,
                stdin.lock(),
                "standard input",
                layername,
                *overall_offset,
                readers,
            )?;
            *overall_offset += consumed;
            return Ok(stats);
        }
        Some(p) => p,
    };

    let fname = path.display().to_string();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("{}: {}", fname, e);
            return Ok(IngestStats::default());
        }
    };

    if fname.ends_with(".gz") {
        let (stats, consumed) = ingest_stream(
            ctx,
            MultiGzDecoder::new(file),
            &fname,
            layername,
            *overall_offset,
            readers,
        )?;
        *overall_offset += consumed;
        return Ok(stats);
    }

    let len = file
        .metadata()
        .map_err(|e| Error::stat(fname.clone(), e))?
        .len();
    if len == 0 {
        return Ok(IngestStats::default());
    }

    let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::map(fname.clone(), e))?;

    // RS-separated sequences always parse in parallel; plain newline text
    // only when asked, since a pretty-printed document cannot be split.
    let sep = if map[0] == RS {
        Some(RS)
    } else if ctx.cfg.read_parallel {
        Some(b'\n')
    } else {
        None
    };

    match sep {
        Some(sep) => {
            advise(&map, Advice::Random);
            let stats = ingest_mapped(ctx, &map, sep, *overall_offset, &fname, layername, readers)?;
            *overall_offset += len;
            Ok(stats)
        }
        None => {
            drop(map);
            let (stats, consumed) =
                ingest_stream(ctx, file, &fname, layername, *overall_offset, readers)?;
            *overall_offset += consumed;
            Ok(stats)
        }
    }
}

// ============================================================================
// Layer naming
// ============================================================================

/// Derive a layer name from a source's file name: strip known extensions,
/// keep identifier-safe and non-ASCII characters, fall back to `unknownN`.
pub fn layer_name_for_source(source: &Source, index: usize) -> String {
    if let Some(layer) = &source.layer {
        if !layer.is_empty() {
            return layer.clone();
        }
    }

    let base = source
        .file
        .as_deref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut trunc = base;
    let trims = [
        ".json", ".geojson", ".geobuf", ".fgb", ".mbtiles", ".pmtiles", ".csv", ".gz",
    ];
    let mut again = true;
    while again {
        again = false;
        for t in trims {
            if trunc.len() > t.len() && trunc.ends_with(t) {
                trunc.truncate(trunc.len() - t.len());
                again = true;
            }
        }
    }

    let out: String = trunc
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || !c.is_ascii())
        .collect();

    if out.is_empty() {
        format!("unknown{}", index)
    } else {
        out
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tilepress_core::{IndexEntry, INDEX_RECORD_SIZE};

    fn context(dir: &TempDir, threads: usize) -> IngestContext {
        let mut cfg = PipelineConfig::default();
        cfg.tmp_dir = dir.path().to_path_buf();
        cfg.quiet = true;
        cfg.max_threads = Some(threads);
        IngestContext {
            cfg: Arc::new(cfg),
            progress: Arc::new(Progress::new(true, 0.0)),
            warn: Arc::new(WarnLatches::default()),
        }
    }

    fn make_readers(ctx: &IngestContext, n: usize, dir: &TempDir) -> Vec<Reader> {
        (0..n)
            .map(|_| Reader::create(dir.path(), ctx.cfg.pool_spill_bytes).unwrap())
            .collect()
    }

    fn feature_line(lon: f64, lat: f64) -> String {
        format!(
            r#"{{"type":"Feature","properties":{{}},"geometry":{{"type":"Point","coordinates":[{},{}]}}}}"#,
            lon, lat
        )
    }

    #[test]
    fn test_parallel_ingest_covers_all_records() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 4);
        let mut readers = make_readers(&ctx, 4, &dir);

        let mut text = String::new();
        for i in 0..200 {
            text.push_str(&feature_line(i as f64 / 100.0, 0.0));
            text.push('\n');
        }

        let stats =
            ingest_mapped(&ctx, text.as_bytes(), b'\n', 0, "in", "layer", &mut readers).unwrap();
        assert_eq!(stats.features, 200);

        let total: u64 = readers
            .iter()
            .map(|r| r.index.len() / INDEX_RECORD_SIZE as u64)
            .sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn test_worker_seq_equals_byte_offset_order() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 2);
        let mut readers = make_readers(&ctx, 2, &dir);

        let mut text = String::new();
        for i in 0..50 {
            text.push_str(&feature_line(i as f64, 1.0));
            text.push('\n');
        }
        ingest_mapped(&ctx, text.as_bytes(), b'\n', 500, "in", "layer", &mut readers).unwrap();

        // Sequence numbers across both workers are unique and respect the
        // byte order of the input.
        let mut seqs = Vec::new();
        for (w, r) in readers.iter_mut().enumerate() {
            let map = r.index.map().unwrap();
            let mut prev = None;
            for off in (0..map.len()).step_by(INDEX_RECORD_SIZE) {
                let e = IndexEntry::read_at(&map, off).unwrap();
                assert!(e.seq >= 500);
                if let Some(p) = prev {
                    assert!(e.seq > p, "worker {} seq not increasing", w);
                }
                prev = Some(e.seq);
                seqs.push(e.seq);
            }
        }
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seqs.len());
    }

    #[test]
    fn test_stream_ingest_matches_mapped() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 2);
        let mut readers = make_readers(&ctx, 2, &dir);

        let mut text = String::new();
        for i in 0..100 {
            text.push_str(&feature_line(i as f64 / 10.0, -1.0));
            text.push('\n');
        }

        let (stats, consumed) = ingest_stream(
            &ctx,
            text.as_bytes(),
            "stream",
            "layer",
            0,
            &mut readers,
        )
        .unwrap();
        assert_eq!(stats.features, 100);
        assert_eq!(consumed, text.len() as u64);
    }

    #[test]
    fn test_gz_source_ingests() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 2);
        let mut readers = make_readers(&ctx, 2, &dir);

        let mut text = String::new();
        for i in 0..20 {
            text.push_str(&feature_line(i as f64, 2.0));
            text.push('\n');
        }
        let gz_path = dir.path().join("input.geojson.gz");
        let mut enc = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap();

        let source = Source {
            file: Some(gz_path),
            ..Source::default()
        };
        let mut offset = 0u64;
        let stats =
            ingest_source(&ctx, &source, "layer", &mut offset, &mut readers).unwrap();
        assert_eq!(stats.features, 20);
        assert_eq!(offset, text.len() as u64);
    }

    #[test]
    fn test_missing_source_skipped() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 1);
        let mut readers = make_readers(&ctx, 1, &dir);
        let source = Source {
            file: Some(dir.path().join("no-such-file.json")),
            ..Source::default()
        };
        let mut offset = 0u64;
        let stats =
            ingest_source(&ctx, &source, "layer", &mut offset, &mut readers).unwrap();
        assert_eq!(stats.features, 0);
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_layer_names() {
        let named = Source {
            layer: Some("roads".to_string()),
            ..Source::default()
        };
        assert_eq!(layer_name_for_source(&named, 0), "roads");

        let from_file = Source {
            file: Some(PathBuf::from("/data/rivers-2024.geojson.gz")),
            ..Source::default()
        };
        assert_eq!(layer_name_for_source(&from_file, 0), "rivers2024");

        let nameless = Source::default();
        assert_eq!(layer_name_for_source(&nameless, 3), "unknown3");
    }
}
