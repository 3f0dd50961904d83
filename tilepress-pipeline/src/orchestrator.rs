//! Pipeline lifecycle.
//!
//! Sequences the run: resource probing, per-worker readers, source
//! ingest, pool merge, vertex/node dedup, spatial sort, auto-tune, the
//! minzoom fixup, and metadata assembly, then hands the outputs to the
//! external tiler. The tiler, archive writers, and binary-format parsers
//! are collaborators behind the [`Tiler`] and [`MetadataSink`] traits;
//! everything the core owes them is in [`PipelineOutput`].

use crate::config::{BasezoomSpec, DroprateSpec, PipelineConfig};
use crate::drop_policy::{rewrite_minzooms, DropPolicy};
use crate::ingest::{ingest_source, layer_name_for_source, IngestContext, IngestStats, Source};
use crate::metadata::{merge_layermaps, Metadata};
use crate::progress::Progress;
use crate::resources;
use crate::serializer::{LayerEntry, Reader};
use crate::sorter::SpatialSorter;
use crate::string_pool::{merge_pools, MergedPool};
use crate::temp_store::{advise, TempStore};
use crate::vertex::{detect_shared_nodes, dedupe_nodes, external_sort, SharedNodeBloom, Vertex};
use memmap2::Advice;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tilepress_core::error::{Error, Result};
use tilepress_core::projection::tile_to_lonlat;
use tilepress_core::INDEX_RECORD_SIZE;

/// Size of the geometry stream header: `{estimated_complexity: u64,
/// iz: u32, ix: u32, iy: u32, reserved: u32}`.
pub const GEOM_HEADER_SIZE: u64 = 24;

/// Everything the pipeline produces for the tiler.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Header, features in `(ix, seq)` order with assigned minzoom bytes,
    /// then a zero u64 terminator. The header's first word holds the
    /// final byte count as an estimated complexity.
    pub geom: TempStore,
    /// Sorted 32-byte index entries, contiguous over the geometry stream.
    pub index: TempStore,
    pub stringpool: MergedPool,
    /// Sorted, deduplicated shared-node keys.
    pub shared_nodes: TempStore,
    pub shared_node_count: u64,
    pub bloom: SharedNodeBloom,

    /// Per-worker layer tables, for translating per-segment layer ids.
    pub layermaps: Vec<FxHashMap<String, LayerEntry>>,
    pub metadata: Metadata,

    pub minzoom: i32,
    pub maxzoom: i32,
    pub basezoom: i32,
    pub droprate: f64,
    pub cluster_maxzoom: i32,
    /// The root tile written into the geometry header.
    pub root: (u32, u32, u32),
    pub feature_count: u64,
}

/// What the tiler reports back after traversing the zoom range.
pub struct TilerReport {
    /// Deepest zoom fully written.
    pub written_maxzoom: i32,
    /// Mid tile at the written maxzoom, for the metadata center.
    pub midx: u32,
    pub midy: u32,
    /// Tile-assembly strategies used, for the metadata.
    pub strategies: Vec<String>,
}

/// The downstream per-tile assembly stage.
pub trait Tiler {
    fn traverse_zooms(&mut self, output: &mut PipelineOutput) -> Result<TilerReport>;
}

/// Wherever tileset metadata ends up (archive table, directory file).
pub trait MetadataSink {
    fn write(&mut self, metadata: &Metadata) -> Result<()>;
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    cfg: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    /// Resolve the defaults the caller left open: an unspecified base zoom
    /// is the maxzoom unless the maxzoom itself is being guessed, detail
    /// shrinks to fit a deep maxzoom, and a guessed drop rate without a
    /// guessed maxzoom is a contract error.
    fn normalized_config(&self) -> Result<Arc<PipelineConfig>> {
        let mut cfg = (*self.cfg).clone();

        if matches!(cfg.droprate, DroprateSpec::Auto) && !cfg.maxzoom_guess {
            return Err(Error::Args(
                "guessing the drop rate requires guessing the maxzoom".to_string(),
            ));
        }

        if !cfg.maxzoom_guess {
            if cfg.minzoom > cfg.maxzoom {
                return Err(Error::Args(format!(
                    "minimum zoom {} cannot be greater than maxzoom {}",
                    cfg.minzoom, cfg.maxzoom
                )));
            }
            if cfg.maxzoom > 32 - cfg.full_detail {
                cfg.full_detail = 32 - cfg.maxzoom;
                tracing::warn!(
                    full_detail = cfg.full_detail,
                    maxzoom = cfg.maxzoom,
                    "highest supported detail at this maxzoom"
                );
            }
            if matches!(cfg.basezoom, BasezoomSpec::Unspecified) {
                cfg.basezoom = BasezoomSpec::Zoom(cfg.maxzoom);
            }
        }
        if cfg.min_detail > cfg.full_detail {
            cfg.min_detail = cfg.full_detail;
        }

        Ok(Arc::new(cfg))
    }

    /// Run the full core pipeline and hand the result to the tiler, then
    /// write metadata. Returns the final metadata; an incomplete tiling
    /// (fewer zooms written than requested, but at least the minzoom)
    /// surfaces as [`Error::Incomplete`] after metadata is written.
    pub fn run(
        &self,
        sources: &[Source],
        tiler: &mut dyn Tiler,
        sink: &mut dyn MetadataSink,
    ) -> Result<Metadata> {
        let mut output = self.ingest_to_output(sources)?;
        let report = tiler.traverse_zooms(&mut output)?;

        let requested_maxzoom = output.maxzoom;
        let mut incomplete = false;
        if report.written_maxzoom != output.maxzoom {
            if report.written_maxzoom > output.minzoom {
                tracing::warn!(
                    written = report.written_maxzoom,
                    requested = output.maxzoom,
                    "tiles only complete through part of the zoom range"
                );
                output.maxzoom = report.written_maxzoom;
                output.metadata.maxzoom = report.written_maxzoom;
                incomplete = true;
            } else {
                return Err(Error::NoData);
            }
        }

        // Center on the tiler's mid tile, clamped into the file bounds.
        let (lon1, lat1) = tile_to_lonlat(
            report.midx as i64,
            report.midy as i64,
            output.maxzoom as u32,
        );
        let (lon2, lat2) = tile_to_lonlat(
            report.midx as i64 + 1,
            report.midy as i64 + 1,
            output.maxzoom as u32,
        );
        let m = &mut output.metadata;
        m.midlon = ((lon1 + lon2) / 2.0).clamp(m.minlon, m.maxlon);
        m.midlat = ((lat1 + lat2) / 2.0).clamp(m.minlat, m.maxlat);
        m.strategies = report.strategies;

        sink.write(&output.metadata)?;

        if incomplete {
            return Err(Error::Incomplete {
                written: output.maxzoom,
                maxzoom: requested_maxzoom,
            });
        }
        Ok(output.metadata.clone())
    }

    /// Everything up to the tiler hand-off: ingest, merges, sort, tuning,
    /// and the minzoom fixup.
    pub fn ingest_to_output(&self, sources: &[Source]) -> Result<PipelineOutput> {
        let cfg = self.normalized_config()?;
        let cfg = &cfg;
        resources::ignore_sigpipe();
        let budget = resources::probe(cfg.max_threads)?;

        let progress = Arc::new(Progress::new(cfg.quiet, cfg.progress_interval));
        let ctx = IngestContext {
            cfg: Arc::clone(cfg),
            progress: Arc::clone(&progress),
            warn: Arc::new(Default::default()),
        };

        let mut readers = Vec::with_capacity(budget.cpus);
        for _ in 0..budget.cpus {
            readers.push(Reader::create(&cfg.tmp_dir, cfg.pool_spill_bytes)?);
        }

        let diskfree = resources::available_disk(&cfg.tmp_dir);
        let disk_warned = AtomicBool::new(false);

        // Assign layer names up front so every worker maps a source's
        // layer to the same id.
        let layer_names = self.assign_layer_names(sources, &mut readers);

        let files_before = resources::probe_fd_floor()?;

        let mut stats = IngestStats::default();
        let mut overall_offset = 0u64;
        for (i, source) in sources.iter().enumerate() {
            stats += ingest_source(&ctx, source, &layer_names[i], &mut overall_offset, &mut readers)?;

            let used: u64 = readers.iter().map(Reader::projected_bytes).sum();
            resources::warn_if_disk_tight(used, diskfree, &disk_warned);
        }

        let files_after = resources::probe_fd_floor()?;
        if files_after > files_before {
            return Err(Error::Impossible(format!(
                "files left open after reading input ({} vs {})",
                files_before, files_after
            )));
        }
        progress.clear();

        // Decompose the readers: pools, vertex/node streams, sort inputs,
        // bounding boxes, and layer tables all outlive them.
        let mut pools = Vec::with_capacity(readers.len());
        let mut vertex_files: Vec<File> = Vec::with_capacity(readers.len());
        let mut node_stores: Vec<TempStore> = Vec::with_capacity(readers.len());
        let mut sort_inputs: Vec<(File, File)> = Vec::with_capacity(readers.len());
        let mut layermaps = Vec::with_capacity(readers.len());
        let mut file_bbox = [i64::MAX, i64::MAX, i64::MIN, i64::MIN];
        let mut file_bbox1 = file_bbox;
        let mut file_bbox2 = file_bbox;

        for reader in readers {
            let Reader {
                geom,
                index,
                pool,
                vertices,
                nodes,
                file_bbox: rb,
                file_bbox1: rb1,
                file_bbox2: rb2,
                layermap,
            } = reader;
            pools.push(pool.into_pool());
            vertex_files.push(vertices.into_file()?);
            node_stores.push(nodes);
            sort_inputs.push((geom.into_file()?, index.into_file()?));
            layermaps.push(layermap);
            merge_bbox(&mut file_bbox, &rb);
            merge_bbox(&mut file_bbox1, &rb1);
            merge_bbox(&mut file_bbox2, &rb2);
        }

        progress.phase("Merging string pool");
        let stringpool = merge_pools(pools, &cfg.tmp_dir, 2 * budget.cpus)?;

        progress.phase("Merging vertices");
        let sort_budget = cfg.memory_budget / 20;
        let mut sorted_vertices =
            external_sort::<Vertex>(vertex_files, &cfg.tmp_dir, sort_budget, "vertex")?;
        detect_shared_nodes(&mut sorted_vertices, &mut node_stores[0], cfg.curve)?;
        drop(sorted_vertices);

        progress.phase("Merging nodes");
        let mut node_files = Vec::with_capacity(node_stores.len());
        for store in node_stores {
            node_files.push(store.into_file()?);
        }
        let mut sorted_nodes =
            external_sort::<u64>(node_files, &cfg.tmp_dir, sort_budget, "node")?;
        let mut shared_nodes = TempStore::create(&cfg.tmp_dir, "shared-nodes")?;
        let mut bloom = SharedNodeBloom::new();
        let shared_node_count = dedupe_nodes(&mut sorted_nodes, &mut shared_nodes, &mut bloom)?;
        drop(sorted_nodes);

        // Root tile and the geometry header.
        let (iz, root_x, root_y) = crate::tuner::choose_first_zoom(
            &mut file_bbox,
            cfg.minzoom,
            cfg.buffer,
        );

        let mut out_geom = TempStore::create(&cfg.tmp_dir, "geom")?;
        let mut out_index = TempStore::create(&cfg.tmp_dir, "index")?;
        let mut header = Vec::with_capacity(GEOM_HEADER_SIZE as usize);
        header.extend_from_slice(&0u64.to_le_bytes()); // patched below
        header.extend_from_slice(&iz.to_le_bytes());
        header.extend_from_slice(&root_x.to_le_bytes());
        header.extend_from_slice(&root_y.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // reserved
        out_geom.append(&header)?;

        // First drop pass. When the base zoom or drop rate are still to
        // be tuned, the provisional pass assigns zero and the fixup below
        // rewrites every byte.
        let (prov_basezoom, prov_droprate) = match (cfg.basezoom, cfg.droprate) {
            (BasezoomSpec::Zoom(z), DroprateSpec::Rate(r)) => (z, r),
            _ => (-1, 2.5),
        };
        let mut policy = DropPolicy::new(cfg, cfg.maxzoom, prov_basezoom, prov_droprate);

        // Each reader pair has a geom and an index descriptor; reserve the
        // pool, output streams, and stdio besides.
        let availfiles = budget.max_files
            - 2 * budget.cpus as i64 // reader geom + index
            - 3 // pool, archive, archive journal
            - 4 // top-level geom and index output
            - 3; // stdio
        let mut sorter = SpatialSorter::new(
            cfg,
            &mut policy,
            &progress,
            budget.cpus,
            availfiles,
        );
        sorter.sort(sort_inputs, &mut out_geom, &mut out_index)?;
        drop(sorter);

        out_geom.append(&0u64.to_le_bytes())?; // end of tile
        let estimated_complexity = out_geom.len();
        out_geom.write_at(&estimated_complexity.to_le_bytes(), 0)?;

        let feature_count = out_index.len() / INDEX_RECORD_SIZE as u64;
        progress.clear();
        tracing::info!(
            features = feature_count,
            geometry_bytes = out_geom.len(),
            pool_bytes = stringpool.store.len(),
            shared_nodes = shared_node_count,
            "ingest complete"
        );

        if feature_count == 0 {
            return Err(Error::NoData);
        }

        // Tune and, when needed, rewrite the minzoom bytes in place.
        let index_map = out_index.map()?;
        advise(&index_map, Advice::Sequential);
        advise(&index_map, Advice::WillNeed);
        let tuning = crate::tuner::auto_tune(&index_map, cfg, &stats, &progress)?;

        if tuning.fix_dropping || cfg.drop_denser > 0 {
            let mut policy = DropPolicy::new(
                cfg,
                tuning.maxzoom,
                tuning.basezoom,
                tuning.droprate,
            );
            let mut geom_map = out_geom.map_mut()?;
            rewrite_minzooms(&mut geom_map, &index_map, &mut policy, cfg.drop_denser)?;
        }
        drop(index_map);
        progress.clear();

        let metadata = build_metadata(
            cfg,
            &tuning,
            &file_bbox,
            &file_bbox1,
            &file_bbox2,
            &layermaps,
        );

        Ok(PipelineOutput {
            geom: out_geom,
            index: out_index,
            stringpool,
            shared_nodes,
            shared_node_count,
            bloom,
            layermaps,
            metadata,
            minzoom: cfg.minzoom,
            maxzoom: tuning.maxzoom,
            basezoom: tuning.basezoom,
            droprate: tuning.droprate,
            cluster_maxzoom: tuning.cluster_maxzoom,
            root: (iz, root_x, root_y),
            feature_count,
        })
    }

    /// Names for each source's layer, registered into every worker with
    /// the same id so features agree across segments.
    fn assign_layer_names(&self, sources: &[Source], readers: &mut [Reader]) -> Vec<String> {
        let mut names = Vec::with_capacity(sources.len());
        let mut ids: FxHashMap<String, u16> = FxHashMap::default();

        for (i, source) in sources.iter().enumerate() {
            let name = layer_name_for_source(source, i);
            if !ids.contains_key(&name) {
                let id = ids.len() as u16;
                ids.insert(name.clone(), id);
                let entry = LayerEntry {
                    id,
                    description: source.description.clone().unwrap_or_default(),
                    minzoom: 0,
                    maxzoom: 0,
                };
                for reader in readers.iter_mut() {
                    reader.layermap.insert(name.clone(), entry.clone());
                }
                if source.layer.is_none() {
                    tracing::info!(layer = %name, source = i, "derived layer name");
                }
            }
            names.push(name);
        }
        names
    }
}

fn build_metadata(
    cfg: &PipelineConfig,
    tuning: &crate::tuner::Tuning,
    file_bbox: &[i64; 4],
    file_bbox1: &[i64; 4],
    file_bbox2: &[i64; 4],
    layermaps: &[FxHashMap<String, LayerEntry>],
) -> Metadata {
    let (minlon, maxlat) = tile_to_lonlat(file_bbox[0], file_bbox[1], 32);
    let (maxlon, minlat) = tile_to_lonlat(file_bbox[2], file_bbox[3], 32);

    // The narrower of the two candidate bboxes wins; the rotated one is
    // translated back to real longitudes.
    let bounds2 = if file_bbox2[2] - file_bbox2[0] < file_bbox1[2] - file_bbox1[0] {
        let unrotate = |lon: f64| {
            if lon > 0.0 {
                lon - 180.0
            } else {
                lon + 180.0
            }
        };
        let (lon_a, lat_a) = tile_to_lonlat(file_bbox2[0], file_bbox2[1], 32);
        let (lon_b, lat_b) = tile_to_lonlat(file_bbox2[2], file_bbox2[3], 32);
        [unrotate(lon_a), lat_b, unrotate(lon_b), lat_a]
    } else {
        let (lon_a, lat_a) = tile_to_lonlat(file_bbox1[0], file_bbox1[1], 32);
        let (lon_b, lat_b) = tile_to_lonlat(file_bbox1[2], file_bbox1[3], 32);
        [lon_a, lat_b, lon_b, lat_a]
    };

    let mut layer_map = merge_layermaps(layermaps);
    for meta in layer_map.values_mut() {
        meta.minzoom = cfg.minzoom;
        meta.maxzoom = tuning.maxzoom;
    }

    Metadata {
        name: cfg.name.clone(),
        description: cfg.description.clone(),
        attribution: cfg.attribution.clone(),
        minzoom: cfg.minzoom,
        maxzoom: tuning.maxzoom,
        minlat,
        minlon,
        maxlat,
        maxlon,
        midlat: (minlat + maxlat) / 2.0,
        midlon: (minlon + maxlon) / 2.0,
        bounds2,
        layer_map,
        basezoom: tuning.basezoom,
        droprate: tuning.droprate,
        retain_points_multiplier: cfg.retain_points_multiplier,
        strategies: Vec::new(),
    }
}

fn merge_bbox(acc: &mut [i64; 4], other: &[i64; 4]) {
    acc[0] = acc[0].min(other[0]);
    acc[1] = acc[1].min(other[1]);
    acc[2] = acc[2].max(other[2]);
    acc[3] = acc[3].max(other[3]);
}
