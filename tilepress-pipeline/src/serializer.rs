//! Feature serialization into per-worker temp streams.
//!
//! Each ingest worker owns a [`Reader`]: its geometry, index, vertex, and
//! node streams, its string pool, and its running bounding boxes. The
//! serializer turns one parsed feature into a geometry record plus an
//! index entry, interning attribute strings and emitting interior vertices
//! along the way. Workers never share a `Reader`, so none of this needs a
//! lock.

use crate::config::PipelineConfig;
use crate::progress::Progress;
use crate::string_pool::StringPool;
use crate::temp_store::TempStore;
use crate::vertex::{FixedRecord, Vertex, VERTEX_RECORD_SIZE};
use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tilepress_core::error::Result;
use tilepress_core::geometry::{bounds, ring_area, Draw, DrawOp, DrawVec, GeomKind};
use tilepress_core::spatial_key::encode_index;
use tilepress_core::{IndexEntry, SerialFeature, SerialVal};

/// Full extent of one plane axis.
const PLANE: i64 = 1 << 32;

// ============================================================================
// Reader
// ============================================================================

/// A layer known to one worker.
#[derive(Debug, Clone, Default)]
pub struct LayerEntry {
    pub id: u16,
    pub description: String,
    pub minzoom: i32,
    pub maxzoom: i32,
}

/// One ingest worker's private output state.
pub struct Reader {
    pub geom: TempStore,
    pub index: TempStore,
    pub pool: StringPool,
    pub vertices: TempStore,
    pub nodes: TempStore,

    /// Raw bbox; may extend off the plane for antimeridian-wrapped input.
    pub file_bbox: [i64; 4],
    /// Candidate bbox clamped onto the plane.
    pub file_bbox1: [i64; 4],
    /// Candidate bbox with x rotated half a world, for data clustered
    /// around the antimeridian.
    pub file_bbox2: [i64; 4],

    /// Layers this worker has written, by name.
    pub layermap: FxHashMap<String, LayerEntry>,
}

const EMPTY_BBOX: [i64; 4] = [i64::MAX, i64::MAX, i64::MIN, i64::MIN];

impl Reader {
    pub fn create(dir: &Path, pool_spill: usize) -> Result<Self> {
        Ok(Self {
            geom: TempStore::create(dir, "geom")?,
            index: TempStore::create(dir, "index")?,
            pool: StringPool::new(dir, pool_spill),
            vertices: TempStore::create(dir, "vertex")?,
            nodes: TempStore::create(dir, "node")?,
            file_bbox: EMPTY_BBOX,
            file_bbox1: EMPTY_BBOX,
            file_bbox2: EMPTY_BBOX,
            layermap: FxHashMap::default(),
        })
    }

    /// Bytes this worker has committed or will commit during sorting:
    /// geometry and index are duplicated by the sort, the pool is used
    /// once.
    pub fn projected_bytes(&self) -> u64 {
        2 * self.geom.len() + 2 * self.index.len() + self.pool.off()
            + self.vertices.len()
            + self.nodes.len()
    }
}

fn fold_bbox(acc: &mut [i64; 4], x: i64, y: i64) {
    acc[0] = acc[0].min(x);
    acc[1] = acc[1].min(y);
    acc[2] = acc[2].max(x);
    acc[3] = acc[3].max(y);
}

// ============================================================================
// Warn-once latches
// ============================================================================

/// One latch per per-feature problem kind: the first occurrence is logged
/// with its source location, later ones are suppressed.
#[derive(Default)]
pub struct WarnLatches {
    pub null_geometry: AtomicBool,
    pub bad_geometry_type: AtomicBool,
    pub missing_coordinates: AtomicBool,
    pub unknown_geometry: AtomicBool,
    pub empty_geometry: AtomicBool,
    pub id_negative: AtomicBool,
    pub id_fraction: AtomicBool,
    pub id_too_large: AtomicBool,
    pub id_non_numeric: AtomicBool,
    pub not_a_feature: AtomicBool,
}

impl WarnLatches {
    /// Log `msg` the first time `latch` fires; drop later occurrences.
    pub fn warn_once(latch: &AtomicBool, fname: &str, line: u64, msg: &str) {
        if !latch.swap(true, Ordering::Relaxed) {
            tracing::warn!("{}:{}: {} (additional not reported)", fname, line, msg);
        }
    }
}

// ============================================================================
// Serialization state
// ============================================================================

/// Attribute value before string interning.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrVal {
    Double(f64),
    Int(i64),
    UInt(u64),
    String(String),
    Bool(bool),
    Null,
}

/// One parsed feature, projected but not yet serialized.
#[derive(Debug, Clone)]
pub struct ParsedFeature {
    pub kind: GeomKind,
    pub geometry: DrawVec,
    pub id: Option<u64>,
    pub attrs: Vec<(String, AttrVal)>,
    pub minzoom_hint: i16,
    pub maxzoom_hint: i16,
}

/// Everything a parser needs to feed features into one worker.
pub struct SerializationState<'a> {
    pub fname: &'a str,
    pub line: u64,
    pub segment: u16,
    /// Next sequence number; initialized to the worker's input byte offset
    /// so global `seq` order equals input byte order.
    pub seq: u64,
    pub reader: &'a mut Reader,
    pub cfg: &'a PipelineConfig,
    pub progress: &'a Progress,
    pub warn: &'a WarnLatches,
    /// Collect within-feature distance statistics for the auto-tuner.
    pub want_dist: bool,

    pub dist_sum: f64,
    pub dist_count: u64,
    pub area_sum: f64,
    pub feature_count: u64,
}

impl<'a> SerializationState<'a> {
    pub fn new(
        fname: &'a str,
        segment: u16,
        seq: u64,
        reader: &'a mut Reader,
        cfg: &'a PipelineConfig,
        progress: &'a Progress,
        warn: &'a WarnLatches,
    ) -> Self {
        Self {
            fname,
            line: 0,
            segment,
            seq,
            reader,
            cfg,
            progress,
            warn,
            want_dist: cfg.maxzoom_guess,
            dist_sum: 0.0,
            dist_count: 0,
            area_sum: 0.0,
            feature_count: 0,
        }
    }

    fn layer_id(&mut self, layername: &str) -> u16 {
        if let Some(entry) = self.reader.layermap.get(layername) {
            return entry.id;
        }
        let id = self.reader.layermap.len() as u16;
        self.reader.layermap.insert(
            layername.to_string(),
            LayerEntry {
                id,
                ..LayerEntry::default()
            },
        );
        id
    }
}

// ============================================================================
// serialize_feature
// ============================================================================

/// Serialize one feature into the worker's streams. Returns false when the
/// feature had no usable geometry.
pub fn serialize_feature(
    sst: &mut SerializationState,
    pf: ParsedFeature,
    layername: &str,
) -> Result<bool> {
    let bbox = match bounds(&pf.geometry) {
        Some(b) => b,
        None => {
            WarnLatches::warn_once(
                &sst.warn.empty_geometry,
                sst.fname,
                sst.line,
                "feature with empty geometry",
            );
            return Ok(false);
        }
    };

    // Running per-worker bboxes: raw, on-plane, and half-world-rotated.
    for (x, y) in [(bbox[0], bbox[1]), (bbox[2], bbox[3])] {
        fold_bbox(&mut sst.reader.file_bbox, x, y);
        let cy = y.clamp(0, PLANE - 1);
        fold_bbox(&mut sst.reader.file_bbox1, x.clamp(0, PLANE - 1), cy);
        fold_bbox(
            &mut sst.reader.file_bbox2,
            (x + PLANE / 2).rem_euclid(PLANE),
            cy,
        );
    }

    // The spatial key comes from the bounding midpoint of the FIRST part
    // only; a multi-part geometry sorts where its first part lives, not
    // at the center of its combined extent.
    let key_bbox = parts(&pf.geometry)
        .first()
        .and_then(|part| bounds(part))
        .unwrap_or(bbox);
    let midx = ((key_bbox[0] / 2 + key_bbox[2] / 2) & (PLANE - 1)) as u64;
    let midy = ((key_bbox[1] / 2 + key_bbox[3] / 2) & (PLANE - 1)) as u64;
    let ix = encode_index(sst.cfg.curve, midx as u32, midy as u32);

    if sst.want_dist {
        accumulate_stats(sst, &pf);
    }
    if pf.kind != GeomKind::Point {
        emit_vertices(sst.reader, &pf.geometry)?;
    }

    // Intern attribute keys and string values.
    let mut attrs = Vec::with_capacity(pf.attrs.len());
    for (key, val) in &pf.attrs {
        let key_off = sst.reader.pool.intern(key)?;
        let sv = match val {
            AttrVal::Double(d) => SerialVal::Double(*d),
            AttrVal::Int(i) => SerialVal::Int(*i),
            AttrVal::UInt(u) => SerialVal::UInt(*u),
            AttrVal::String(s) => SerialVal::String(sst.reader.pool.intern(s)?),
            AttrVal::Bool(b) => SerialVal::Bool(*b),
            AttrVal::Null => SerialVal::Null,
        };
        attrs.push((key_off, sv));
    }

    let layer = sst.layer_id(layername);
    let sf = SerialFeature {
        layer,
        segment: sst.segment,
        kind: pf.kind,
        id: pf.id,
        minzoom_hint: pf.minzoom_hint,
        maxzoom_hint: pf.maxzoom_hint,
        geometry: pf.geometry,
        seq: sst.seq,
        attrs,
        feature_minzoom: 0, // filled in during index merging
    };

    let bytes = sf.to_bytes();
    let start = sst.reader.geom.append(&bytes)?;
    let entry = IndexEntry {
        ix,
        start,
        end: start + bytes.len() as u64,
        seq: sst.seq,
        kind: pf.kind,
        segment: sst.segment,
    };
    sst.reader.index.append(&entry.to_bytes())?;

    sst.seq += 1;
    sst.feature_count += 1;
    sst.progress.feature_read();
    Ok(true)
}

/// Within-feature spacing and polygon area statistics for the auto-tuner.
fn accumulate_stats(sst: &mut SerializationState, pf: &ParsedFeature) {
    let mut prev: Option<&Draw> = None;
    for d in &pf.geometry {
        match d.op {
            DrawOp::MoveTo => prev = Some(d),
            DrawOp::LineTo => {
                if let Some(p) = prev {
                    let dx = (d.x - p.x) as f64;
                    let dy = (d.y - p.y) as f64;
                    // Pseudo-feet, same empirical conversion the tuner uses.
                    let dist = dx.hypot(dy) / 33.0;
                    if dist > 0.0 {
                        sst.dist_sum += dist.ln();
                        sst.dist_count += 1;
                    }
                }
                prev = Some(d);
            }
            DrawOp::ClosePath => {}
        }
    }

    if pf.kind == GeomKind::Polygon {
        for part in parts(&pf.geometry) {
            sst.area_sum += ring_area(part);
        }
    }
}

/// Split a draw sequence into its MoveTo-delimited parts, coordinates only.
fn parts(geometry: &[Draw]) -> Vec<&[Draw]> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, d) in geometry.iter().enumerate() {
        match d.op {
            DrawOp::MoveTo => {
                if let Some(s) = start {
                    out.push(&geometry[s..i]);
                }
                start = Some(i);
            }
            DrawOp::ClosePath => {
                if let Some(s) = start {
                    out.push(&geometry[s..i]);
                }
                start = None;
            }
            DrawOp::LineTo => {}
        }
    }
    if let Some(s) = start {
        out.push(&geometry[s..]);
    }
    out
}

/// Write one vertex record per strictly interior vertex of each part.
fn emit_vertices(reader: &mut Reader, geometry: &[Draw]) -> Result<()> {
    let mut buf = [0u8; VERTEX_RECORD_SIZE];
    for part in parts(geometry) {
        if part.len() < 3 {
            continue;
        }
        for k in 1..part.len() - 1 {
            let as_u32 = |d: &Draw| (d.x as u32, d.y as u32);
            let v = Vertex::new(as_u32(&part[k]), as_u32(&part[k - 1]), as_u32(&part[k + 1]));
            v.write_le(&mut buf);
            reader.vertices.append(&buf)?;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tilepress_core::projection::lonlat_to_world;
    use tilepress_core::{CurveKind, INDEX_RECORD_SIZE, NO_ZOOM_HINT};

    fn state_parts() -> (TempDir, PipelineConfig, Progress, WarnLatches) {
        let dir = TempDir::new().unwrap();
        let mut cfg = PipelineConfig::default();
        cfg.tmp_dir = dir.path().to_path_buf();
        cfg.quiet = true;
        (dir, cfg, Progress::new(true, 0.0), WarnLatches::default())
    }

    fn point_feature(lon: f64, lat: f64) -> ParsedFeature {
        let (x, y) = lonlat_to_world(lon, lat);
        ParsedFeature {
            kind: GeomKind::Point,
            geometry: vec![Draw::new(DrawOp::MoveTo, x, y)],
            id: None,
            attrs: vec![],
            minzoom_hint: NO_ZOOM_HINT,
            maxzoom_hint: NO_ZOOM_HINT,
        }
    }

    #[test]
    fn test_serialize_point_writes_geom_and_index() {
        let (dir, cfg, progress, warn) = state_parts();
        let mut reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
        let mut sst =
            SerializationState::new("test", 0, 1000, &mut reader, &cfg, &progress, &warn);

        assert!(serialize_feature(&mut sst, point_feature(0.0, 0.0), "layer").unwrap());
        assert_eq!(sst.feature_count, 1);
        assert_eq!(sst.seq, 1001);

        let index = reader.index.map().unwrap();
        assert_eq!(index.len(), INDEX_RECORD_SIZE);
        let e = IndexEntry::read_at(&index, 0).unwrap();
        assert_eq!(e.seq, 1000);
        assert_eq!(e.start, 0);
        assert_eq!(e.end, reader.geom.len());
        assert_eq!(e.kind, GeomKind::Point);

        // The record's spatial key is the bbox midpoint's curve position.
        assert_eq!(
            e.ix,
            encode_index(CurveKind::Quadkey, 1 << 31, 1 << 31)
        );

        // Record round-trips and ends with the (unset) minzoom byte.
        let geom = reader.geom.map().unwrap();
        let (sf, used) = SerialFeature::from_bytes(&geom).unwrap();
        assert_eq!(used as u64, e.end - e.start);
        assert_eq!(sf.feature_minzoom, 0);
        assert_eq!(sf.seq, 1000);
    }

    #[test]
    fn test_coincident_points_share_key_and_bbox_is_one_pixel() {
        let (dir, cfg, progress, warn) = state_parts();
        let mut reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
        let mut sst = SerializationState::new("test", 0, 0, &mut reader, &cfg, &progress, &warn);

        for _ in 0..3 {
            serialize_feature(&mut sst, point_feature(0.0, 0.0), "layer").unwrap();
        }
        assert_eq!(sst.dist_count, 0);

        let index = reader.index.map().unwrap();
        let keys: Vec<u64> = (0..3)
            .map(|i| IndexEntry::read_at(&index, i * INDEX_RECORD_SIZE).unwrap().ix)
            .collect();
        assert_eq!(keys[0], keys[1]);
        assert_eq!(keys[1], keys[2]);
        assert_eq!(
            reader.file_bbox,
            [1 << 31, 1 << 31, 1 << 31, 1 << 31]
        );
    }

    #[test]
    fn test_line_emits_interior_vertices_only() {
        let (dir, cfg, progress, warn) = state_parts();
        let mut reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
        let mut sst = SerializationState::new("test", 0, 0, &mut reader, &cfg, &progress, &warn);

        let pf = ParsedFeature {
            kind: GeomKind::Line,
            geometry: vec![
                Draw::new(DrawOp::MoveTo, 100, 100),
                Draw::new(DrawOp::LineTo, 200, 100),
                Draw::new(DrawOp::LineTo, 300, 100),
                Draw::new(DrawOp::LineTo, 400, 100),
            ],
            id: None,
            attrs: vec![],
            minzoom_hint: NO_ZOOM_HINT,
            maxzoom_hint: NO_ZOOM_HINT,
        };
        serialize_feature(&mut sst, pf, "roads").unwrap();

        // 4 points -> 2 interior vertices.
        assert_eq!(reader.vertices.len(), 2 * VERTEX_RECORD_SIZE as u64);
        let map = reader.vertices.map().unwrap();
        let v = Vertex::read_le(&map[..VERTEX_RECORD_SIZE]);
        assert_eq!(v.mid, (200, 100));
        assert_eq!(v.p1, (100, 100));
        assert_eq!(v.p2, (300, 100));
    }

    #[test]
    fn test_string_attrs_interned() {
        let (dir, cfg, progress, warn) = state_parts();
        let mut reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
        let mut sst = SerializationState::new("test", 0, 0, &mut reader, &cfg, &progress, &warn);

        let mut pf = point_feature(1.0, 1.0);
        pf.attrs = vec![
            ("name".to_string(), AttrVal::String("Main St".to_string())),
            ("lanes".to_string(), AttrVal::Int(2)),
        ];
        serialize_feature(&mut sst, pf, "roads").unwrap();

        let geom = reader.geom.map().unwrap();
        let (sf, _) = SerialFeature::from_bytes(&geom).unwrap();
        assert_eq!(sf.attrs.len(), 2);
        let pool = reader.pool.into_pool();
        let mem = pool.mem_part();
        assert_eq!(
            crate::string_pool::pool_str(mem, sf.attrs[0].0),
            Some("name")
        );
        match sf.attrs[0].1 {
            SerialVal::String(off) => {
                assert_eq!(crate::string_pool::pool_str(mem, off), Some("Main St"))
            }
            ref other => panic!("unexpected value {:?}", other),
        }
        assert_eq!(sf.attrs[1].1, SerialVal::Int(2));
    }

    #[test]
    fn test_dist_stats_accumulate_within_feature() {
        let (dir, mut cfg, progress, warn) = state_parts();
        cfg.maxzoom_guess = true;
        let mut reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
        let mut sst = SerializationState::new("test", 0, 0, &mut reader, &cfg, &progress, &warn);

        let pf = ParsedFeature {
            kind: GeomKind::Line,
            geometry: vec![
                Draw::new(DrawOp::MoveTo, 0, 0),
                Draw::new(DrawOp::LineTo, 330, 0),
                Draw::new(DrawOp::LineTo, 330, 330),
            ],
            id: None,
            attrs: vec![],
            minzoom_hint: NO_ZOOM_HINT,
            maxzoom_hint: NO_ZOOM_HINT,
        };
        serialize_feature(&mut sst, pf, "l").unwrap();
        assert_eq!(sst.dist_count, 2);
        assert!((sst.dist_sum - 2.0 * (10.0f64).ln()).abs() < 1e-9);
    }

    #[test]
    fn test_antimeridian_bbox_planes() {
        let (dir, cfg, progress, warn) = state_parts();
        let mut reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
        let mut sst = SerializationState::new("test", 0, 0, &mut reader, &cfg, &progress, &warn);

        // A point past the antimeridian projects off the plane.
        serialize_feature(&mut sst, point_feature(190.0, 0.0), "l").unwrap();
        assert!(reader.file_bbox[2] >= PLANE);
        assert!(reader.file_bbox1[2] <= PLANE - 1);
    }

    #[test]
    fn test_multipart_key_uses_first_part_midpoint() {
        let (dir, cfg, progress, warn) = state_parts();
        let mut reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
        let mut sst = SerializationState::new("test", 0, 0, &mut reader, &cfg, &progress, &warn);

        // Two widely separated parts: the second sits half a plane away.
        let far = 1i64 << 31;
        let pf = ParsedFeature {
            kind: GeomKind::Line,
            geometry: vec![
                Draw::new(DrawOp::MoveTo, 1000, 1000),
                Draw::new(DrawOp::LineTo, 3000, 2000),
                Draw::new(DrawOp::MoveTo, far, far),
                Draw::new(DrawOp::LineTo, far + 4000, far + 2000),
            ],
            id: None,
            attrs: vec![],
            minzoom_hint: NO_ZOOM_HINT,
            maxzoom_hint: NO_ZOOM_HINT,
        };
        serialize_feature(&mut sst, pf, "l").unwrap();

        let index = reader.index.map().unwrap();
        let e = IndexEntry::read_at(&index, 0).unwrap();

        // Key is the first part's bounding midpoint...
        assert_eq!(e.ix, encode_index(CurveKind::Quadkey, 2000, 1500));

        // ...not the combined-extent midpoint.
        let combined_mid = (
            ((1000 + (far + 4000)) / 2) as u32,
            ((1000 + (far + 2000)) / 2) as u32,
        );
        assert_ne!(
            e.ix,
            encode_index(CurveKind::Quadkey, combined_mid.0, combined_mid.1)
        );

        // The running file bbox still covers every part.
        assert_eq!(reader.file_bbox, [1000, 1000, far + 4000, far + 2000]);
    }
}
