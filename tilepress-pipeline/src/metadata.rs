//! Tileset metadata assembly.
//!
//! The pipeline's summary of what it produced: zoom range, geographic
//! bounds (including the antimeridian-aware alternate), center, layer
//! table, and the dropping parameters the tiler should advertise. The
//! struct serializes with `serde` so a metadata sink can write it as JSON
//! without knowing anything else about the pipeline.

use crate::serializer::LayerEntry;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-layer metadata entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LayerMeta {
    pub id: u16,
    pub description: String,
    pub minzoom: i32,
    pub maxzoom: i32,
}

/// Tileset metadata handed to the metadata sink.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Metadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub attribution: Option<String>,

    pub minzoom: i32,
    pub maxzoom: i32,

    pub minlat: f64,
    pub minlon: f64,
    pub maxlat: f64,
    pub maxlon: f64,
    pub midlat: f64,
    pub midlon: f64,

    /// Bounds of the narrower antimeridian-aware candidate bbox, as
    /// `[minlon, minlat, maxlon, maxlat]`.
    pub bounds2: [f64; 4],

    /// Layers by name, ids reassigned in name order so the output is
    /// deterministic regardless of which worker saw a layer first.
    pub layer_map: BTreeMap<String, LayerMeta>,

    pub basezoom: i32,
    pub droprate: f64,
    pub retain_points_multiplier: i32,

    /// Tile-assembly strategies the tiler reports back; empty until then.
    pub strategies: Vec<String>,
}

/// Merge per-worker layer maps by name. Descriptions are kept from the
/// first worker that recorded one; ids are reassigned in sorted name
/// order.
pub fn merge_layermaps(maps: &[FxHashMap<String, LayerEntry>]) -> BTreeMap<String, LayerMeta> {
    let mut merged: BTreeMap<String, LayerMeta> = BTreeMap::new();
    for map in maps {
        for (name, entry) in map {
            merged.entry(name.clone()).or_insert_with(|| LayerMeta {
                id: 0,
                description: entry.description.clone(),
                minzoom: entry.minzoom,
                maxzoom: entry.maxzoom,
            });
        }
    }
    for (id, meta) in merged.values_mut().enumerate() {
        meta.id = id as u16;
    }
    merged
}

// ============================================================================
// Tests
// ============================================================================
