//! GeoJSON feature parsing.
//!
//! Text sources are sequences of JSON feature objects separated by
//! newlines or RS (0x1E). Each record is parsed into a `serde_json::Value`
//! (the tagged-value model: null, bool, number, string, array, object with
//! O(1) field lookup) and fed through [`serialize_feature`]. A record may
//! also be a whole `FeatureCollection` or a bare geometry; both are
//! accepted the way the original reader accepted them.
//!
//! Per-feature problems never abort ingest: the offending feature is
//! dropped, the first occurrence of each problem kind is logged with its
//! source location, and parsing continues.

use crate::serializer::{
    serialize_feature, AttrVal, ParsedFeature, SerializationState, WarnLatches,
};
use serde_json::Value;
use tilepress_core::error::Result;
use tilepress_core::geometry::{Draw, DrawOp, DrawVec, GeomKind};
use tilepress_core::projection::lonlat_to_world;
use tilepress_core::NO_ZOOM_HINT;

/// GeoJSON geometry type names, paired with the serialized kind.
const GEOMETRY_NAMES: [(&str, GeomKind); 6] = [
    ("Point", GeomKind::Point),
    ("MultiPoint", GeomKind::Point),
    ("LineString", GeomKind::Line),
    ("MultiLineString", GeomKind::Line),
    ("Polygon", GeomKind::Polygon),
    ("MultiPolygon", GeomKind::Polygon),
];

/// Parse every record in `data`, separated by `sep`, into the worker
/// behind `sst`. Records that are not valid JSON are dropped with a
/// warn-once; `line` counts records for source locations.
pub fn parse_text_chunk(
    sst: &mut SerializationState,
    data: &[u8],
    sep: u8,
    layername: &str,
) -> Result<()> {
    for record in data.split(|&b| b == sep) {
        sst.line += 1;
        let trimmed = trim_ascii(record);
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_slice(trimmed) {
            Ok(v) => v,
            Err(e) => {
                WarnLatches::warn_once(
                    &sst.warn.not_a_feature,
                    sst.fname,
                    sst.line,
                    &format!("not parseable as JSON: {}", e),
                );
                continue;
            }
        };
        parse_root(sst, &value, layername)?;
    }
    Ok(())
}

fn trim_ascii(mut data: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = data {
        if first.is_ascii_whitespace() {
            data = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = data {
        if last.is_ascii_whitespace() {
            data = rest;
        } else {
            break;
        }
    }
    data
}

/// Dispatch one top-level JSON value: Feature, FeatureCollection, or bare
/// geometry.
fn parse_root(sst: &mut SerializationState, value: &Value, layername: &str) -> Result<u32> {
    match value.get("type").and_then(Value::as_str) {
        Some("Feature") => parse_feature(sst, value, layername),
        Some("FeatureCollection") => {
            let mut count = 0;
            if let Some(features) = value.get("features").and_then(Value::as_array) {
                for f in features {
                    count += parse_feature(sst, f, layername)?;
                }
            }
            Ok(count)
        }
        Some(t) if GEOMETRY_NAMES.iter().any(|(n, _)| *n == t) || t == "GeometryCollection" => {
            // Bare geometry record: treat as a feature without properties.
            serialize_geometry(sst, value, None, None, None, layername)
        }
        _ => {
            WarnLatches::warn_once(
                &sst.warn.not_a_feature,
                sst.fname,
                sst.line,
                "JSON object is not a Feature",
            );
            Ok(0)
        }
    }
}

fn parse_feature(sst: &mut SerializationState, feature: &Value, layername: &str) -> Result<u32> {
    let geometry = match feature.get("geometry") {
        Some(g) if !g.is_null() => g,
        _ => {
            WarnLatches::warn_once(
                &sst.warn.null_geometry,
                sst.fname,
                sst.line,
                "null geometry",
            );
            return Ok(0);
        }
    };

    serialize_geometry(
        sst,
        geometry,
        feature.get("properties"),
        feature.get("id"),
        feature.get("tilepress"),
        layername,
    )
}

/// Serialize one geometry (flattening GeometryCollections) with shared
/// properties, id, and per-feature overrides.
fn serialize_geometry(
    sst: &mut SerializationState,
    geometry: &Value,
    properties: Option<&Value>,
    id: Option<&Value>,
    overrides: Option<&Value>,
    layername: &str,
) -> Result<u32> {
    let type_name = match geometry.get("type") {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            WarnLatches::warn_once(
                &sst.warn.bad_geometry_type,
                sst.fname,
                sst.line,
                "geometry type is not a string",
            );
            return Ok(0);
        }
        None => {
            WarnLatches::warn_once(
                &sst.warn.null_geometry,
                sst.fname,
                sst.line,
                "geometry without a type",
            );
            return Ok(0);
        }
    };

    if type_name == "GeometryCollection" {
        let mut count = 0;
        if let Some(geometries) = geometry.get("geometries").and_then(Value::as_array) {
            for g in geometries {
                count += serialize_geometry(sst, g, properties, id, overrides, layername)?;
            }
        }
        return Ok(count);
    }

    let kind = match GEOMETRY_NAMES.iter().find(|(n, _)| *n == type_name) {
        Some((_, k)) => *k,
        None => {
            WarnLatches::warn_once(
                &sst.warn.unknown_geometry,
                sst.fname,
                sst.line,
                &format!("can't handle geometry type {}", type_name),
            );
            return Ok(0);
        }
    };

    let coordinates = match geometry.get("coordinates") {
        Some(c) if c.is_array() => c,
        _ => {
            WarnLatches::warn_once(
                &sst.warn.missing_coordinates,
                sst.fname,
                sst.line,
                "feature without coordinates array",
            );
            return Ok(0);
        }
    };

    let mut dv = DrawVec::new();
    if !parse_coordinates(type_name, coordinates, &mut dv) {
        WarnLatches::warn_once(
            &sst.warn.missing_coordinates,
            sst.fname,
            sst.line,
            "malformed coordinate array",
        );
        return Ok(0);
    }

    // Per-feature overrides.
    let mut minzoom_hint = NO_ZOOM_HINT;
    let mut maxzoom_hint = NO_ZOOM_HINT;
    let mut layer = layername;
    if let Some(o) = overrides {
        if let Some(z) = o.get("minzoom").and_then(Value::as_f64) {
            minzoom_hint = z.round() as i16;
        }
        if let Some(z) = o.get("maxzoom").and_then(Value::as_f64) {
            maxzoom_hint = z.round() as i16;
        }
        if let Some(l) = o.get("layer").and_then(Value::as_str) {
            layer = l;
        }
    }

    let id = parse_id(sst, id);
    let attrs = parse_properties(properties);

    let pf = ParsedFeature {
        kind,
        geometry: dv,
        id,
        attrs,
        minzoom_hint,
        maxzoom_hint,
    };
    Ok(serialize_feature(sst, pf, layer)? as u32)
}

/// A feature id survives only if it is a non-negative integer (or, when
/// enabled, a string spelling one). Anything else is warned once and the
/// feature proceeds without an id.
fn parse_id(sst: &SerializationState, id: Option<&Value>) -> Option<u64> {
    let id = id?;
    match id {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else if n.as_i64().map_or(false, |v| v < 0) || n.as_f64().map_or(false, |v| v < 0.0)
            {
                WarnLatches::warn_once(
                    &sst.warn.id_negative,
                    sst.fname,
                    sst.line,
                    &format!("can't represent negative feature ID {}", n),
                );
                None
            } else if n.as_f64().map_or(false, |v| v.fract() != 0.0) {
                WarnLatches::warn_once(
                    &sst.warn.id_fraction,
                    sst.fname,
                    sst.line,
                    &format!("can't represent non-integer feature ID {}", n),
                );
                None
            } else {
                WarnLatches::warn_once(
                    &sst.warn.id_too_large,
                    sst.fname,
                    sst.line,
                    &format!("can't represent too-large feature ID {}", n),
                );
                None
            }
        }
        Value::String(s) if sst.cfg.convert_stringified_ids => match s.parse::<u64>() {
            Ok(u) if u.to_string() == *s => Some(u),
            _ => {
                WarnLatches::warn_once(
                    &sst.warn.id_non_numeric,
                    sst.fname,
                    sst.line,
                    &format!("can't represent non-integer feature ID {}", s),
                );
                None
            }
        },
        other => {
            WarnLatches::warn_once(
                &sst.warn.id_non_numeric,
                sst.fname,
                sst.line,
                &format!("can't represent non-numeric feature ID {}", other),
            );
            None
        }
    }
}

fn parse_properties(properties: Option<&Value>) -> Vec<(String, AttrVal)> {
    let mut attrs = Vec::new();
    if let Some(Value::Object(map)) = properties {
        attrs.reserve(map.len());
        for (key, value) in map {
            attrs.push((key.clone(), stringify_value(value)));
        }
    }
    attrs
}

/// Collapse a JSON value to a typed attribute. Nested arrays and objects
/// are carried as their JSON text.
fn stringify_value(value: &Value) -> AttrVal {
    match value {
        Value::Null => AttrVal::Null,
        Value::Bool(b) => AttrVal::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AttrVal::Int(i)
            } else if let Some(u) = n.as_u64() {
                AttrVal::UInt(u)
            } else {
                AttrVal::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => AttrVal::String(s.clone()),
        other => AttrVal::String(other.to_string()),
    }
}

// ============================================================================
// Coordinate parsing
// ============================================================================

fn position(value: &Value) -> Option<(i64, i64)> {
    let arr = value.as_array()?;
    let lon = arr.first()?.as_f64()?;
    let lat = arr.get(1)?.as_f64()?;
    Some(lonlat_to_world(lon, lat))
}

fn push_line(coords: &[Value], dv: &mut DrawVec, close: bool) -> bool {
    let mut points = Vec::with_capacity(coords.len());
    for c in coords {
        match position(c) {
            Some(p) => points.push(p),
            None => return false,
        }
    }
    // GeoJSON rings repeat their first position; the closure is implicit
    // in the draw sequence.
    if close && points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    for (i, (x, y)) in points.iter().enumerate() {
        let op = if i == 0 { DrawOp::MoveTo } else { DrawOp::LineTo };
        dv.push(Draw::new(op, *x, *y));
    }
    if close && !points.is_empty() {
        dv.push(Draw::new(DrawOp::ClosePath, 0, 0));
    }
    true
}

fn parse_coordinates(type_name: &str, coordinates: &Value, dv: &mut DrawVec) -> bool {
    let coords = match coordinates.as_array() {
        Some(c) => c,
        None => return false,
    };
    match type_name {
        "Point" => match position(coordinates) {
            Some((x, y)) => {
                dv.push(Draw::new(DrawOp::MoveTo, x, y));
                true
            }
            None => false,
        },
        "MultiPoint" => {
            for c in coords {
                match position(c) {
                    Some((x, y)) => dv.push(Draw::new(DrawOp::MoveTo, x, y)),
                    None => return false,
                }
            }
            true
        }
        "LineString" => push_line(coords, dv, false),
        "MultiLineString" => coords.iter().all(|line| {
            line.as_array()
                .map_or(false, |l| push_line(l, dv, false))
        }),
        "Polygon" => coords.iter().all(|ring| {
            ring.as_array().map_or(false, |r| push_line(r, dv, true))
        }),
        "MultiPolygon" => coords.iter().all(|poly| {
            poly.as_array().map_or(false, |rings| {
                rings.iter().all(|ring| {
                    ring.as_array().map_or(false, |r| push_line(r, dv, true))
                })
            })
        }),
        _ => false,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::progress::Progress;
    use crate::serializer::Reader;
    use tempfile::TempDir;
    use tilepress_core::{IndexEntry, INDEX_RECORD_SIZE};

    struct Fixture {
        _dir: TempDir,
        cfg: PipelineConfig,
        progress: Progress,
        warn: WarnLatches,
        reader: Reader,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_cfg(PipelineConfig::default())
        }

        fn with_cfg(mut cfg: PipelineConfig) -> Self {
            let dir = TempDir::new().unwrap();
            cfg.tmp_dir = dir.path().to_path_buf();
            cfg.quiet = true;
            let reader = Reader::create(dir.path(), cfg.pool_spill_bytes).unwrap();
            Self {
                _dir: dir,
                cfg,
                progress: Progress::new(true, 0.0),
                warn: WarnLatches::default(),
                reader,
            }
        }

        fn parse(&mut self, text: &str) -> u64 {
            let mut sst = SerializationState::new(
                "input.json",
                0,
                0,
                &mut self.reader,
                &self.cfg,
                &self.progress,
                &self.warn,
            );
            parse_text_chunk(&mut sst, text.as_bytes(), b'\n', "layer").unwrap();
            sst.feature_count
        }
    }

    #[test]
    fn test_parses_line_delimited_features() {
        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"Feature","properties":{"name":"a"},"geometry":{"type":"Point","coordinates":[0,0]}}
{"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[1,1]}}"#,
        );
        assert_eq!(n, 2);
        assert_eq!(
            fx.reader.index.len(),
            2 * INDEX_RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_feature_collection_in_one_record() {
        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[0,0]}},
                {"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[2,2]}}]}"#
                .replace('\n', " ")
                .as_str(),
        );
        assert_eq!(n, 2);
    }

    #[test]
    fn test_geometry_collection_flattened() {
        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"Feature","properties":{},"geometry":{"type":"GeometryCollection","geometries":[{"type":"Point","coordinates":[0,0]},{"type":"LineString","coordinates":[[0,0],[1,1]]}]}}"#,
        );
        assert_eq!(n, 2);
    }

    #[test]
    fn test_null_geometry_dropped_and_warned_once() {
        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"Feature","properties":{},"geometry":null}
{"type":"Feature","properties":{},"geometry":null}
{"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[0,0]}}"#,
        );
        assert_eq!(n, 1);
        assert!(fx.warn.null_geometry.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[test]
    fn test_unknown_geometry_type_dropped() {
        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"Feature","properties":{},"geometry":{"type":"Hypercube","coordinates":[0,0]}}"#,
        );
        assert_eq!(n, 0);
        assert!(fx
            .warn
            .unknown_geometry
            .load(std::sync::atomic::Ordering::Relaxed));
    }

    #[test]
    fn test_bad_ids_drop_id_but_keep_feature() {
        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"Feature","id":-5,"properties":{},"geometry":{"type":"Point","coordinates":[0,0]}}
{"type":"Feature","id":1.5,"properties":{},"geometry":{"type":"Point","coordinates":[1,0]}}
{"type":"Feature","id":"x9","properties":{},"geometry":{"type":"Point","coordinates":[2,0]}}
{"type":"Feature","id":7,"properties":{},"geometry":{"type":"Point","coordinates":[3,0]}}"#,
        );
        assert_eq!(n, 4);

        let geom = fx.reader.geom.map().unwrap();
        let mut pos = 0usize;
        let mut ids = Vec::new();
        while pos < geom.len() {
            let (sf, used) = tilepress_core::SerialFeature::from_bytes(&geom[pos..]).unwrap();
            ids.push(sf.id);
            pos += used;
        }
        assert_eq!(ids, vec![None, None, None, Some(7)]);
    }

    #[test]
    fn test_polygon_ring_closed_with_closepath() {
        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[0,1],[1,1],[0,0]]]}}"#,
        );
        assert_eq!(n, 1);
        let geom = fx.reader.geom.map().unwrap();
        let (sf, _) = tilepress_core::SerialFeature::from_bytes(&geom).unwrap();
        // Duplicate closing position dropped, explicit ClosePath appended.
        assert_eq!(sf.geometry.len(), 4);
        assert_eq!(sf.geometry[3].op, tilepress_core::DrawOp::ClosePath);
    }

    #[test]
    fn test_rs_separated_records() {
        let mut fx = Fixture::new();
        let text = "\u{1e}{\"type\":\"Feature\",\"properties\":{},\"geometry\":{\"type\":\"Point\",\"coordinates\":[0,0]}}\n\u{1e}{\"type\":\"Feature\",\"properties\":{},\"geometry\":{\"type\":\"Point\",\"coordinates\":[1,1]}}\n";
        let mut sst = SerializationState::new(
            "input.geojsonseq",
            0,
            0,
            &mut fx.reader,
            &fx.cfg,
            &fx.progress,
            &fx.warn,
        );
        parse_text_chunk(&mut sst, text.as_bytes(), 0x1E, "layer").unwrap();
        assert_eq!(sst.feature_count, 2);
    }

    #[test]
    fn test_per_feature_overrides() {
        let mut fx = Fixture::new();
        fx.parse(
            r#"{"type":"Feature","tilepress":{"minzoom":4,"maxzoom":9,"layer":"special"},"properties":{},"geometry":{"type":"Point","coordinates":[0,0]}}"#,
        );
        let geom = fx.reader.geom.map().unwrap();
        let (sf, _) = tilepress_core::SerialFeature::from_bytes(&geom).unwrap();
        assert_eq!(sf.minzoom_hint, 4);
        assert_eq!(sf.maxzoom_hint, 9);
        assert!(fx.reader.layermap.contains_key("special"));

        let index = fx.reader.index.map().unwrap();
        let e = IndexEntry::read_at(&index, 0).unwrap();
        assert_eq!(e.seq, 0);
    }

    #[test]
    fn test_multipoint_keys_on_first_point() {
        use tilepress_core::spatial_key::encode_index;
        use tilepress_core::CurveKind;

        let mut fx = Fixture::new();
        let n = fx.parse(
            r#"{"type":"Feature","properties":{},"geometry":{"type":"MultiPoint","coordinates":[[-90,0],[90,0]]}}"#,
        );
        assert_eq!(n, 1);

        let index = fx.reader.index.map().unwrap();
        let e = IndexEntry::read_at(&index, 0).unwrap();

        // The spatial key is the first part's midpoint, not the center of
        // the combined extent (which here would be the plane center).
        let (x, y) = lonlat_to_world(-90.0, 0.0);
        assert_eq!(e.ix, encode_index(CurveKind::Quadkey, x as u32, y as u32));
        assert_ne!(
            e.ix,
            encode_index(CurveKind::Quadkey, 1 << 31, 1 << 31)
        );
    }

    #[test]
    fn test_stringified_numeric_id_requires_flag() {
        let mut fx = Fixture::new();
        fx.parse(
            r#"{"type":"Feature","id":"42","properties":{},"geometry":{"type":"Point","coordinates":[0,0]}}"#,
        );
        let geom = fx.reader.geom.map().unwrap();
        let (sf, _) = tilepress_core::SerialFeature::from_bytes(&geom).unwrap();
        assert_eq!(sf.id, None);

        let mut cfg = PipelineConfig::default();
        cfg.convert_stringified_ids = true;
        let mut fx = Fixture::with_cfg(cfg);
        fx.parse(
            r#"{"type":"Feature","id":"42","properties":{},"geometry":{"type":"Point","coordinates":[0,0]}}"#,
        );
        let geom = fx.reader.geom.map().unwrap();
        let (sf, _) = tilepress_core::SerialFeature::from_bytes(&geom).unwrap();
        assert_eq!(sf.id, Some(42));
    }
}
