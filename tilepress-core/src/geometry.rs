//! Projected draw sequences.
//!
//! Geometry reaches the pipeline already projected onto the 2³² plane as a
//! flat sequence of draw operations. Coordinates are kept as `i64` so that
//! antimeridian-wrapped features (which project off the plane) survive
//! until the bounding-box fold decides what to do with them; the serialized
//! wire format and the spatial key both reduce to 32 bits per axis.

use std::io;

/// Draw operation codes. The numeric values match the vector-tile wire
/// geometry commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrawOp {
    MoveTo = 1,
    LineTo = 2,
    ClosePath = 7,
}

impl DrawOp {
    pub fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            1 => Ok(DrawOp::MoveTo),
            2 => Ok(DrawOp::LineTo),
            7 => Ok(DrawOp::ClosePath),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid draw op {}", other),
            )),
        }
    }
}

/// One draw operation. `ClosePath` carries no meaningful coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    pub op: DrawOp,
    pub x: i64,
    pub y: i64,
}

impl Draw {
    pub fn new(op: DrawOp, x: i64, y: i64) -> Self {
        Self { op, x, y }
    }
}

/// A feature's full geometry as a draw sequence.
pub type DrawVec = Vec<Draw>;

/// Geometry kind of a serialized feature. Values fit the 2-bit field of the
/// index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum GeomKind {
    Point = 1,
    Line = 2,
    Polygon = 3,
}

impl GeomKind {
    pub fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            1 => Ok(GeomKind::Point),
            2 => Ok(GeomKind::Line),
            3 => Ok(GeomKind::Polygon),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid geometry kind {}", other),
            )),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Signed shoelace area of one ring, in plane² units. The ring is the point
/// run of a single part; closure back to the first point is implicit.
pub fn ring_area(ring: &[Draw]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = &ring[i];
        let b = &ring[(i + 1) % ring.len()];
        sum += (a.x as f64) * (b.y as f64) - (b.x as f64) * (a.y as f64);
    }
    sum / 2.0
}

/// Bounding box over the coordinate-bearing ops of a draw sequence.
/// Returns `None` for a geometry with no coordinates.
pub fn bounds(geom: &[Draw]) -> Option<[i64; 4]> {
    let mut bbox: Option<[i64; 4]> = None;
    for d in geom {
        if d.op == DrawOp::ClosePath {
            continue;
        }
        match &mut bbox {
            None => bbox = Some([d.x, d.y, d.x, d.y]),
            Some(b) => {
                b[0] = b[0].min(d.x);
                b[1] = b[1].min(d.y);
                b[2] = b[2].max(d.x);
                b[3] = b[3].max(d.y);
            }
        }
    }
    bbox
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: i64, y: i64) -> Draw {
        Draw::new(DrawOp::LineTo, x, y)
    }

    #[test]
    fn test_ring_area_sign() {
        let ccw = vec![pt(0, 0), pt(10, 0), pt(10, 10), pt(0, 10)];
        let cw: Vec<Draw> = ccw.iter().rev().cloned().collect();
        assert_eq!(ring_area(&ccw), 100.0);
        assert_eq!(ring_area(&cw), -100.0);
    }

    #[test]
    fn test_degenerate_ring_has_no_area() {
        assert_eq!(ring_area(&[pt(0, 0), pt(1, 1)]), 0.0);
        assert_eq!(ring_area(&[]), 0.0);
    }

    #[test]
    fn test_bounds_skips_closepath() {
        let geom = vec![
            Draw::new(DrawOp::MoveTo, 5, 6),
            Draw::new(DrawOp::LineTo, -2, 9),
            Draw::new(DrawOp::ClosePath, 0, 0),
        ];
        assert_eq!(bounds(&geom), Some([-2, 6, 5, 9]));
        assert_eq!(bounds(&[]), None);
    }
}
