//! Web Mercator projection onto the 2³² integer plane.
//!
//! All pipeline coordinates live on a single square plane of 2³² units per
//! axis, equivalent to pixel coordinates of a zoom-32 tile pyramid. The
//! projection is fixed (EPSG:3857 from WGS84 degrees); other input
//! projections are a collaborator concern and must be converted before
//! ingest.
//!
//! Longitudes outside ±180° project off the plane on purpose: a feature
//! wrapped across the antimeridian produces out-of-plane coordinates that
//! the bounding-box fold detects later.

/// Number of bits per axis of the projected plane.
pub const PLANE_BITS: u32 = 32;

/// Latitude limit of the Mercator plane.
pub const LAT_LIMIT: f64 = 85.05112877980659;

/// Project WGS84 degrees to the zoom-32 plane.
///
/// Non-finite latitudes are pinned to the top or bottom edge rather than
/// poisoning downstream integer math; longitudes are not clamped so that
/// antimeridian wrapping stays visible in the result.
pub fn lonlat_to_world(lon: f64, lat: f64) -> (i64, i64) {
    let n = (1u64 << PLANE_BITS) as f64;

    let lat = if lat.is_finite() {
        lat.clamp(-LAT_LIMIT, LAT_LIMIT)
    } else if lat.is_sign_positive() {
        LAT_LIMIT
    } else {
        -LAT_LIMIT
    };
    let lon = if lon.is_finite() { lon } else { 0.0 };

    let lat_rad = lat.to_radians();
    let x = n * ((lon + 180.0) / 360.0);
    let y = n * (1.0 - ((lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI)) / 2.0;

    (x as i64, y as i64)
}

/// Inverse of [`lonlat_to_world`]: the upper-left corner of tile `(x, y)`
/// at `zoom`, in degrees.
pub fn tile_to_lonlat(x: i64, y: i64, zoom: u32) -> (f64, f64) {
    let n = (1u64 << zoom) as f64;
    let lon = 360.0 * (x as f64) / n - 180.0;
    let lat = (std::f64::consts::PI * (1.0 - 2.0 * (y as f64) / n))
        .sinh()
        .atan()
        .to_degrees();
    (lon, lat)
}

/// Inverse projection from the zoom-32 plane to degrees.
pub fn world_to_lonlat(x: i64, y: i64) -> (f64, f64) {
    tile_to_lonlat(x, y, PLANE_BITS)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_projects_to_plane_center() {
        let (x, y) = lonlat_to_world(0.0, 0.0);
        assert_eq!(x, 1 << 31);
        assert_eq!(y, 1 << 31);
    }

    #[test]
    fn test_edges() {
        let (x, _) = lonlat_to_world(-180.0, 0.0);
        assert_eq!(x, 0);
        let (x, _) = lonlat_to_world(180.0, 0.0);
        assert_eq!(x, 1 << 32);

        // Beyond the antimeridian: off the plane, not wrapped.
        let (x, _) = lonlat_to_world(190.0, 0.0);
        assert!(x > 1 << 32);
        let (x, _) = lonlat_to_world(-190.0, 0.0);
        assert!(x < 0);
    }

    #[test]
    fn test_round_trip() {
        for &(lon, lat) in &[(0.0, 0.0), (-122.42, 37.77), (151.2, -33.87), (179.9, 84.0)] {
            let (x, y) = lonlat_to_world(lon, lat);
            let (lon2, lat2) = world_to_lonlat(x, y);
            assert!((lon - lon2).abs() < 1e-4, "{} vs {}", lon, lon2);
            assert!((lat - lat2).abs() < 1e-4, "{} vs {}", lat, lat2);
        }
    }

    #[test]
    fn test_nonfinite_latitude_pinned() {
        let (_, y) = lonlat_to_world(0.0, f64::INFINITY);
        let (_, y_top) = lonlat_to_world(0.0, LAT_LIMIT);
        assert_eq!(y, y_top);
        let (_, y) = lonlat_to_world(0.0, f64::NAN);
        // NaN has an unspecified sign; either edge is acceptable.
        let (_, y_bot) = lonlat_to_world(0.0, -LAT_LIMIT);
        assert!(y == y_top || y == y_bot);
    }
}
