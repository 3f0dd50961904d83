//! Auto-tuning of maxzoom, basezoom, and drop rate from the sorted index.
//!
//! The sorted index is a sample of how features crowd together: the gap
//! between adjacent spatial keys is roughly the squared ground distance
//! between neighbouring features. A guessed maxzoom comes from the
//! geometric mean and spread of those gaps (log-gaps, because the gaps
//! are close to lognormal), refined by within-feature vertex spacing, a
//! cluster-distance extension, and a hard cap on the total tile count the
//! polygon area would generate.
//!
//! When basezoom or droprate are still unknown after that, a second pass
//! bins features into tiles at every zoom and sizes both so the densest
//! tile stays under its feature budget.
//!
//! Everything here is a pure function of the sorted index and the ingest
//! statistics; thread scheduling during ingest cannot change the result.

use crate::config::{BasezoomSpec, DroprateSpec, PipelineConfig, MAX_ZOOM};
use crate::drop_policy::manage_gap;
use crate::ingest::IngestStats;
use crate::progress::Progress;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tilepress_core::error::Result;
use tilepress_core::spatial_key::decode_index;
use tilepress_core::{IndexEntry, INDEX_RECORD_SIZE};

/// Degrees of longitude per foot at the equator.
const DEG_PER_FOOT: f64 = 0.00000274;

/// Hard ceiling on the tiles a tileset may imply.
const MAX_TILE_COUNT: f64 = (2 * 1024 * 1024) as f64;

/// Feature budget for the densest tile at unit marker width.
const BASEZOOM_MAX_FEATURES: f64 = 50_000.0;

/// The tuned dropping parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub maxzoom: i32,
    pub basezoom: i32,
    pub droprate: f64,
    pub cluster_maxzoom: i32,
    /// The minzoom bytes written during the sort were provisional and must
    /// be rewritten.
    pub fix_dropping: bool,
}

fn round_droprate(r: f64) -> f64 {
    (r * 100000.0).round() / 100000.0
}

fn entry_at(index: &[u8], ip: usize) -> Result<IndexEntry> {
    IndexEntry::read_at(index, ip * INDEX_RECORD_SIZE)
        .map_err(|e| tilepress_core::Error::read("sorted index", e))
}

/// Tune `(maxzoom, basezoom, droprate)` against the sorted index.
pub fn auto_tune(
    index: &[u8],
    cfg: &PipelineConfig,
    stats: &IngestStats,
    progress: &Progress,
) -> Result<Tuning> {
    let indices = index.len() / INDEX_RECORD_SIZE;

    let mut maxzoom = cfg.maxzoom;
    let mut basezoom = match cfg.basezoom {
        BasezoomSpec::Zoom(z) => z,
        BasezoomSpec::Unspecified => -1,
        BasezoomSpec::Guess => -2,
    };
    let mut droprate = match cfg.droprate {
        DroprateSpec::Rate(r) => r,
        DroprateSpec::Auto => -3.0,
    };
    let mut cluster_maxzoom = cfg.cluster_maxzoom;
    let mut fix_dropping = false;

    if cfg.maxzoom_guess {
        // Welford over the log-gaps of distinct adjacent keys.
        let mut mean = 0.0f64;
        let mut m2 = 0.0f64;
        let mut count = 0usize;
        let mut dupes = 0usize;

        let mut prev_ix: Option<u64> = None;
        for ip in 0..indices {
            let e = entry_at(index, ip)?;
            if let Some(prev) = prev_ix {
                if e.ix != prev {
                    let value = ((e.ix - prev) as f64).ln();
                    count += 1;
                    let delta = value - mean;
                    mean += delta / count as f64;
                    m2 += delta * (value - mean);
                } else {
                    dupes += 1;
                }
            }
            prev_ix = Some(e.ix);
            progress.percent("Maxzoom", ip as u64, indices as u64);
        }

        if count == 0 && stats.dist_count == 0 {
            // A single distinct location tells us nothing; take the floor.
            maxzoom = cfg.minimum_maxzoom;
            if droprate < 0.0 {
                droprate = 1.0;
            }
        } else if count > 0 {
            let stddev = (m2 / count as f64).sqrt();

            // Geometric mean, because gaps between features are typically
            // lognormal. A feature a bit over a standard deviation below
            // it still deserves to be distinguishable.
            let avg = mean.exp();
            let nearby = (mean - 1.5 * stddev).exp();

            let dist_ft = avg.sqrt() / 33.0;
            let nearby_ft = nearby.sqrt() / 33.0;
            let want = nearby_ft / 2.0;

            maxzoom = ((360.0 / (DEG_PER_FOOT * want)).ln() / 2.0f64.ln()
                - cfg.full_detail as f64)
                .ceil() as i32;
            maxzoom = maxzoom.max(0);
            tracing::info!(
                maxzoom,
                typical_ft = dist_ft.ceil(),
                nearby_ft = nearby_ft.ceil(),
                "guessed maxzoom from feature spacing"
            );

            let mut extended = false;
            while maxzoom < 32 - cfg.full_detail
                && maxzoom < 33 - cfg.low_detail
                && maxzoom < cluster_maxzoom
                && cfg.cluster_distance > 0
            {
                let cell = (1u64 << (32 - maxzoom)) / 256 * cfg.cluster_distance as u64;
                let zoom_mingap = (cell * cell) as f64;
                if avg > zoom_mingap {
                    break;
                }
                maxzoom += 1;
                extended = true;
            }
            if extended {
                tracing::info!(
                    maxzoom,
                    cluster_distance = cfg.cluster_distance,
                    "extended maxzoom to keep most features distinct"
                );
            }

            if droprate == -3.0 {
                // Fitted curve: evenly spaced features want a high drop
                // rate, clumped ones can survive a low one.
                droprate = round_droprate((-0.7681 * stddev.ln() + 1.582).exp());
                if droprate < 0.0 {
                    droprate = 0.0;
                }
                tracing::info!(droprate, "guessed drop rate");

                if dupes != 0 && droprate != 0.0 && droprate != 1.0 {
                    let bump = (((dupes + count) as f64 / count as f64).ln() / droprate.ln())
                        .round() as i32;
                    maxzoom += bump;
                    tracing::info!(maxzoom, dupes, "raised maxzoom for duplicate locations");
                }
            }
        }

        if stats.dist_count != 0 {
            // Within-feature resolution; the pseudo-feet conversion already
            // happened per feature.
            let want2 = (stats.dist_sum / stats.dist_count as f64).exp() / 8.0;
            let mz = ((360.0 / (DEG_PER_FOOT * want2)).ln() / 2.0f64.ln()
                - cfg.full_detail as f64)
                .ceil() as i32;
            if mz > maxzoom || count == 0 {
                tracing::info!(maxzoom = mz, "guessed maxzoom from within-feature resolution");
                maxzoom = mz;
            }
        }

        maxzoom = maxzoom.max(0);
        maxzoom = maxzoom.min(32 - cfg.full_detail);
        maxzoom = maxzoom.min(33 - cfg.low_detail);

        // Cap the implied tile count. 2M tiles keeps jobs that look like
        // minutes from becoming days; it still covers the world to z10.
        let mut total_tile_count = 0.0;
        for z in 1..=maxzoom {
            let tile_size = (1u64 << (32 - z)) as f64;
            total_tile_count += (stats.area_sum / (tile_size * tile_size)).ceil();
            if total_tile_count > MAX_TILE_COUNT {
                tracing::info!(maxzoom = z - 1, "limited maxzoom by projected tile count");
                maxzoom = z - 1;
                break;
            }
        }

        if basezoom == -2 && cfg.basezoom_marker_width == 1.0 {
            basezoom = maxzoom;
        }

        if maxzoom < cfg.minimum_maxzoom {
            maxzoom = cfg.minimum_maxzoom;
        }
        if maxzoom < cfg.minzoom {
            maxzoom = cfg.minzoom;
        }

        fix_dropping = true;

        if basezoom == -1 {
            basezoom = maxzoom;
        }
    }

    if cluster_maxzoom >= maxzoom && cfg.cluster_maxzoom_guess {
        cluster_maxzoom = maxzoom - 1;
        tracing::info!(cluster_maxzoom, "guessed cluster maxzoom");
    }

    if basezoom < 0 || droprate < 0.0 {
        let (bz, dr) =
            estimate_basezoom_droprate(index, cfg, maxzoom, basezoom, droprate, progress)?;
        basezoom = bz;
        droprate = dr;
        fix_dropping = true;
    }

    Ok(Tuning {
        maxzoom,
        basezoom,
        droprate,
        cluster_maxzoom,
        fix_dropping,
    })
}

// ============================================================================
// Basezoom / droprate estimation by tile binning
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct TileBin {
    x: u32,
    y: u32,
    count: i64,
    fullcount: i64,
    gap: f64,
    previndex: u64,
}

fn estimate_basezoom_droprate(
    index: &[u8],
    cfg: &PipelineConfig,
    maxzoom: i32,
    mut basezoom: i32,
    mut droprate: f64,
    progress: &Progress,
) -> Result<(i32, f64)> {
    let indices = index.len() / INDEX_RECORD_SIZE;
    let nz = (MAX_ZOOM + 1) as usize;
    let mut tile = vec![TileBin::default(); nz];
    let mut max = vec![TileBin::default(); nz];
    let mut rng = SmallRng::seed_from_u64(0);

    for ip in 0..indices {
        let e = entry_at(index, ip)?;
        let (xx, yy) = decode_index(cfg.curve, e.ix);
        progress.percent("Base zoom/drop rate", ip as u64, indices as u64);

        for z in 0..=MAX_ZOOM {
            // Tile numbers, not pixels: shift, don't round.
            let (xxx, yyy) = if z == 0 {
                (0, 0)
            } else {
                (xx >> (32 - z), yy >> (32 - z))
            };
            let scale = 2.0f64.powi(64 - 2 * (z + 8));
            let bin = &mut tile[z as usize];

            if bin.x != xxx || bin.y != yyy {
                if bin.count > max[z as usize].count {
                    max[z as usize] = *bin;
                }
                *bin = TileBin {
                    x: xxx,
                    y: yyy,
                    ..TileBin::default()
                };
            }

            bin.fullcount += 1;
            if manage_gap(e.ix, &mut bin.previndex, scale, cfg.gamma, &mut bin.gap, &mut rng) {
                continue;
            }
            bin.count += 1;
        }
    }
    for z in (0..=MAX_ZOOM).rev() {
        if tile[z as usize].count > max[z as usize].count {
            max[z as usize] = tile[z as usize];
        }
    }

    let max_features =
        (BASEZOOM_MAX_FEATURES / (cfg.basezoom_marker_width * cfg.basezoom_marker_width)) as i64;

    let obasezoom = basezoom;
    if basezoom < 0 {
        basezoom = MAX_ZOOM;
        for z in (0..=MAX_ZOOM).rev() {
            if max[z as usize].count < max_features {
                basezoom = z;
            }
        }
        tracing::info!(
            basezoom,
            count = max[basezoom as usize].count,
            "chose base zoom from densest tile"
        );
    }

    if obasezoom < 0 && basezoom > maxzoom && cfg.limit_basezoom_to_maxzoom {
        basezoom = maxzoom;
    }

    if obasezoom < 0 && basezoom > maxzoom {
        tracing::warn!("couldn't find a suitable base zoom; working from the other direction");
        if cfg.gamma == 0.0 {
            tracing::warn!("gamma might help limit near-duplicates");
        }

        if droprate < 0.0 {
            if maxzoom == 0 || max[maxzoom as usize].count == 0 {
                droprate = 2.5;
            } else {
                droprate = round_droprate(
                    ((max[0].count as f64 / max[maxzoom as usize].count as f64).ln()
                        / maxzoom as f64)
                        .exp(),
                );
                tracing::info!(
                    droprate,
                    from = max[maxzoom as usize].count,
                    to = max[0].count,
                    "chose drop rate to span the zoom range"
                );
            }
        }

        basezoom = 0;
        for z in 0..=maxzoom {
            let zoomdiff = (max[z as usize].count as f64 / max_features as f64).ln()
                / droprate.ln();
            if zoomdiff + z as f64 > basezoom as f64 {
                basezoom = (zoomdiff + z as f64).ceil() as i32;
            }
        }
        tracing::info!(basezoom, "chose base zoom above the zoom range");
    } else if droprate < 0.0 {
        droprate = 1.0;
        for z in (0..basezoom).rev() {
            let mut interval = (droprate.ln() * (basezoom - z) as f64).exp();
            if max[z as usize].count as f64 / interval >= max_features as f64 {
                interval = max[z as usize].count as f64 / max_features as f64;
                droprate = round_droprate((interval.ln() / (basezoom - z) as f64).exp());
                tracing::info!(droprate, zoom = z, "raised drop rate for densest tile");
            }
        }
    }

    if cfg.gamma > 0.0 {
        let mut effective = 0;
        for z in 0..maxzoom {
            if max[z as usize].count < max[z as usize].fullcount {
                effective = z + 1;
            }
        }
        if effective == 0 {
            tracing::info!("with gamma, effective base zoom is 0, so no effective drop rate");
        } else {
            let interval_0 = (droprate.ln() * basezoom as f64).exp();
            let mut interval_eff = (droprate.ln() * (basezoom - effective) as f64).exp();
            if effective > basezoom {
                interval_eff = 1.0;
            }
            let scaled_0 = max[0].count as f64 / interval_0;
            let scaled_eff = max[effective as usize].count as f64 / interval_eff;
            let rate_at_0 = scaled_0 / max[0].fullcount as f64;
            let rate_at_eff = scaled_eff / max[effective as usize].fullcount as f64;
            let eff_drop = ((rate_at_eff / rate_at_0).ln() / effective as f64).exp();
            tracing::info!(
                effective,
                drop_rate = eff_drop,
                "effective base zoom and drop rate under gamma"
            );
        }
    }

    Ok((basezoom, droprate))
}

// ============================================================================
// Root tile
// ============================================================================

/// Fold per-worker bboxes and pick the deepest zoom at or above which the
/// buffered bounding box still fits a single tile.
pub fn choose_first_zoom(file_bbox: &mut [i64; 4], minzoom: i32, buffer: i32) -> (u32, u32, u32) {
    const PLANE_MAX: i64 = (1i64 << 32) - 1;

    // A bbox extending off either side of the plane means a feature
    // wrapped the antimeridian: the horizontal extent is the whole world.
    if file_bbox[0] < 0 || file_bbox[2] > PLANE_MAX {
        file_bbox[0] = 0;
        file_bbox[2] = PLANE_MAX;
    }
    file_bbox[1] = file_bbox[1].max(0);
    file_bbox[3] = file_bbox[3].min(PLANE_MAX);

    let (mut iz, mut ix, mut iy) = (0u32, 0u32, 0u32);
    for z in (0..=minzoom).rev() {
        let shift = 1i64 << (32 - z);
        let left = (file_bbox[0] - buffer as i64 * shift / 256) / shift;
        let top = (file_bbox[1] - buffer as i64 * shift / 256) / shift;
        let right = (file_bbox[2] + buffer as i64 * shift / 256) / shift;
        let bottom = (file_bbox[3] + buffer as i64 * shift / 256) / shift;

        if left == right && top == bottom {
            iz = z as u32;
            ix = left as u32;
            iy = top as u32;
            break;
        }
    }
    (iz, ix, iy)
}

// ============================================================================
// Tests
// ============================================================================
