//! Probabilistic feature dropping and minimum-zoom assignment.
//!
//! For every zoom below the base zoom a target retention interval
//! `droprate^(basezoom - z)` is maintained. Each eligible feature bumps a
//! per-zoom sequence counter; a zoom whose counter is still non-negative
//! keeps the feature and pays the interval, and the feature's minimum zoom
//! is one above the deepest zoom that rejected it. Points are always
//! eligible; lines and polygons only when their drop flags are set.
//!
//! Two refinements on top of the plain model:
//!
//! - **Density preservation**: with a threshold D, a feature farther than
//!   `((2^(32-z))/D)²` key units from the last feature retained at zoom z
//!   is kept at z anyway, so sparse regions are not dropped to nothing.
//! - **Gamma**: with `gamma > 0`, a per-zoom gap check suppresses features
//!   whose key distance to the previously emitted feature at that zoom is
//!   too small, with a probabilistic component that thins near-duplicates
//!   to roughly the gamma-th root of their count.
//!
//! The assigned zoom is written into the last byte of the feature's
//! serialized record, either as the sorter merges (first pass) or through
//! a writable map of the sorted geometry stream (fixup after tuning).

use crate::config::PipelineConfig;
use memmap2::MmapMut;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tilepress_core::error::{Error, Result};
use tilepress_core::{GeomKind, IndexEntry, INDEX_RECORD_SIZE};

/// Per-zoom dropping accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropState {
    pub gap: f64,
    pub previndex: u64,
    pub interval: f64,
    /// Floating point because the interval is.
    pub seq: f64,
}

/// Build one state per zoom in `[0, maxzoom]`. A negative `basezoom`
/// (still unknown at this point in the run) yields zero intervals, which
/// assigns every eligible feature minzoom 0 until the fixup pass.
pub fn prep_drop_states(maxzoom: i32, basezoom: i32, droprate: f64) -> Vec<DropState> {
    let mut states = vec![DropState::default(); (maxzoom + 1) as usize];
    for (i, ds) in states.iter_mut().enumerate() {
        if (i as i32) < basezoom {
            ds.interval = droprate.powi(basezoom - i as i32);
        }
    }
    states
}

/// Gap management for gamma suppression.
///
/// Returns true when the feature should be suppressed at this zoom. The
/// probabilistic branch chooses a fresh gap requirement after each emitted
/// feature; the deterministic branch then holds features back until the
/// gap has been covered.
pub fn manage_gap(
    index: u64,
    previndex: &mut u64,
    scale: f64,
    gamma: f64,
    gap: &mut f64,
    rng: &mut SmallRng,
) -> bool {
    if gamma > 0.0 {
        if *gap > 0.0 {
            if index == *previndex {
                return true; // exact duplicate
            }
            if (((index - *previndex) as f64) / scale).powf(gamma) >= *gap {
                *gap = 0.0;
            } else {
                return true;
            }
        } else if index >= *previndex {
            *gap = ((index - *previndex) as f64) / scale;
            if *gap < 1.0 {
                return true; // in the same sub-pixel
            } else if rng.gen::<f64>() < 1.0 / gap.powf(gamma) {
                return true; // thin to n^(1/gamma)
            } else {
                *gap = 0.0;
            }
        }
        *previndex = index;
    }
    false
}

/// The full dropping policy for one pass over the sorted index.
pub struct DropPolicy {
    pub states: Vec<DropState>,
    pub maxzoom: i32,
    pub basezoom: i32,
    pub droprate: f64,
    gamma: f64,
    preserve_density: u64,
    line_drop: bool,
    polygon_drop: bool,
    rng: SmallRng,
}

impl DropPolicy {
    /// `basezoom` may be negative while it is still unknown; see
    /// [`prep_drop_states`].
    pub fn new(cfg: &PipelineConfig, maxzoom: i32, basezoom: i32, droprate: f64) -> Self {
        Self {
            states: prep_drop_states(maxzoom, basezoom, droprate),
            maxzoom,
            basezoom,
            droprate,
            gamma: if cfg.uses_gamma() { cfg.gamma } else { 0.0 },
            preserve_density: cfg.preserve_point_density_threshold,
            line_drop: cfg.line_drop,
            polygon_drop: cfg.polygon_drop,
            rng: SmallRng::seed_from_u64(0),
        }
    }

    /// Whether a geometry kind is subject to dropping at all.
    pub fn eligible(&self, kind: GeomKind) -> bool {
        match kind {
            GeomKind::Point => true,
            GeomKind::Line => self.line_drop,
            GeomKind::Polygon => self.polygon_drop,
        }
    }

    /// Assign the minimum zoom for the next feature in index order.
    pub fn feature_minzoom(&mut self, ix: u64, kind: GeomKind) -> u8 {
        let mut feature_minzoom: i32 = 0;
        if !self.eligible(kind) {
            return 0;
        }

        let maxzoom = self.maxzoom;
        let gamma = self.gamma;
        let preserve = self.preserve_density;
        let states = &mut self.states;
        let rng = &mut self.rng;

        for ds in states.iter_mut() {
            ds.seq += 1.0;
        }
        for i in (0..=maxzoom).rev() {
            let zi = i as usize;
            let rejected = if states[zi].seq < 0.0 {
                true
            } else if gamma > 0.0 {
                let scale = (2.0f64).powi(64 - 2 * (i + 8));
                let ds = &mut states[zi];
                manage_gap(ix, &mut ds.previndex, scale, gamma, &mut ds.gap, rng)
            } else {
                false
            };

            if rejected {
                feature_minzoom = i + 1;
                // Track where the pushed-out feature landed so nothing
                // *too* far away gets clustered into it later.
                for j in (i + 1)..=maxzoom {
                    states[j as usize].previndex = ix;
                }
                break;
            }
            states[zi].seq -= states[zi].interval;
        }

        // A feature chosen only for a high zoom may still be so far from
        // the last feature kept at a low zoom that dropping it would
        // leave the area empty there.
        if preserve > 0 {
            for i in 0..feature_minzoom.min(maxzoom) {
                let cell = (1u64 << (32 - i)) / preserve;
                if ix.saturating_sub(states[i as usize].previndex) > cell * cell {
                    feature_minzoom = i;
                    for j in i..=maxzoom {
                        states[j as usize].previndex = ix;
                    }
                    break;
                }
            }
        }

        feature_minzoom as u8
    }
}

// ============================================================================
// Minzoom fixup over the sorted streams
// ============================================================================

/// Rewrite every feature's minzoom byte in place, now that the real base
/// zoom and drop rate are known. `geom` maps the sorted geometry stream;
/// `index` is the raw sorted index.
///
/// In drop-denser mode a deterministic `drop_denser`% sample of eligible
/// features (selected by key residue) is ranked by decreasing gap to the
/// previous sampled feature; the widest gaps surface at the lowest zooms
/// and the rest of the sample is pinned to the base zoom. Unsampled
/// features take the ordinary policy.
pub fn rewrite_minzooms(
    geom: &mut MmapMut,
    index: &[u8],
    policy: &mut DropPolicy,
    drop_denser: u32,
) -> Result<()> {
    let n = index.len() / INDEX_RECORD_SIZE;

    if drop_denser > 0 {
        let mut sampled: Vec<(u64, usize)> = Vec::new();
        let mut previndex: u64 = 0;

        for ip in 0..n {
            let e = entry_at(index, ip)?;
            if !policy.eligible(e.kind) {
                continue;
            }
            if e.ix % 100 < drop_denser as u64 {
                sampled.push((e.ix.saturating_sub(previndex), ip));
                previndex = e.ix;
            } else {
                let fm = policy.feature_minzoom(e.ix, e.kind);
                geom[(e.end - 1) as usize] = fm;
            }
        }

        // Largest gap first; stable so equal gaps keep index order.
        sampled.sort_by(|a, b| b.0.cmp(&a.0));

        let basezoom = policy.basezoom.max(0);
        let mut i = 0usize;
        for z in 0..=basezoom {
            let keep_fraction = 1.0 / policy.droprate.powi(basezoom - z);
            let keep_count = (sampled.len() as f64 * keep_fraction) as usize;
            while i < keep_count && i < sampled.len() {
                let e = entry_at(index, sampled[i].1)?;
                geom[(e.end - 1) as usize] = z as u8;
                i += 1;
            }
        }
        while i < sampled.len() {
            let e = entry_at(index, sampled[i].1)?;
            geom[(e.end - 1) as usize] = basezoom as u8;
            i += 1;
        }
    } else {
        let mut prev_end: Option<u64> = None;
        for ip in 0..n {
            let e = entry_at(index, ip)?;
            if let Some(pe) = prev_end {
                if e.start != pe {
                    return Err(Error::Impossible(format!(
                        "mismatched index at {}: {} vs {}",
                        ip, e.start, pe
                    )));
                }
            }
            let fm = policy.feature_minzoom(e.ix, e.kind);
            geom[(e.end - 1) as usize] = fm;
            prev_end = Some(e.end);
        }
    }

    Ok(())
}

fn entry_at(index: &[u8], ip: usize) -> Result<IndexEntry> {
    IndexEntry::read_at(index, ip * INDEX_RECORD_SIZE)
        .map_err(|e| Error::read("sorted index", e))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(maxzoom: i32, basezoom: i32, droprate: f64) -> DropPolicy {
        let cfg = PipelineConfig::default();
        DropPolicy::new(&cfg, maxzoom, basezoom, droprate)
    }

    #[test]
    fn test_intervals() {
        let states = prep_drop_states(4, 3, 2.0);
        assert_eq!(states[0].interval, 8.0);
        assert_eq!(states[1].interval, 4.0);
        assert_eq!(states[2].interval, 2.0);
        assert_eq!(states[3].interval, 0.0); // at and above basezoom
        assert_eq!(states[4].interval, 0.0);
    }

    #[test]
    fn test_unknown_basezoom_assigns_zero() {
        let mut p = policy(10, -1, 2.5);
        for i in 0..100u64 {
            assert_eq!(p.feature_minzoom(i * 1000, GeomKind::Point), 0);
        }
    }

    #[test]
    fn test_retention_roughly_halves_per_zoom() {
        let maxzoom = 10;
        let basezoom = 10;
        let mut p = policy(maxzoom, basezoom, 2.0);

        let n = 4096u64;
        let mut kept_at = vec![0u64; (maxzoom + 1) as usize];
        for i in 0..n {
            let fm = p.feature_minzoom(i << 20, GeomKind::Point) as usize;
            for z in fm..=(maxzoom as usize) {
                kept_at[z] += 1;
            }
        }

        // Everything appears at basezoom.
        assert_eq!(kept_at[basezoom as usize], n);
        for z in (0..basezoom as usize).rev() {
            let expect = n as f64 / 2f64.powi((basezoom as usize - z) as i32);
            let got = kept_at[z] as f64;
            assert!(
                (got - expect).abs() <= expect * 0.05 + 4.0,
                "zoom {}: kept {} expected {}",
                z,
                got,
                expect
            );
        }
    }

    #[test]
    fn test_lines_only_dropped_when_enabled() {
        let mut p = policy(6, 6, 2.0);
        // 1000 lines with the default config: none are eligible.
        for i in 0..1000u64 {
            assert_eq!(p.feature_minzoom(i << 30, GeomKind::Line), 0);
        }

        let mut cfg = PipelineConfig::default();
        cfg.line_drop = true;
        let mut p = DropPolicy::new(&cfg, 6, 6, 2.0);
        let mut nonzero = 0;
        for i in 0..1000u64 {
            if p.feature_minzoom(i << 30, GeomKind::Line) > 0 {
                nonzero += 1;
            }
        }
        assert!(nonzero > 0);
    }

    #[test]
    fn test_density_preservation_forces_low_zoom() {
        let mut cfg = PipelineConfig::default();
        cfg.preserve_point_density_threshold = 10;
        let mut with = DropPolicy::new(&cfg, 10, 10, 2.0);
        let mut without = policy(10, 10, 2.0);

        // Very sparse features: each far from the last in key space.
        let step = 1u64 << 58;
        let mut kept_low_with = 0u64;
        let mut kept_low_without = 0u64;
        for i in 0..60u64 {
            let ix = i * step;
            if with.feature_minzoom(ix, GeomKind::Point) == 0 {
                kept_low_with += 1;
            }
            if without.feature_minzoom(ix, GeomKind::Point) == 0 {
                kept_low_without += 1;
            }
        }
        assert!(
            kept_low_with > kept_low_without,
            "{} vs {}",
            kept_low_with,
            kept_low_without
        );
    }

    #[test]
    fn test_minzoom_never_exceeds_maxzoom() {
        let mut p = policy(5, 5, 3.0);
        for i in 0..10_000u64 {
            let fm = p.feature_minzoom(i, GeomKind::Point);
            assert!(fm as i32 <= 5);
        }
    }

    #[test]
    fn test_manage_gap_suppresses_duplicates() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut previndex = 0u64;
        let mut gap = 0.0f64;
        let scale = 2f64.powi(40);

        // First feature at index 0 establishes state; exact duplicates of
        // an established previndex with a pending gap are always dropped.
        manage_gap(1000, &mut previndex, scale, 2.0, &mut gap, &mut rng);
        if gap > 0.0 {
            assert!(manage_gap(1000, &mut previndex, scale, 2.0, &mut gap, &mut rng));
        }
    }
}
