//! Pipeline configuration.
//!
//! One immutable value threaded from the orchestrator into every worker
//! context at spawn time. There is no process-global mutable state; a
//! worker sees exactly the configuration the pipeline was started with.

use std::path::PathBuf;
use tilepress_core::CurveKind;

/// Deepest zoom the pipeline will ever consider.
pub const MAX_ZOOM: i32 = 32;

/// Default memory budget for sort buffers: 1 GB.
pub const DEFAULT_MEMORY_BUDGET: usize = 1024 * 1024 * 1024;

/// Default in-memory threshold before a string pool spills to disk: 16 MB.
pub const DEFAULT_POOL_SPILL_BYTES: usize = 16 * 1024 * 1024;

/// How the base zoom is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BasezoomSpec {
    /// Use the maxzoom (possibly itself guessed).
    #[default]
    Unspecified,
    /// Estimate from per-tile feature densities.
    Guess,
    /// An explicit zoom.
    Zoom(i32),
}

/// How the drop rate is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DroprateSpec {
    /// An explicit rate.
    Rate(f64),
    /// Derive from the spacing statistics of the sorted index.
    Auto,
}

impl Default for DroprateSpec {
    fn default() -> Self {
        DroprateSpec::Rate(2.5)
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Which space-filling curve orders the feature index.
    pub curve: CurveKind,

    /// Maximum zoom to generate. Ignored when `maxzoom_guess` is set.
    pub maxzoom: i32,
    /// Minimum zoom to generate.
    pub minzoom: i32,
    /// Choose maxzoom from the data instead of `maxzoom`.
    pub maxzoom_guess: bool,
    /// Floor for a guessed maxzoom.
    pub minimum_maxzoom: i32,

    pub basezoom: BasezoomSpec,
    /// Marker width for the base-zoom density estimate; the densest tile
    /// is allowed `50000 / width²` features.
    pub basezoom_marker_width: f64,
    /// Cap an estimated basezoom at the maxzoom instead of working the
    /// drop rate backward from an unreachable one.
    pub limit_basezoom_to_maxzoom: bool,
    pub droprate: DroprateSpec,

    /// Near-duplicate suppression exponent; 0 disables.
    pub gamma: f64,
    /// Also drop lines / polygons below basezoom, not only points.
    pub line_drop: bool,
    pub polygon_drop: bool,
    /// Percentage (0–100) of eligible features sampled into the
    /// drop-denser gap ranking; 0 disables the mode.
    pub drop_denser: u32,
    /// Density floor: a feature farther than `((2^(32-z))/D)²` key units
    /// from the last one retained at zoom z is kept at z regardless.
    pub preserve_point_density_threshold: u64,

    /// Tile buffer in 1/256ths of a tile, used when choosing the root tile.
    pub buffer: i32,

    /// Detail (log2 of tile resolution) at maxzoom.
    pub full_detail: i32,
    /// Detail below maxzoom.
    pub low_detail: i32,
    /// Detail floor the tiler may degrade to.
    pub min_detail: i32,

    /// Cluster distance in 1/256ths of a tile; extends a guessed maxzoom
    /// until typical features stay distinct.
    pub cluster_distance: i32,
    pub cluster_maxzoom: i32,
    /// Pick `cluster_maxzoom = maxzoom - 1` after tuning.
    pub cluster_maxzoom_guess: bool,

    /// Memory budget for sort buffers.
    pub memory_budget: usize,
    /// Spill threshold for per-worker string pools.
    pub pool_spill_bytes: usize,
    /// Shrink the in-memory sort budget to force deep radix recursion.
    /// Exists for coverage of the recursion path; never set in production.
    pub prefer_radix: bool,

    /// Directory for all unlinked temporaries.
    pub tmp_dir: PathBuf,

    /// Partition mappable newline-separated text across workers. RS-separated
    /// text sequences are always partitioned.
    pub read_parallel: bool,
    /// Upper bound on worker threads; defaults to the CPU count.
    pub max_threads: Option<usize>,

    /// Seconds between progress updates; 0 reports on every change.
    pub progress_interval: f64,
    pub quiet: bool,

    /// Accept string feature ids that parse as unsigned integers.
    pub convert_stringified_ids: bool,

    /// Multiplier the tiler applies when retaining extra points; carried
    /// through to metadata.
    pub retain_points_multiplier: i32,

    pub name: Option<String>,
    pub description: Option<String>,
    pub attribution: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            curve: CurveKind::default(),
            maxzoom: 14,
            minzoom: 0,
            maxzoom_guess: false,
            minimum_maxzoom: 0,
            basezoom: BasezoomSpec::default(),
            basezoom_marker_width: 1.0,
            limit_basezoom_to_maxzoom: false,
            droprate: DroprateSpec::default(),
            gamma: 0.0,
            line_drop: false,
            polygon_drop: false,
            drop_denser: 0,
            preserve_point_density_threshold: 0,
            buffer: 5,
            full_detail: 12,
            low_detail: 12,
            min_detail: 7,
            cluster_distance: 0,
            cluster_maxzoom: MAX_ZOOM,
            cluster_maxzoom_guess: false,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            pool_spill_bytes: DEFAULT_POOL_SPILL_BYTES,
            prefer_radix: false,
            tmp_dir: std::env::temp_dir(),
            read_parallel: false,
            max_threads: None,
            progress_interval: 0.0,
            quiet: false,
            convert_stringified_ids: false,
            retain_points_multiplier: 1,
            name: None,
            description: None,
            attribution: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_maxzoom(mut self, z: i32) -> Self {
        self.maxzoom = z;
        self
    }

    pub fn with_guessed_maxzoom(mut self) -> Self {
        self.maxzoom_guess = true;
        self
    }

    pub fn with_basezoom(mut self, z: i32) -> Self {
        self.basezoom = BasezoomSpec::Zoom(z);
        self
    }

    pub fn with_droprate(mut self, r: f64) -> Self {
        self.droprate = DroprateSpec::Rate(r);
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n);
        self
    }

    /// Whether gamma suppression can run at all: it needs a known basezoom
    /// and droprate at ingest.
    pub fn uses_gamma(&self) -> bool {
        self.gamma > 0.0
            && matches!(self.basezoom, BasezoomSpec::Zoom(_))
            && matches!(self.droprate, DroprateSpec::Rate(_))
    }
}

// ============================================================================
// Tests
// ============================================================================
