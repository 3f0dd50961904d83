//! Terminal progress reporting.
//!
//! One overwritten line per phase, written straight to stderr with `\r`,
//! paced by a configurable interval so a slow non-tty consumer is not
//! flooded. Lifecycle events go through `tracing`; this is only the
//! interactive line the original tool drew.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

struct ProgressState {
    started: Instant,
    last_emit_secs: f64,
    last_percent: i64,
}

/// Shared progress reporter.
pub struct Progress {
    quiet: bool,
    interval: f64,
    state: Mutex<ProgressState>,
    /// Features read so far, bumped by every worker. Relaxed: advisory only.
    pub seq: AtomicU64,
}

impl Progress {
    pub fn new(quiet: bool, interval: f64) -> Self {
        Self {
            quiet,
            interval,
            state: Mutex::new(ProgressState {
                started: Instant::now(),
                last_emit_secs: f64::MIN,
                last_percent: -1,
            }),
            seq: AtomicU64::new(0),
        }
    }

    /// Count one ingested feature and occasionally redraw the read line.
    pub fn feature_read(&self) {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 100_000 == 0 {
            self.line(&format!("Read {:.2} million features", n as f64 / 1_000_000.0), -1);
        }
    }

    /// Report a phase as a percentage of work done.
    pub fn percent(&self, label: &str, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let pct = (100 * done / total.max(1)) as i64;
        self.line(&format!("{}: {}%", label, pct), pct);
    }

    /// Draw a bare phase message (no percentage).
    pub fn phase(&self, label: &str) {
        self.line(label, -1);
    }

    /// Erase the progress line before final output.
    pub fn clear(&self) {
        if !self.quiet {
            eprint!("{:width$}\r", "", width = 48);
        }
    }

    fn line(&self, text: &str, percent: i64) {
        if self.quiet {
            return;
        }
        let mut st = self.state.lock();
        let elapsed = st.started.elapsed().as_secs_f64();
        if percent >= 0 && percent == st.last_percent {
            return;
        }
        if elapsed - st.last_emit_secs < self.interval {
            return;
        }
        st.last_emit_secs = elapsed;
        st.last_percent = percent;
        eprint!("{}          \r", text);
    }
}

// ============================================================================
// Tests
// ============================================================================
