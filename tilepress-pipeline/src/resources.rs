//! Thread and file-descriptor budgets, and disk-space projection.
//!
//! The worker count comes from the machine (or the `TILEPRESS_MAX_THREADS`
//! environment override), capped at 32767 so a worker index always fits
//! the index record's segment field, and rounded down to a power of two.
//!
//! The descriptor budget is probed, not assumed: the advertised rlimit can
//! overstate what the system will actually grant, so descriptors are
//! opened against the null device until that fails and three quarters of
//! the observed count is the working limit.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tilepress_core::error::{Error, Result};

const NULL_DEVICE: &str = "/dev/null";

/// Never probe more descriptors than this; a filesystem full of temp
/// files bogs down long before the limit matters.
const MAX_PROBE: usize = 2000;

/// Resolved budgets for one pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct ResourceBudget {
    /// Ingest worker count: power of two, at least 1.
    pub cpus: usize,
    /// Usable file descriptors.
    pub max_files: i64,
    /// Cap on simultaneously open temp files.
    pub temp_files: usize,
}

/// Probe the machine for worker and descriptor budgets.
pub fn probe(max_threads: Option<usize>) -> Result<ResourceBudget> {
    let mut cpus = match std::env::var("TILEPRESS_MAX_THREADS") {
        Ok(v) => v
            .parse::<usize>()
            .map_err(|_| Error::Args(format!("TILEPRESS_MAX_THREADS must be a number (got {})", v)))?,
        Err(_) => std::thread::available_parallelism().map_or(1, |n| n.get()),
    };
    if let Some(limit) = max_threads {
        cpus = cpus.min(limit.max(1));
    }
    cpus = cpus.clamp(1, 32767);
    // Round down to a power of two.
    cpus = 1 << cpus.ilog2();

    // Probe the real open-file limit.
    let mut probes = Vec::new();
    for _ in 0..MAX_PROBE {
        match File::open(NULL_DEVICE) {
            Ok(f) => probes.push(f),
            Err(_) => break,
        }
    }
    let observed = probes.len();
    drop(probes);

    let max_files = (observed as i64) * 3 / 4;
    if max_files < 32 {
        return Err(Error::open(
            format!("can't open a useful number of files: {}", max_files),
            std::io::Error::from_raw_os_error(libc::EMFILE),
        ));
    }

    let temp_files = (((max_files - 10) / 2) as usize).min(cpus * 4);

    tracing::debug!(cpus, max_files, temp_files, "resource budget");
    Ok(ResourceBudget {
        cpus,
        max_files,
        temp_files,
    })
}

/// The fd number a fresh open would get; used to detect descriptor leaks
/// across the ingest phase.
pub fn probe_fd_floor() -> Result<i32> {
    let f = File::open(NULL_DEVICE)
        .map_err(|e| Error::open(NULL_DEVICE, e))?;
    Ok(f.as_raw_fd())
}

/// Ignore SIGPIPE so a tiler that stops reading early does not kill the
/// pipeline mid-write.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Free bytes on the filesystem holding `path`, or `u64::MAX` when the
/// filesystem cannot be asked.
pub fn available_disk(path: &std::path::Path) -> u64 {
    match fs2::available_space(path) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                "statfs {}: {}; cannot check whether disk space will run out",
                path.display(),
                e
            );
            u64::MAX
        }
    }
}

/// Warn once when committed plus projected temp bytes cross 90% of the
/// space that was available at startup.
pub fn warn_if_disk_tight(used: u64, diskfree: u64, warned: &AtomicBool) {
    if diskfree != u64::MAX
        && used as f64 > diskfree as f64 * 0.9
        && !warned.swap(true, Ordering::Relaxed)
    {
        tracing::warn!(
            used,
            available = diskfree,
            "you will probably run out of disk space"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
