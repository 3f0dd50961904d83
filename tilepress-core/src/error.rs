//! Error types and process exit statuses for the tile pipeline.
//!
//! Every failure the pipeline can hit maps to a distinct exit status so an
//! embedding binary can reproduce the original tool's exit-code contract.
//! Fatal resource problems (out of memory for an mmap, out of descriptors)
//! are ordinary `Err` values here; nothing in the pipeline calls `exit()`.

use std::io;
use thiserror::Error;

/// Distinct process exit statuses.
///
/// `Success` is 0; everything else is a specific non-zero code. The numeric
/// values are part of the external contract and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    Success = 0,
    Args = 1,
    Memory = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Stat = 7,
    Thread = 8,
    Json = 9,
    NoData = 10,
    Impossible = 11,
    Incomplete = 12,
}

impl ExitStatus {
    /// The raw process exit code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Pipeline errors.
///
/// The `what` field carries the same kind of context the original tool put
/// in its `perror()` prefix: which file or stage the operation was part of.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to create or open a file (source, temp, or output).
    #[error("open {what}: {source}")]
    Open { what: String, source: io::Error },

    /// Failed to close or flush a stream.
    #[error("close {what}: {source}")]
    Close { what: String, source: io::Error },

    /// Failed to read.
    #[error("read {what}: {source}")]
    Read { what: String, source: io::Error },

    /// Failed to write.
    #[error("write {what}: {source}")]
    Write { what: String, source: io::Error },

    /// Failed to stat a file or filesystem.
    #[error("stat {what}: {source}")]
    Stat { what: String, source: io::Error },

    /// Failed to memory-map a region. Treated as memory exhaustion.
    #[error("mmap {what}: {source}")]
    Map { what: String, source: io::Error },

    /// A worker thread could not be spawned or panicked.
    #[error("worker thread {0}")]
    Thread(String),

    /// Malformed JSON where a whole source (not a single feature) is unusable.
    #[error("{what}: {msg}")]
    Json { what: String, msg: String },

    /// No valid geometries survived ingest.
    #[error("did not read any valid geometries")]
    NoData,

    /// A broken internal invariant: index chain mismatch, descriptor
    /// miscount, stream left open. Indicates a bug, not an input problem.
    #[error("internal error: {0}")]
    Impossible(String),

    /// The tiler wrote fewer zoom levels than requested but at least
    /// `minzoom` was produced.
    #[error("tiles only complete through zoom {written} of {maxzoom}")]
    Incomplete { written: i32, maxzoom: i32 },

    /// Invalid caller-supplied configuration.
    #[error("{0}")]
    Args(String),
}

impl Error {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::Open { .. } => ExitStatus::Open,
            Error::Close { .. } => ExitStatus::Close,
            Error::Read { .. } => ExitStatus::Read,
            Error::Write { .. } => ExitStatus::Write,
            Error::Stat { .. } => ExitStatus::Stat,
            Error::Map { .. } => ExitStatus::Memory,
            Error::Thread(_) => ExitStatus::Thread,
            Error::Json { .. } => ExitStatus::Json,
            Error::NoData => ExitStatus::NoData,
            Error::Impossible(_) => ExitStatus::Impossible,
            Error::Incomplete { .. } => ExitStatus::Incomplete,
            Error::Args(_) => ExitStatus::Args,
        }
    }

    pub fn open(what: impl Into<String>, source: io::Error) -> Self {
        Error::Open { what: what.into(), source }
    }

    pub fn close(what: impl Into<String>, source: io::Error) -> Self {
        Error::Close { what: what.into(), source }
    }

    pub fn read(what: impl Into<String>, source: io::Error) -> Self {
        Error::Read { what: what.into(), source }
    }

    pub fn write(what: impl Into<String>, source: io::Error) -> Self {
        Error::Write { what: what.into(), source }
    }

    pub fn stat(what: impl Into<String>, source: io::Error) -> Self {
        Error::Stat { what: what.into(), source }
    }

    pub fn map(what: impl Into<String>, source: io::Error) -> Self {
        Error::Map { what: what.into(), source }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_statuses_distinct() {
        let all = [
            ExitStatus::Success,
            ExitStatus::Args,
            ExitStatus::Memory,
            ExitStatus::Open,
            ExitStatus::Close,
            ExitStatus::Read,
            ExitStatus::Write,
            ExitStatus::Stat,
            ExitStatus::Thread,
            ExitStatus::Json,
            ExitStatus::NoData,
            ExitStatus::Impossible,
            ExitStatus::Incomplete,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Args.code(), 1);
    }

    #[test]
    fn test_error_maps_to_status() {
        let e = Error::map("index", io::Error::new(io::ErrorKind::OutOfMemory, "enomem"));
        assert_eq!(e.exit_status(), ExitStatus::Memory);
        assert_eq!(Error::NoData.exit_status(), ExitStatus::NoData);
        let e = Error::Incomplete { written: 4, maxzoom: 9 };
        assert_eq!(e.exit_status(), ExitStatus::Incomplete);
    }
}
