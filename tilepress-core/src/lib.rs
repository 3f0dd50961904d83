//! Shared data model for the tilepress vector-tile pipeline.
//!
//! This crate holds the pieces both the pipeline and its downstream
//! collaborators (the tiler, archive writers) agree on: the projected
//! geometry model, the serialized feature wire format, the fixed 32-byte
//! index record, the space-filling-curve keys, the Web Mercator
//! projection, and the error taxonomy with its exit-status mapping.

pub mod error;
pub mod geometry;
pub mod index_entry;
pub mod projection;
pub mod serial;
pub mod spatial_key;

pub use error::{Error, ExitStatus, Result};
pub use geometry::{Draw, DrawOp, DrawVec, GeomKind};
pub use index_entry::{cmp_ix_seq, IndexEntry, INDEX_RECORD_SIZE};
pub use serial::{SerialFeature, SerialVal, NO_ZOOM_HINT};
pub use spatial_key::CurveKind;
