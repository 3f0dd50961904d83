//! Core data pipeline for vector tiling.
//!
//! Turns collections of geographic features into a spatially-ordered
//! geometry stream, a sorted feature index, a merged string pool, and a
//! shared-node table, each feature carrying the minimum zoom at which it
//! survives probabilistic dropping. The per-tile assembly, output
//! containers, CLI, and binary-format parsers are external collaborators;
//! [`orchestrator::Pipeline`] is the public surface.

pub mod config;
pub mod drop_policy;
pub mod geojson;
pub mod ingest;
pub mod merge;
pub mod metadata;
pub mod orchestrator;
pub mod progress;
pub mod resources;
pub mod serializer;
pub mod sorter;
pub mod string_pool;
pub mod temp_store;
pub mod tuner;
pub mod vertex;

pub use config::{BasezoomSpec, DroprateSpec, PipelineConfig, MAX_ZOOM};
pub use ingest::Source;
pub use metadata::Metadata;
pub use orchestrator::{MetadataSink, Pipeline, PipelineOutput, Tiler, TilerReport};
pub use tilepress_core::error::{Error, ExitStatus, Result};
