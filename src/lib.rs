//! Column-oriented storage and query engine for Xena genomic datasets.
//!
//! Datasets are wide matrices over a shared sample row axis: score fields
//! (probes), categorical fields with code dictionaries, and probemap fields
//! carrying genomic intervals and gene lists. The engine ingests parsed
//! matrix sources into a relational schema with segmented score blobs,
//! answers genomic fetch requests with dense caller-ordered score vectors,
//! and runs structured read-only relational queries.

pub mod binning;
pub mod cache;
pub mod codec;
pub mod common;
pub mod db;
pub mod err;
pub mod loader;
pub mod query;
pub mod sources;
pub mod synth;

pub use db::Db;
pub use err::{Error, Result};
pub use loader::{DatasetMeta, LoadRequest, LoadSummary, SourceSpec};
pub use query::{FetchRequest, FetchResult};
