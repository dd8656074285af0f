//! The matrix-source contract consumed by the loader.
//!
//! Parsers hand the loader a lazy, finite stream of columns. Row producers
//! are one-shot by construction: they are owned iterators that move into the
//! loader, so a second consumption cannot be expressed.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One-shot row producer of a column.
pub type Rows<T> = Box<dyn Iterator<Item = T> + Send>;

/// Lazy stream of columns produced by a [`MatrixSource`].
pub type ColumnStream = Box<dyn Iterator<Item = Result<Column, anyhow::Error>> + Send>;

/// A parsed input matrix. Implementations defer all file I/O until
/// [`MatrixSource::into_columns`] is called, so sources can be constructed
/// cheaply before the loader decides (by source hash) whether to read them.
pub trait MatrixSource: Send {
    /// Stream the columns of the matrix. Consumes the source.
    fn into_columns(self: Box<Self>) -> Result<ColumnStream, anyhow::Error>;
}

/// Value type of a field.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    Float,
    Category,
    Position,
    Genes,
}

/// One column of an input matrix.
pub struct Column {
    pub name: String,
    pub data: ColumnData,
    /// Optional display metadata, typically from a clinical feature sheet.
    pub feature: Option<FeatureMeta>,
}

/// Rows of a column, tagged by value type. Each variant carries only what
/// its insert path needs.
pub enum ColumnData {
    /// Dense scores; NaN is missing.
    Float(Rows<f32>),
    /// Categorical values with an optional caller-precomputed ordering map.
    /// Without one, orderings are assigned in first-seen order.
    Category {
        rows: Rows<Option<String>>,
        order: Option<IndexMap<String, u32>>,
    },
    /// Genomic intervals, one per row.
    Position(Rows<Position>),
    /// Gene lists, one list per row.
    Genes(Rows<Vec<String>>),
    /// A declared value type the engine does not understand. The loader
    /// skips the column and records a warning.
    Unsupported { value_type: String },
}

/// Genomic interval of one row of a position field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub chrom: String,
    pub chrom_start: i64,
    pub chrom_end: i64,
    pub strand: Option<String>,
}

/// Display metadata of a non-score field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureMeta {
    pub short_title: Option<String>,
    pub long_title: Option<String>,
    pub priority: Option<f64>,
    pub visibility: Option<String>,
}

/// A matrix assembled in memory, mostly for tests and direct API use.
pub struct InMemoryMatrix {
    pub columns: Vec<Column>,
}

impl MatrixSource for InMemoryMatrix {
    fn into_columns(self: Box<Self>) -> Result<ColumnStream, anyhow::Error> {
        Ok(Box::new(self.columns.into_iter().map(Ok)))
    }
}

impl InMemoryMatrix {
    /// Convenience constructor for a score matrix: named float columns over
    /// a shared implicit row axis.
    pub fn from_scores(columns: Vec<(&str, Vec<f32>)>) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, scores)| Column {
                name: name.to_string(),
                data: ColumnData::Float(Box::new(scores.into_iter())),
                feature: None,
            })
            .collect();
        Self { columns }
    }
}
