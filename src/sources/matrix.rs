//! Genomic matrix TSV reader.
//!
//! Layout: the header row names the samples; every following row is one
//! probe with its scores. The header becomes a synthesized `sampleID`
//! category column, so stored rows are samples and stored fields are
//! probes. Probe rows are streamed, one column per line.

use std::io::{BufRead, Lines};
use std::path::PathBuf;

use crate::loader::source::{Column, ColumnData, ColumnStream, MatrixSource};

pub struct MatrixReader {
    path: PathBuf,
}

impl MatrixReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl MatrixSource for MatrixReader {
    fn into_columns(self: Box<Self>) -> Result<ColumnStream, anyhow::Error> {
        let mut lines = crate::common::open_read_maybe_gz(&self.path)?.lines();
        let header = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty matrix file {}", self.path.display()))??;
        let samples: Vec<String> = header.split('\t').skip(1).map(str::to_owned).collect();
        anyhow::ensure!(
            !samples.is_empty(),
            "matrix {} has no sample columns",
            self.path.display()
        );

        let count = samples.len();
        let sample_column = Column {
            name: "sampleID".to_string(),
            data: ColumnData::Category {
                rows: Box::new(samples.into_iter().map(Some)),
                order: None,
            },
            feature: None,
        };
        let probes = ProbeColumns {
            lines,
            count,
            path: self.path,
            line_no: 1,
        };
        Ok(Box::new(std::iter::once(Ok(sample_column)).chain(probes)))
    }
}

struct ProbeColumns {
    lines: Lines<Box<dyn BufRead + Send>>,
    count: usize,
    path: PathBuf,
    line_no: usize,
}

impl Iterator for ProbeColumns {
    type Item = Result<Column, anyhow::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.is_empty() {
                continue;
            }
            let mut cells = line.split('\t');
            let name = cells.next().unwrap_or_default().to_string();
            let scores: Vec<f32> = cells.map(parse_score).collect();
            if scores.len() != self.count {
                return Some(Err(anyhow::anyhow!(
                    "{} line {}: expected {} scores, found {}",
                    self.path.display(),
                    self.line_no,
                    self.count,
                    scores.len()
                )));
            }
            return Some(Ok(Column {
                name,
                data: ColumnData::Float(Box::new(scores.into_iter())),
                feature: None,
            }));
        }
    }
}

/// Missing-value sentinels, shared by the numeric and categorical paths.
pub(crate) fn is_missing(cell: &str) -> bool {
    matches!(cell, "" | "NA" | "na" | "NaN" | "nan" | "null" | "NULL")
}

/// Parse one score cell; anything non-numeric is missing.
pub(crate) fn parse_score(cell: &str) -> f32 {
    if is_missing(cell) {
        f32::NAN
    } else {
        cell.parse().unwrap_or(f32::NAN)
    }
}

/// Whether every non-missing cell of a column parses as a score.
pub(crate) fn all_numeric<'a>(mut cells: impl Iterator<Item = &'a str>) -> bool {
    cells.all(|cell| is_missing(cell) || cell.parse::<f32>().is_ok())
}
