//! Probemap and gene-position table reader.
//!
//! Probemap rows are `id, genes, chrom, chromStart, chromEnd, strand`,
//! tab-separated, optionally `#`-commented. Each row describes one probe;
//! the file loads as three parallel fields over the probe row axis: `name`
//! (the probe ids as a category), `position`, and `genes`.

use std::path::PathBuf;

use crate::loader::source::{Column, ColumnData, ColumnStream, MatrixSource, Position};

pub struct ProbemapReader {
    path: PathBuf,
}

impl ProbemapReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

/// One probemap row as laid out on disk.
#[derive(Debug)]
struct Record {
    id: String,
    genes: Vec<String>,
    position: Position,
}

impl MatrixSource for ProbemapReader {
    fn into_columns(self: Box<Self>) -> Result<ColumnStream, anyhow::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .comment(Some(b'#'))
            .flexible(true)
            .from_reader(crate::common::open_read_maybe_gz(&self.path)?);

        let mut records: Vec<Record> = Vec::new();
        for (index, row) in reader.records().enumerate() {
            let row = row?;
            // Tolerate one literal header line.
            if index == 0 && row.get(3).map_or(false, |s| s.parse::<i64>().is_err()) {
                continue;
            }
            records.push(parse_record(&self.path, index + 1, &row)?);
        }

        let names: Vec<Option<String>> = records.iter().map(|r| Some(r.id.clone())).collect();
        let positions: Vec<Position> = records.iter().map(|r| r.position.clone()).collect();
        let genes: Vec<Vec<String>> = records.into_iter().map(|r| r.genes).collect();

        let columns = vec![
            Column {
                name: "name".to_string(),
                data: ColumnData::Category {
                    rows: Box::new(names.into_iter()),
                    order: None,
                },
                feature: None,
            },
            Column {
                name: "position".to_string(),
                data: ColumnData::Position(Box::new(positions.into_iter())),
                feature: None,
            },
            Column {
                name: "genes".to_string(),
                data: ColumnData::Genes(Box::new(genes.into_iter())),
                feature: None,
            },
        ];
        Ok(Box::new(columns.into_iter().map(Ok)))
    }
}

fn parse_record(
    path: &std::path::Path,
    line: usize,
    row: &csv::StringRecord,
) -> Result<Record, anyhow::Error> {
    let cell = |index: usize| row.get(index).unwrap_or_default();
    let number = |index: usize| -> Result<i64, anyhow::Error> {
        cell(index).parse().map_err(|_| {
            anyhow::anyhow!(
                "{} line {}: invalid coordinate {:?}",
                path.display(),
                line,
                cell(index)
            )
        })
    };
    anyhow::ensure!(
        row.len() >= 5,
        "{} line {}: expected at least 5 columns, found {}",
        path.display(),
        line,
        row.len()
    );
    let strand = match cell(5) {
        "" | "." => None,
        s => Some(s.to_string()),
    };
    Ok(Record {
        id: cell(0).to_string(),
        genes: cell(1)
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect(),
        position: Position {
            chrom: cell(2).to_string(),
            chrom_start: number(3)?,
            chrom_end: number(4)?,
            strand,
        },
    })
}
