//! Clinical matrix reader.
//!
//! Clinical sheets are transposed relative to genomic matrices: rows are
//! samples, columns are per-sample features. The whole sheet is read and
//! pivoted so that each feature becomes one column over the shared sample
//! row axis; the first file column becomes the `sampleID` category column.
//! Features whose non-missing cells all parse as numbers load as float
//! columns, everything else as category.

use std::io::BufRead;
use std::path::PathBuf;

use super::matrix::{all_numeric, is_missing, parse_score};
use crate::loader::source::{Column, ColumnData, ColumnStream, MatrixSource};

pub struct ClinicalReader {
    path: PathBuf,
}

impl ClinicalReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl MatrixSource for ClinicalReader {
    fn into_columns(self: Box<Self>) -> Result<ColumnStream, anyhow::Error> {
        let mut lines = crate::common::open_read_maybe_gz(&self.path)?.lines();
        let header = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty clinical matrix {}", self.path.display()))??;
        let features: Vec<String> = header.split('\t').skip(1).map(str::to_owned).collect();

        let mut samples: Vec<Option<String>> = Vec::new();
        let mut cells: Vec<Vec<String>> = Vec::new();
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut row: Vec<String> = line.split('\t').map(str::to_owned).collect();
            // Trailing columns are often omitted for missing values.
            row.resize(features.len() + 1, String::new());
            let mut row = row.into_iter();
            samples.push(row.next().map(Some).unwrap_or_default());
            cells.push(row.collect());
        }

        let mut columns = vec![Column {
            name: "sampleID".to_string(),
            data: ColumnData::Category {
                rows: Box::new(samples.into_iter()),
                order: None,
            },
            feature: None,
        }];
        for (index, feature) in features.into_iter().enumerate() {
            let values: Vec<String> = cells.iter().map(|row| row[index].clone()).collect();
            let data = if all_numeric(values.iter().map(String::as_str)) {
                ColumnData::Float(Box::new(values.into_iter().map(|v| parse_score(&v))))
            } else {
                ColumnData::Category {
                    rows: Box::new(values.into_iter().map(|v| {
                        if is_missing(&v) {
                            None
                        } else {
                            Some(v)
                        }
                    })),
                    order: None,
                }
            };
            columns.push(Column {
                name: feature,
                data,
                feature: None,
            });
        }
        Ok(Box::new(columns.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::loader::source::MatrixSource;

    const SHEET: &str = "sample\tage\tstage\tweight\n\
                         s1\t61\tII\t70.5\n\
                         s2\t\tIII\t81\n\
                         s3\t47\tII\t\n";

    fn columns_of(text: &str) -> Vec<Column> {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clinical.tsv");
        std::fs::write(&path, text).unwrap();
        Box::new(ClinicalReader::new(&path))
            .into_columns()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn first_column_is_sample_ids() {
        let mut columns = columns_of(SHEET);
        assert_eq!(columns.len(), 4);
        let first = columns.remove(0);
        assert_eq!(first.name, "sampleID");
        match first.data {
            ColumnData::Category { rows, .. } => {
                let samples: Vec<Option<String>> = rows.collect();
                assert_eq!(
                    samples,
                    vec![Some("s1".into()), Some("s2".into()), Some("s3".into())]
                );
            }
            _ => panic!("sampleID must be categorical"),
        }
    }

    #[test]
    fn numeric_features_load_as_float() {
        let columns = columns_of(SHEET);
        let age = &columns[1];
        assert_eq!(age.name, "age");
        assert!(matches!(age.data, ColumnData::Float(_)));
        let weight = &columns[3];
        assert!(matches!(weight.data, ColumnData::Float(_)));
    }

    #[test]
    fn mixed_features_load_as_category_with_missing() {
        let columns = columns_of(SHEET);
        let stage = columns.into_iter().nth(2).unwrap();
        assert_eq!(stage.name, "stage");
        match stage.data {
            ColumnData::Category { rows, .. } => {
                let values: Vec<Option<String>> = rows.collect();
                assert_eq!(
                    values,
                    vec![Some("II".into()), Some("III".into()), Some("II".into())]
                );
            }
            _ => panic!("stage must be categorical"),
        }
    }

    #[test]
    fn category_cells_share_the_numeric_missing_sentinels() {
        let columns = columns_of(
            "sample\tstage\n\
             s1\tII\n\
             s2\tnan\n\
             s3\tNULL\n\
             s4\tna\n\
             s5\tIII\n",
        );
        match columns.into_iter().nth(1).unwrap().data {
            ColumnData::Category { rows, .. } => {
                let values: Vec<Option<String>> = rows.collect();
                assert_eq!(
                    values,
                    vec![Some("II".into()), None, None, None, Some("III".into())]
                );
            }
            _ => panic!("stage must be categorical"),
        }
    }

    #[test]
    fn short_rows_are_padded_with_missing() {
        // The `stage` cell is omitted entirely; an all-missing column reads
        // as numeric.
        let columns = columns_of("sample\tage\tstage\ns1\t4\n");
        match columns.into_iter().nth(2).unwrap().data {
            ColumnData::Float(rows) => {
                let values: Vec<f32> = rows.collect();
                assert_eq!(values.len(), 1);
                assert!(values[0].is_nan());
            }
            _ => panic!("padded column must read as float"),
        }
    }
}
