//! Synthesized score matrices for benchmarks and tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::db::Db;
use crate::err::Result;
use crate::loader::source::{Column, ColumnData, ColumnStream, MatrixSource};
use crate::loader::{DatasetMeta, LoadRequest, LoadSummary};

/// A random `samples x probes` matrix. Scores are reproducible for a given
/// seed, so repeated benchmark runs see identical data.
pub struct SynthMatrix {
    pub samples: usize,
    pub probes: usize,
    pub seed: u64,
}

impl MatrixSource for SynthMatrix {
    fn into_columns(self: Box<Self>) -> Result<ColumnStream, anyhow::Error> {
        let SynthMatrix {
            samples,
            probes,
            seed,
        } = *self;
        let sample_names = (0..samples).map(|i| Some(format!("sample{}", i)));
        let sample_column = Column {
            name: "sampleID".to_string(),
            data: ColumnData::Category {
                rows: Box::new(sample_names),
                order: None,
            },
            feature: None,
        };
        let probe_columns = (0..probes).map(move |p| -> Result<Column, anyhow::Error> {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(p as u64));
            let scores: Vec<f32> = (0..samples).map(|_| rng.gen_range(0.0..100.0)).collect();
            Ok(Column {
                name: format!("probe{}", p),
                data: ColumnData::Float(Box::new(scores.into_iter())),
                feature: None,
            })
        });
        Ok(Box::new(
            std::iter::once(Ok(sample_column)).chain(probe_columns),
        ))
    }
}

/// Synthesize and load a matrix dataset.
pub fn write_synthetic(db: &Db, name: &str, samples: usize, probes: usize) -> Result<LoadSummary> {
    tracing::info!(
        "synthesizing dataset {:?} with {} samples x {} probes",
        name,
        samples,
        probes
    );
    db.write_matrix(LoadRequest {
        dataset: name.to_string(),
        sources: vec![],
        metadata: DatasetMeta {
            kind: Some("genomicMatrix".to_string()),
            ..Default::default()
        },
        matrix: Box::new(SynthMatrix {
            samples,
            probes,
            seed: 0x5eed,
        }),
        features: None,
        force: true,
    })
}
