//! Input detection: map a file to its reader and metadata.
//!
//! Detection inspects the cgdata sidecar (when present) and computes the
//! source checksums the loader needs for its hash gate. The reader itself
//! stays lazy: no matrix data is touched until the loader decides the
//! sources actually changed and consumes the columns.

pub mod cgdata;
pub mod clinical;
pub mod matrix;
pub mod probemap;

use std::path::Path;

use crate::common::{mtime_millis, sha256sum};
use crate::loader::source::MatrixSource;
use crate::loader::{DatasetMeta, SourceSpec};

/// Recognized input kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum FileKind {
    #[strum(serialize = "genomicMatrix")]
    GenomicMatrix,
    #[strum(serialize = "clinicalMatrix")]
    ClinicalMatrix,
    #[strum(serialize = "probeMap")]
    ProbeMap,
}

/// A detected input: its kind, the dataset metadata, the source specs for
/// the hash gate (matrix file plus sidecar when present), and the deferred
/// reader.
pub struct Detected {
    pub kind: FileKind,
    pub metadata: DatasetMeta,
    pub sources: Vec<SourceSpec>,
    pub reader: Box<dyn MatrixSource>,
}

/// Detect the kind of `path` and assemble its load inputs.
pub fn detect(path: &Path, force_probemap: bool) -> Result<Detected, anyhow::Error> {
    let mut sources = vec![spec_for(path)?];
    let mut metadata = DatasetMeta::default();
    let mut kind = FileKind::GenomicMatrix;

    if let Some(sidecar) = cgdata::read_sidecar(path)? {
        sources.push(spec_for(&cgdata::sidecar_path(path))?);
        if let Some(declared) = sidecar.kind.as_deref() {
            kind = match declared {
                "genomicMatrix" | "genomicSegment" => FileKind::GenomicMatrix,
                "clinicalMatrix" => FileKind::ClinicalMatrix,
                "probeMap" | "genePred" | "genePredExt" => FileKind::ProbeMap,
                other => {
                    tracing::warn!(
                        "{}: unknown type {:?}, loading as genomic matrix",
                        path.display(),
                        other
                    );
                    FileKind::GenomicMatrix
                }
            };
        }
        metadata = sidecar.metadata;
    }
    if force_probemap {
        kind = FileKind::ProbeMap;
    }
    tracing::debug!("detected {} as {}", path.display(), kind);

    let reader: Box<dyn MatrixSource> = match kind {
        FileKind::GenomicMatrix => Box::new(matrix::MatrixReader::new(path)),
        FileKind::ClinicalMatrix => Box::new(clinical::ClinicalReader::new(path)),
        FileKind::ProbeMap => Box::new(probemap::ProbemapReader::new(path)),
    };
    Ok(Detected {
        kind,
        metadata,
        sources,
        reader,
    })
}

fn spec_for(path: &Path) -> Result<SourceSpec, anyhow::Error> {
    Ok(SourceSpec {
        name: path.to_string_lossy().into_owned(),
        mtime: mtime_millis(path)?,
        hash: sha256sum(path)?,
    })
}
