//! cgdata JSON sidecar metadata.
//!
//! A matrix file `foo.tsv` may carry a sidecar `foo.tsv.json` declaring its
//! type and dataset metadata. The raw JSON is stored verbatim on the
//! dataset row; known keys are folded into the normalized columns.

use std::path::{Path, PathBuf};

use crate::loader::DatasetMeta;

/// Sidecar path for a matrix file: the file path with `.json` appended.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".json");
    PathBuf::from(os)
}

/// Parsed sidecar contents.
#[derive(Debug, Clone)]
pub struct Sidecar {
    /// The declared file type, e.g. `genomicMatrix`.
    pub kind: Option<String>,
    pub metadata: DatasetMeta,
}

/// Read and parse the sidecar of `path`, if one exists.
pub fn read_sidecar(path: &Path) -> Result<Option<Sidecar>, anyhow::Error> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&sidecar)
        .map_err(|e| anyhow::anyhow!("could not read {}: {}", sidecar.display(), e))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("invalid JSON in {}: {}", sidecar.display(), e))?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let mut metadata: DatasetMeta = serde_json::from_value(value)
        .map_err(|e| anyhow::anyhow!("unexpected metadata in {}: {}", sidecar.display(), e))?;
    metadata.text = Some(text);
    Ok(Some(Sidecar { kind, metadata }))
}
