//! Common functionality.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use flate2::bufread::MultiGzDecoder;
use sha2::{Digest, Sha256};

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Maximum length of a dataset name.
pub const MAX_DATASET_NAME: usize = 1000;
/// Maximum length of a field name.
pub const MAX_FIELD_NAME: usize = 255;
/// Maximum length of a categorical value.
pub const MAX_CATEGORY_VALUE: usize = 16_384;
/// Maximum length of the raw dataset metadata text.
pub const MAX_METADATA_TEXT: usize = 65_535;
/// Maximum length of a source path.
pub const MAX_SOURCE_PATH: usize = 2000;

/// Transparently open a file with gzip decompression when the path ends in
/// `.gz`.
pub fn open_read_maybe_gz<P>(path: P) -> Result<Box<dyn BufRead + Send>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file =
        File::open(path).map_err(|e| anyhow::anyhow!("could not open {}: {}", path.display(), e))?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        tracing::trace!("opening {:?} as gzip", path);
        let decoder = MultiGzDecoder::new(BufReader::new(file));
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Compute the SHA-256 checksum of a file as lowercase hex.
pub fn sha256sum<P>(path: P) -> Result<String, anyhow::Error>
where
    P: AsRef<Path>,
{
    let mut file = File::open(path.as_ref())
        .map_err(|e| anyhow::anyhow!("could not open {}: {}", path.as_ref().display(), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65_536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(base16ct::lower::encode_string(&hasher.finalize()))
}

/// Modification time of a file in milliseconds since the epoch.
pub fn mtime_millis<P>(path: P) -> Result<i64, anyhow::Error>
where
    P: AsRef<Path>,
{
    let mtime = std::fs::metadata(path.as_ref())?.modified()?;
    let since_epoch = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| anyhow::anyhow!("mtime before epoch: {}", e))?;
    Ok(since_epoch.as_millis() as i64)
}
