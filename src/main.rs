//! Xena column store main executable

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

use xena_store::loader::LoadRequest;
use xena_store::{common, sources, synth, Db};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Xena dataset storage and retrieval engine",
    long_about = "Load Xena matrix files into a column store and manage the datasets"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Load matrix files.
    Load(LoadArgs),
    /// Delete a dataset.
    Delete(DeleteArgs),
    /// Synthesize and load a random score matrix.
    Synth(SynthArgs),
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Path to the database file.
    #[arg(short = 'd', long, default_value = "xena.db")]
    db: PathBuf,
    /// Treat input files as probemaps.
    #[arg(short = 'p', long)]
    probemap: bool,
    /// Reload even when source files are unchanged.
    #[arg(long)]
    force: bool,
    /// Reject input files not strictly below this directory.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Matrix files to load.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    /// Path to the database file.
    #[arg(short = 'd', long, default_value = "xena.db")]
    db: PathBuf,
    /// Name of the dataset to delete.
    name: String,
}

#[derive(Debug, Args)]
struct SynthArgs {
    /// Path to the database file.
    #[arg(short = 'd', long, default_value = "xena.db")]
    db: PathBuf,
    /// Name of the dataset to create.
    name: String,
    /// Number of samples.
    samples: usize,
    /// Number of probes.
    probes: usize,
}

/// Load one file; failures here are per-file and do not fail the batch.
fn load_one(db: &Db, args: &LoadArgs, file: &Path) -> Result<(), anyhow::Error> {
    if let Some(root) = &args.data_root {
        check_in_data_root(root, file)?;
    }
    let detected = sources::detect(file, args.probemap)?;
    let name = file
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .ok_or_else(|| anyhow::anyhow!("unusable file name: {}", file.display()))?
        .to_string();
    let summary = db.write_matrix(LoadRequest {
        dataset: name.clone(),
        sources: detected.sources,
        metadata: detected.metadata,
        matrix: detected.reader,
        features: None,
        force: args.force,
    })?;
    for warning in &summary.warnings {
        tracing::warn!("{}: {}", name, warning);
    }
    tracing::info!("loaded {:?}: {} rows", name, summary.rows);
    Ok(())
}

/// Canonicalize both paths and require the input to be strictly below the
/// data root.
fn check_in_data_root(root: &Path, file: &Path) -> Result<(), anyhow::Error> {
    let root = root
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("cannot resolve data root {}: {}", root.display(), e))?;
    let file = file
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("cannot resolve {}: {}", file.display(), e))?;
    let inside = file
        .strip_prefix(&root)
        .map(|rest| !rest.as_os_str().is_empty())
        .unwrap_or(false);
    anyhow::ensure!(
        inside,
        "input file {} is outside the data root {}",
        file.display(),
        root.display()
    );
    Ok(())
}

fn run_load(args: &LoadArgs) -> Result<(), anyhow::Error> {
    let db = Db::open(&args.db)?;
    for file in &args.files {
        if let Err(e) = load_one(&db, args, file) {
            tracing::error!("failed to load {}: {:#}", file.display(), e);
            eprintln!("failed to load {}: {:#}", file.display(), e);
        }
    }
    db.close()?;
    Ok(())
}

fn run_delete(args: &DeleteArgs) -> Result<(), anyhow::Error> {
    let db = Db::open(&args.db)?;
    db.delete_matrix(&args.name)?;
    let removed = db.clean_sources()?;
    tracing::debug!("removed {} orphaned sources", removed);
    db.close()?;
    Ok(())
}

fn run_synth(args: &SynthArgs) -> Result<(), anyhow::Error> {
    let db = Db::open(&args.db)?;
    let summary = synth::write_synthetic(&db, &args.name, args.samples, args.probes)?;
    tracing::info!("synthesized {:?}: {} rows", args.name, summary.rows);
    db.close()?;
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Load(args) => run_load(args)?,
            Commands::Delete(args) => run_delete(args)?,
            Commands::Synth(args) => run_synth(args)?,
        }

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}
