use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use featstage::container::DatasetReader;
use featstage::corpus::{self, CorpusEntry};
use featstage::{FeatureKind, Pipeline, PipelineConfig, PipelineObserver, PipelineState, Vocabulary};

// Exit code for a run aborted by the memory guard.
const EXIT_RESOURCE_EXHAUSTED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "featstage")]
#[command(about = "Batch audio feature extraction into a model-ready dataset container")]
struct Params {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract features for every corpus entry and assemble them into one container.
    Build(BuildArgs),

    /// Print a container's metadata and the first few decoded transcripts.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// CSV manifest with `wav_filename` (or `filename`) and `transcript` columns.
    #[arg(short = 'm', long = "manifest")]
    manifest: PathBuf,

    /// Path of the dataset container to create.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// TOML configuration file; flags below override its values.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory for staged batch artifacts (default: a temporary directory next to the output).
    #[arg(long = "staging-dir")]
    staging_dir: Option<PathBuf>,

    /// Vocabulary JSON; loaded if it exists, otherwise built from the corpus and saved here.
    #[arg(long = "vocabulary")]
    vocabulary: Option<PathBuf>,

    #[arg(long = "samples-per-batch")]
    samples_per_batch: Option<usize>,

    #[arg(long = "workers")]
    workers: Option<usize>,

    #[arg(long = "memory-critical-percent")]
    memory_critical_percent: Option<f32>,

    /// Feature kinds to extract, comma separated or repeated; each becomes its own region.
    #[arg(long = "feature-kind", value_enum, value_delimiter = ',')]
    feature_kinds: Vec<FeatureKind>,

    /// Pad or truncate labels to the feature frame count instead of the transcript limit.
    #[arg(long = "align-labels-to-frames", default_value_t = false)]
    align_labels_to_frames: bool,

    /// Disable the progress bar.
    #[arg(long = "no-progress", default_value_t = false)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Dataset container to read.
    path: PathBuf,

    /// Number of decoded transcripts to print.
    #[arg(long = "show", default_value_t = 5)]
    show: usize,
}

fn main() {
    featstage::logging::init();

    if let Err(err) = run() {
        error!(error = ?err, "featstage failed");
        std::process::exit(exit_code(&err));
    }
}

fn run() -> Result<()> {
    match Params::parse().command {
        Command::Build(args) => build(args),
        Command::Inspect(args) => inspect(args),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    let exhausted = err.chain().any(|cause| {
        cause
            .downcast_ref::<featstage::Error>()
            .is_some_and(featstage::Error::is_resource_exhausted)
    });
    if exhausted { EXIT_RESOURCE_EXHAUSTED } else { 1 }
}

fn build(args: BuildArgs) -> Result<()> {
    let config = load_config(&args)?;
    let entries = corpus::load_csv(&args.manifest)
        .with_context(|| format!("failed to load manifest '{}'", args.manifest.display()))?;
    let vocabulary = resolve_vocabulary(args.vocabulary.as_deref(), &entries)?;

    // Keep the temp dir alive for the whole run; it is removed on drop.
    let temp_staging;
    let staging_dir = match &args.staging_dir {
        Some(dir) => dir.clone(),
        None => {
            temp_staging = staging_tempdir(&args.output)?;
            temp_staging.path().to_path_buf()
        }
    };

    let mut observer = ProgressObserver::new(entries.len() as u64, !args.no_progress)?;
    let mut pipeline = Pipeline::new(&config).context("failed to start pipeline")?;
    let result = pipeline.run(
        &entries,
        &vocabulary,
        &staging_dir,
        &args.output,
        &mut observer,
    );
    observer.finish();

    let summary = result.with_context(|| {
        format!(
            "failed to build dataset '{}' (state: {:?})",
            args.output.display(),
            pipeline.state()
        )
    })?;

    println!(
        "wrote {} items ({} skipped) in {} batches to {}",
        summary.items,
        summary.skipped,
        summary.batches,
        summary.output.display()
    );
    Ok(())
}

fn load_config(args: &BuildArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config '{}'", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(n) = args.samples_per_batch {
        config.batch.samples_per_batch = n;
    }
    if args.workers.is_some() {
        config.batch.workers = args.workers;
    }
    if let Some(percent) = args.memory_critical_percent {
        config.memory.critical_percent = percent;
    }
    if !args.feature_kinds.is_empty() {
        config.features.kinds = args.feature_kinds.clone();
    }
    if args.align_labels_to_frames {
        config.labels.align_to_frames = true;
    }

    config.validate()?;
    Ok(config)
}

fn resolve_vocabulary(path: Option<&Path>, entries: &[CorpusEntry]) -> Result<Vocabulary> {
    let build = || Vocabulary::build(entries.iter().map(|e| e.transcript.as_str()));

    match path {
        Some(path) if path.exists() => {
            let vocabulary = Vocabulary::load(path)
                .with_context(|| format!("failed to load vocabulary '{}'", path.display()))?;
            info!(path = %path.display(), size = vocabulary.len(), "loaded vocabulary");

            let missing =
                vocabulary.missing_characters(entries.iter().map(|e| e.transcript.as_str()));
            if !missing.is_empty() {
                warn!(
                    path = %path.display(),
                    missing = %missing.iter().collect::<String>(),
                    "vocabulary lacks characters used by the corpus; they will be dropped from labels"
                );
            }
            Ok(vocabulary)
        }
        Some(path) => {
            let vocabulary = build();
            vocabulary
                .save(path)
                .with_context(|| format!("failed to save vocabulary '{}'", path.display()))?;
            info!(path = %path.display(), size = vocabulary.len(), "saved vocabulary");
            Ok(vocabulary)
        }
        None => Ok(build()),
    }
}

fn staging_tempdir(output: &Path) -> Result<tempfile::TempDir> {
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create '{}'", parent.display()))?;

    tempfile::Builder::new()
        .prefix(".featstage-staging-")
        .tempdir_in(parent)
        .context("failed to create staging directory")
}

fn inspect(args: InspectArgs) -> Result<()> {
    let mut reader = DatasetReader::open(&args.path)
        .with_context(|| format!("failed to open '{}'", args.path.display()))?;
    let metadata = reader.metadata().clone();
    let vocabulary = metadata.vocabulary();

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    serde_json::to_writer_pretty(&mut out, &metadata)?;
    writeln!(out)?;

    for i in 0..args.show.min(reader.len()) {
        let labels = reader.label(i)?;
        let text = vocabulary
            .decode(&labels)
            .with_context(|| format!("failed to decode labels of item {i}"))?;
        writeln!(out, "{i}\t{text}")?;
    }

    out.flush()?;
    Ok(())
}

struct ProgressObserver {
    bar: Option<ProgressBar>,
}

impl ProgressObserver {
    fn new(total: u64, enabled: bool) -> Result<Self> {
        if !enabled {
            return Ok(Self { bar: None });
        }

        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {msg:<20} {pos}/{len} {bar:40.cyan/blue} {eta}",
            )
            .context("invalid progress template")?
            .progress_chars("#>-"),
        );
        Ok(Self { bar: Some(bar) })
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl PipelineObserver for ProgressObserver {
    fn on_state(&mut self, state: PipelineState) {
        let Some(bar) = &self.bar else {
            return;
        };
        match state {
            PipelineState::Extracting { batch } => bar.set_message(format!("batch {batch}")),
            PipelineState::Assembling => bar.set_message("assembling"),
            _ => {}
        }
    }

    fn on_item_done(&mut self, _batch: usize, _done: usize, _total: usize) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn on_batch_assembled(&mut self, batch: usize, _items: usize) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("assembled {batch}"));
        }
    }
}
