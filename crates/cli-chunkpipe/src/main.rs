use anyhow::{Context, Result};
use chunkpipe::{
    install_signal_handlers, lock, scan, CancelToken, ChunkInfo, ChunkProgress, FfmpegTranscoder,
    FfprobeProber, Pipeline, PipelineConfig, ProgressSink, RunSummary, SizeOrder, UnitOutcome,
};
use clap::Parser;
use humansize::{format_size, BINARY};
use log::{error, info, warn, LevelFilter};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Chunked, resumable re-encoder for a media library
#[derive(Parser, Debug)]
#[command(name = "chunkpipe", author, version, about, long_about = None)]
struct Args {
    /// Directory containing video files
    directory: PathBuf,

    /// Output directory (default "02", created if missing)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Process smallest files first
    #[arg(short, long)]
    reverse: bool,

    /// Report every Nth progress update
    #[arg(long)]
    progress_interval: Option<u32>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print where each file would resume, then exit
    #[arg(long)]
    status: bool,

    /// Remove lock markers left by a killed run, then exit
    #[arg(long)]
    clear_locks: bool,
}

/// Width of the carriage-return progress line
const PROGRESS_WIDTH: usize = 118;

/// Rewrites a single console line with the latest chunk progress
struct ConsoleProgress {
    out: io::Stdout,
}

impl ConsoleProgress {
    fn new() -> Self {
        Self { out: io::stdout() }
    }

    fn write_line(&mut self, line: &str, done: bool) {
        let mut out = self.out.lock();
        let _ = write!(out, "\r{:<width$}", line, width = PROGRESS_WIDTH);
        if done {
            let _ = writeln!(out);
        }
        let _ = out.flush();
    }
}

impl ProgressSink for ConsoleProgress {
    fn progress(&mut self, _chunk: &ChunkInfo, progress: &ChunkProgress) {
        self.write_line(&progress.render_line(), false);
    }

    fn chunk_finished(&mut self, _chunk: &ChunkInfo, output_bytes: u64) {
        let size = format_size(output_bytes, BINARY);
        let line = format!("    Chunk ETA:0:00:00 | 100.00% | size:{} | ETA size:{}", size, size);
        self.write_line(&line, true);
    }
}

fn init_logger(verbose: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.format_timestamp_secs().init();
}

/// Apply command-line overrides on top of the loaded configuration
fn resolve_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(output) = &args.output {
        cfg.output_dir = output.clone();
    }
    if args.reverse {
        cfg.largest_first = !cfg.largest_first;
    }
    if let Some(n) = args.progress_interval {
        cfg.progress_interval = n;
    }
    Ok(cfg)
}

fn validate_input_dir(directory: &Path) -> Result<()> {
    if !directory.is_dir() {
        anyhow::bail!("Input directory does not exist or is not a directory: {}", directory.display());
    }
    Ok(())
}

/// Resolve the output directory to an absolute path, creating it only when `create` is set.
///
/// A missing directory is left as configured when not creating it.
fn prepare_output_dir(cfg: &mut PipelineConfig, create: bool) -> Result<()> {
    if create {
        fs::create_dir_all(&cfg.output_dir)
            .with_context(|| format!("Failed to create output directory: {}", cfg.output_dir.display()))?;
    } else if !cfg.output_dir.is_dir() {
        return Ok(());
    }
    cfg.output_dir = cfg
        .output_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve output directory: {}", cfg.output_dir.display()))?;
    Ok(())
}

async fn validate_tools(cfg: &PipelineConfig) -> Result<()> {
    let probe_version = FfprobeProber::new(cfg)
        .check_available()
        .await
        .context("ffprobe is not usable")?;
    info!("🔍 {}", probe_version);

    FfmpegTranscoder::new(cfg)
        .check_environment(&cfg.video_codec)
        .await
        .context("ffmpeg is not usable")?;
    info!("✅ Encoder {} available", cfg.video_codec);
    Ok(())
}

fn clear_locks(directory: &Path) -> Result<()> {
    let markers = scan::find_lock_markers(directory).context("Failed to search for lock files")?;
    if markers.is_empty() {
        info!("No lock files found under {}", directory.display());
        return Ok(());
    }
    for marker in &markers {
        if let Some(source) = lock::locked_source(marker) {
            lock::release(&source)?;
            info!("🔓 Removed lock: {}", marker.display());
        }
    }
    info!("Removed {} lock file(s)", markers.len());
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let elapsed = summary.elapsed();
    println!();
    println!("==================== Summary ====================");
    println!("  Started:            {}", summary.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Finished:           {}", summary.finished_at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "  Elapsed:            {}:{:02}:{:02}",
        elapsed.num_hours(),
        elapsed.num_minutes() % 60,
        elapsed.num_seconds() % 60
    );
    println!("  Files found:        {}", summary.found);
    println!("  Processed:          {}", summary.processed);
    println!("    cleaned up:       {}", summary.cleaned);
    println!("    kept (mismatch):  {}", summary.mismatched);
    println!("  Failed:             {}", summary.failed);
    println!("  Incomplete:         {}", summary.incomplete);
    println!("  Skipped (locked):   {}", summary.skipped_locked);
    println!("  Missing:            {}", summary.missing);

    for (path, outcome) in &summary.outcomes {
        match outcome {
            UnitOutcome::Failed { stage, error } => {
                println!("  ❌ {} ({}): {}", path.display(), stage, error)
            }
            UnitOutcome::MismatchKept { source_secs, output_secs } => println!(
                "  ⚠️  {}: source {:?}s vs output {:?}s, kept",
                path.display(),
                source_secs,
                output_secs
            ),
            _ => {}
        }
    }

    if summary.stopped_by_cancel {
        println!("Stopped by user request. Rerun to resume.");
    } else {
        println!("All files processed.");
    }
}

async fn run(args: Args) -> Result<()> {
    let mut cfg = resolve_config(&args)?;
    validate_input_dir(&args.directory)?;

    if args.clear_locks {
        return clear_locks(&args.directory);
    }
    prepare_output_dir(&mut cfg, !args.status)?;

    let order = if cfg.largest_first {
        SizeOrder::LargestFirst
    } else {
        SizeOrder::SmallestFirst
    };
    let candidates = scan::scan_media(&args.directory, order, Some(&cfg.output_dir))
        .context("Failed to scan input directory")?;
    let total_bytes: u64 = candidates.iter().map(|c| c.size).sum();
    info!(
        "Found {} video files ({} total)",
        candidates.len(),
        format_size(total_bytes, BINARY)
    );

    if args.status {
        let pipeline = Pipeline::new(cfg.clone(), FfprobeProber::new(&cfg), FfmpegTranscoder::new(&cfg));
        for (path, stage) in pipeline.status(&candidates)? {
            println!("{:<40} {}", stage.to_string(), path.display());
        }
        return Ok(());
    }

    validate_tools(&cfg).await?;

    info!("Output directory: {}", cfg.output_dir.display());
    info!("Encoder: {} (preset {})", cfg.video_codec, cfg.preset);

    let cancel = CancelToken::new();
    let signals = install_signal_handlers(cancel.clone());

    let pipeline = Pipeline::new(cfg.clone(), FfprobeProber::new(&cfg), FfmpegTranscoder::new(&cfg));
    let mut console = ConsoleProgress::new();
    let summary = pipeline.run(&candidates, &cancel, &mut console).await;
    signals.abort();

    print_summary(&summary);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if e.downcast_ref::<chunkpipe::ToolError>().is_some() {
                warn!("Install ffmpeg/ffprobe or point ffmpeg_bin/ffprobe_bin at them in the config file");
            }
            ExitCode::FAILURE
        }
    }
}
