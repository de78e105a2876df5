//! brw-extract: channel selection and downsampling for BRW recordings.

use anyhow::{bail, Context, Result};
use brw_extract::{
    export_selection, open, run_batch, run_downsample, run_downsample_from, scan_folder,
    Electrode, ExtractConfig, ExtractionState,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "brw-extract", version, about = "Extract and downsample electrodes from BRW recordings")]
struct Cli {
    /// TOML file with block sizes and worker count
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Reconstruction threads (overrides the config file)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Frames per block (overrides the config file, both encodings)
    #[arg(long, global = true)]
    block_frames: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the source recordings in a folder
    Scan {
        folder: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Write a `_exportCh` selection next to a recording
    Export {
        source: PathBuf,
        /// Electrodes as ROW:COL, comma separated
        #[arg(long, value_delimiter = ',', value_parser = parse_electrode, conflicts_with = "all")]
        electrodes: Vec<Electrode>,
        /// Select every recorded electrode
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 0)]
        row_skip: u16,
        #[arg(long, default_value_t = 0)]
        col_skip: u16,
        /// Target sampling rate (Hz)
        #[arg(long)]
        rate: f64,
        /// Window start (s)
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        /// Window end (s); 0 keeps the whole recording
        #[arg(long, default_value_t = 0.0)]
        end: f64,
    },
    /// Resample one `_exportCh` selection
    Downsample {
        export: PathBuf,
        /// Source recording, if it is not next to the export
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Resample every `_exportCh` selection in a folder
    Batch { folder: PathBuf },
}

fn parse_electrode(value: &str) -> std::result::Result<Electrode, String> {
    let (row, col) = value
        .split_once(':')
        .ok_or_else(|| format!("'{}' is not ROW:COL", value))?;
    let row: i16 = row.trim().parse().map_err(|_| format!("bad row in '{}'", value))?;
    let col: i16 = col.trim().parse().map_err(|_| format!("bad column in '{}'", value))?;
    let electrode = Electrode::new(row, col);
    if !electrode.is_on_grid() {
        return Err(format!("{} is off the 64x64 grid", electrode));
    }
    Ok(electrode)
}

fn load_config(cli: &Cli) -> Result<ExtractConfig> {
    let mut config = match &cli.config {
        Some(path) => ExtractConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ExtractConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.worker_threads = workers;
    }
    if let Some(frames) = cli.block_frames {
        config.raw_block_frames = frames;
        config.wav_block_frames = frames;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Scan { folder, json } => {
            let summaries = scan_folder(&folder)
                .with_context(|| format!("Failed to scan {}", folder.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                for summary in &summaries {
                    let state = match &summary.state {
                        ExtractionState::Identified => "new".to_string(),
                        ExtractionState::Selected { .. } => "exported".to_string(),
                        ExtractionState::Downsampled { output } => {
                            format!("resampled -> {}", output.display())
                        }
                        ExtractionState::Failed { reason } => format!("failed: {}", reason),
                    };
                    println!(
                        "{}  {}  {} ch  {} frames  {} s  {} Hz  {}",
                        summary.path.display(),
                        summary.variant,
                        summary.channel_count,
                        summary.frame_count,
                        summary.duration_secs,
                        summary.sampling_rate,
                        state
                    );
                }
            }
        }
        Command::Export {
            source,
            electrodes,
            all,
            row_skip,
            col_skip,
            rate,
            start,
            end,
        } => {
            let selected = if all {
                open(&source)
                    .with_context(|| format!("Failed to open {}", source.display()))?
                    .electrodes
            } else {
                electrodes
            };
            if selected.is_empty() {
                bail!("no electrodes selected; pass --electrodes or --all");
            }
            let export = export_selection(&source, &selected, row_skip, col_skip, rate, start, end)
                .with_context(|| format!("Failed to export {}", source.display()))?;
            let state = ExtractionState::Selected { export };
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Downsample { export, source } => {
            let summary = match source {
                Some(source) => run_downsample_from(&export, &source, &config),
                None => run_downsample(&export, &config),
            }
            .with_context(|| format!("Failed to downsample {}", export.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Batch { folder } => {
            let report = run_batch(&folder, &config)
                .with_context(|| format!("Failed to run batch in {}", folder.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("{} succeeded, {} failed", report.succeeded(), report.failed());
        }
    }

    Ok(())
}
