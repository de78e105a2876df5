//! Selection export, downsample runs, folder scan and batch driver.
//!
//! A source recording moves through [`ExtractionState`]: it is identified,
//! a selection is exported to `<name>_exportCh.brw`, and the export is later
//! turned into `<name>_resample_<rate>.brw`. Any step can fail; failures
//! only ever affect the file being processed.

use hdf5::File;
use ndarray::Array2;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

use crate::channel_map::{intersect_by_selection, stride_select, Intersection};
use crate::config::ExtractConfig;
use crate::reader::open_recording;
use crate::resample::{compute_ratio, downsample_factor, to_sample, Resampler};
use crate::types::*;
use crate::wavelet::{reconstruct_channel, CoefficientLocation};
use crate::writer::{read_export_tag, ContainerWriter, FlattenOrder};

const PRINT_PROGRESS_STEP: usize = 10;
const EXPORT_SUFFIX: &str = "_exportCh";
const RESAMPLE_MARKER: &str = "resample";
const BRW_EXTENSION: &str = "brw";
const OUTPUT_ORDER: FlattenOrder = FlattenOrder::Interleaved;

/// Where a source file stands in the extraction workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExtractionState {
    /// Opened and recognized
    Identified,
    /// Selection exported
    Selected { export: PathBuf },
    /// Resampled output written
    Downsampled { output: PathBuf },
    /// Aborted; the reason is the error message
    Failed { reason: String },
}

/// Result of one downsample run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownsampleSummary {
    pub export: PathBuf,
    pub source: PathBuf,
    pub output: PathBuf,
    pub source_variant: ContainerVariant,
    pub electrodes: usize,
    pub frames_written: u64,
    pub output_rate: f64,
}

/// One line of a folder scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub variant: ContainerVariant,
    pub channel_count: usize,
    pub frame_count: u64,
    /// Duration rounded to whole seconds
    pub duration_secs: u64,
    pub sampling_rate: f64,
    /// Furthest workflow step found on disk for this recording
    pub state: ExtractionState,
}

/// Outcome of one export in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub export: PathBuf,
    pub state: ExtractionState,
}

/// Per-file outcomes of a batch run, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<FileOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.state, ExtractionState::Downsampled { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.state, ExtractionState::Failed { .. }))
            .count()
    }
}

/// `<dir>/<stem>_exportCh.brw` for a source recording.
pub fn export_path(source: &Path) -> PathBuf {
    sibling(source, &format!("{}{}.{}", file_stem(source), EXPORT_SUFFIX, BRW_EXTENSION))
}

/// Recovers the source recording from an export path by dropping `_exportCh`.
pub fn source_path_for_export(export: &Path) -> Result<PathBuf> {
    let stem = file_stem(export);
    let base = stem.strip_suffix(EXPORT_SUFFIX).ok_or_else(|| {
        BrwError::Format(format!(
            "{} is not named like a selection export (*{}.{})",
            export.display(),
            EXPORT_SUFFIX,
            BRW_EXTENSION
        ))
    })?;
    Ok(sibling(export, &format!("{}.{}", base, BRW_EXTENSION)))
}

/// `<dir>/<stem>_resample_<rate>.brw`, the rate truncated to whole hertz.
pub fn resample_path(source: &Path, target_rate: f64) -> PathBuf {
    sibling(
        source,
        &format!(
            "{}_{}_{}.{}",
            file_stem(source),
            RESAMPLE_MARKER,
            target_rate as i64,
            BRW_EXTENSION
        ),
    )
}

/// Writes a selection export for `source`.
///
/// The selection is stride-filtered, put in canonical order and checked
/// against the recorded electrodes. The export carries the source header at
/// native rate and full length plus the requested target rate and window;
/// no samples are copied and nothing is trimmed.
///
/// # Arguments
///
/// * `source` - Recording the selection was made on
/// * `selected` - Selected electrodes in any order
/// * `row_skip`, `col_skip` - Keep every `(skip + 1)`-th row/column
/// * `target_rate` - Output rate for the downsample stage (Hz)
/// * `start_sec`, `end_sec` - Requested window; `end_sec <= start_sec` means the whole recording
///
/// # Returns
///
/// The path of the written `_exportCh` container.
pub fn export_selection(
    source: &Path,
    selected: &[Electrode],
    row_skip: u16,
    col_skip: u16,
    target_rate: f64,
    start_sec: f64,
    end_sec: f64,
) -> Result<PathBuf> {
    let recording = open_recording(source)?;
    compute_ratio(recording.metadata.sampling_rate, target_rate)?;

    if !(start_sec.is_finite() && end_sec.is_finite()) || start_sec < 0.0 || end_sec < 0.0 {
        return Err(BrwError::Metadata(format!(
            "time window [{}, {}] s is invalid",
            start_sec, end_sec
        )));
    }

    let electrodes = stride_select(selected, row_skip, col_skip);
    if electrodes.is_empty() {
        return Err(BrwError::Metadata(format!(
            "no electrode left after keeping every {} row and {} column",
            u32::from(row_skip) + 1,
            u32::from(col_skip) + 1
        )));
    }

    let recorded: HashSet<Electrode> = recording.electrodes.iter().copied().collect();
    if let Some(missing) = electrodes.iter().find(|e| !recorded.contains(*e)) {
        return Err(BrwError::ChannelMismatch {
            electrode: *missing,
            source_name: source.display().to_string(),
        });
    }

    let export = export_path(source);
    let mut writer = ContainerWriter::create_empty(&export, &recording.metadata, &electrodes)?;
    writer.write_export_tag(target_rate, start_sec, end_sec)?;
    writer.finalize()?;

    info!(
        "Exported {} of {} electrodes from {} to {}",
        electrodes.len(),
        recording.electrodes.len(),
        source.display(),
        export.display()
    );
    Ok(export)
}

/// Resamples the selection described by an `_exportCh` container.
///
/// The source recording is found next to the export by dropping the
/// `_exportCh` suffix.
pub fn run_downsample(export: &Path, config: &ExtractConfig) -> Result<DownsampleSummary> {
    let source = source_path_for_export(export)?;
    run_downsample_from(export, &source, config)
}

/// Same as [`run_downsample`] with an explicit source recording.
pub fn run_downsample_from(
    export: &Path,
    source: &Path,
    config: &ExtractConfig,
) -> Result<DownsampleSummary> {
    let tag = read_export_tag(export)?;
    let recording = open_recording(source)?;
    check_export_is_current(export, &tag, &recording)?;

    let intersection = intersect_by_selection(&recording.electrodes, &tag.electrodes);
    if intersection.len() < tag.electrodes.len() {
        let matched: HashSet<&Electrode> = intersection.matched.iter().collect();
        if let Some(missing) = tag.electrodes.iter().find(|e| !matched.contains(*e)) {
            return Err(BrwError::ChannelMismatch {
                electrode: *missing,
                source_name: source.display().to_string(),
            });
        }
    }

    let window = frame_window(&tag, recording.metadata.frame_count);
    let output = resample_path(source, tag.target_rate);
    info!(
        "Downsampling {} electrodes of {} ({}) from {} Hz to {} Hz, frames {}..{}",
        intersection.len(),
        source.display(),
        recording.layout.variant(),
        recording.metadata.sampling_rate,
        tag.target_rate,
        window.start,
        window.end
    );

    let result = match &recording.layout {
        SourceLayout::Bw4Raw(layout) | SourceLayout::Bw5Raw(layout) => downsample_raw(
            &recording,
            layout,
            &intersection,
            window,
            tag.target_rate,
            &output,
            config,
        ),
        SourceLayout::Bw4Wav(layout) | SourceLayout::Bw5Wav(layout) => downsample_wav(
            &recording,
            layout,
            &intersection,
            window,
            tag.target_rate,
            &output,
            config,
        ),
    };

    let (frames_written, output_rate) = match result {
        Ok(written) => written,
        Err(e) => {
            if e.is_io() && output.exists() {
                warn!(
                    "Writing {} failed, keeping the partial output: {}",
                    output.display(),
                    e
                );
            }
            return Err(e);
        }
    };

    info!(
        "Wrote {} frames at {} Hz to {}",
        frames_written,
        output_rate,
        output.display()
    );
    Ok(DownsampleSummary {
        export: export.to_path_buf(),
        source: source.to_path_buf(),
        output,
        source_variant: recording.layout.variant(),
        electrodes: intersection.len(),
        frames_written,
        output_rate,
    })
}

/// Lists the source recordings in `folder`.
///
/// Derived files (names containing `resample` or `exportCh`) are skipped, as
/// are files that cannot be read; the latter are logged.
pub fn scan_folder(folder: &Path) -> Result<Vec<RecordingSummary>> {
    let files = brw_files(folder)?;
    let mut summaries = Vec::new();
    for path in &files {
        let name = file_name(path);
        if name.contains(RESAMPLE_MARKER) || name.contains(&EXPORT_SUFFIX[1..]) {
            debug!("Skipping derived file {}", path.display());
            continue;
        }
        match open_recording(path) {
            Ok(recording) => summaries.push(RecordingSummary {
                variant: recording.layout.variant(),
                channel_count: recording.electrodes.len(),
                frame_count: recording.metadata.frame_count,
                duration_secs: recording.metadata.duration_secs().round() as u64,
                sampling_rate: recording.metadata.sampling_rate,
                state: state_on_disk(path, &files),
                path: path.clone(),
            }),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(summaries)
}

/// Runs [`run_downsample`] on every `*_exportCh.brw` in `folder`.
///
/// A failing file is recorded in the report and the batch moves on.
pub fn run_batch(folder: &Path, config: &ExtractConfig) -> Result<BatchReport> {
    let exports: Vec<PathBuf> = brw_files(folder)?
        .into_iter()
        .filter(|path| file_stem(path).ends_with(EXPORT_SUFFIX))
        .collect();
    info!("Found {} selection exports in {}", exports.len(), folder.display());

    let mut report = BatchReport::default();
    for export in exports {
        let state = match run_downsample(&export, config) {
            Ok(summary) => ExtractionState::Downsampled {
                output: summary.output,
            },
            Err(e) => {
                error!("Failed to downsample {}: {}", export.display(), e);
                ExtractionState::Failed {
                    reason: e.to_string(),
                }
            }
        };
        report.outcomes.push(FileOutcome { export, state });
    }

    info!(
        "Batch finished: {} downsampled, {} failed",
        report.succeeded(),
        report.failed()
    );
    Ok(report)
}

/// Workflow state of `source` judged by the derived files next to it.
///
/// A `<stem>_resample_*.brw` output wins over a `<stem>_exportCh.brw`
/// selection; a recording with neither is only identified.
fn state_on_disk(source: &Path, files: &[PathBuf]) -> ExtractionState {
    let resample_prefix = format!("{}_{}_", file_stem(source), RESAMPLE_MARKER);
    if let Some(output) = files
        .iter()
        .find(|path| file_stem(path).starts_with(&resample_prefix))
    {
        return ExtractionState::Downsampled {
            output: output.clone(),
        };
    }
    let export = export_path(source);
    if files.contains(&export) {
        return ExtractionState::Selected { export };
    }
    ExtractionState::Identified
}

// Helper function to reject exports whose source changed since the selection
fn check_export_is_current(export: &Path, tag: &ExportTag, recording: &Recording) -> Result<()> {
    let stale = |reason: String| BrwError::StaleExport {
        export: export.to_path_buf(),
        reason,
    };

    let tagged = ContainerVariant::new(tag.source_generation, tag.source_encoding);
    if tagged != recording.layout.variant() {
        return Err(stale(format!(
            "exported from a {} recording, source is {}",
            tagged,
            recording.layout.variant()
        )));
    }
    if tag.frame_count != recording.metadata.frame_count {
        return Err(stale(format!(
            "exported {} frames, source has {}",
            tag.frame_count, recording.metadata.frame_count
        )));
    }
    let rate = recording.metadata.sampling_rate;
    if (tag.sampling_rate - rate).abs() > 1e-6 * rate.abs().max(1.0) {
        return Err(stale(format!(
            "exported at {} Hz, source is {} Hz",
            tag.sampling_rate, rate
        )));
    }
    Ok(())
}

/// Frames covered by the tagged window, or every frame when no window is set.
fn frame_window(tag: &ExportTag, frame_count: u64) -> Range<u64> {
    if tag.end_sec > tag.start_sec {
        let start = ((tag.start_sec * tag.sampling_rate).floor() as u64).min(frame_count);
        let end = ((tag.end_sec * tag.sampling_rate).floor() as u64).min(frame_count);
        start..end
    } else {
        0..frame_count
    }
}

fn downsample_raw(
    recording: &Recording,
    layout: &RawLayout,
    intersection: &Intersection,
    window: Range<u64>,
    target_rate: f64,
    output: &Path,
    config: &ExtractConfig,
) -> Result<(u64, f64)> {
    let ratio = compute_ratio(recording.metadata.sampling_rate, target_rate)?;
    let file = File::open(&recording.path)?;
    let dataset = file.dataset(&layout.dataset)?;
    let stride = layout.channels_per_frame;
    let block_frames = config.raw_block_frames.max(1) as u64;

    let mut stream = OutputStream::create(
        output,
        &recording.metadata,
        &intersection.matched,
        target_rate,
        config,
    )?;
    let mut resampler = Resampler::new();
    let mut progress = Progress::new("frames");
    let total = window.end - window.start;

    let mut start = window.start;
    while start < window.end {
        let end = (start + block_frames).min(window.end);
        let frames = (end - start) as usize;
        let flat = dataset
            .read_slice_1d::<i16, _>(start as usize * stride..end as usize * stride)?;

        let mut rows = Vec::with_capacity(intersection.len());
        for &channel in &intersection.source_indices {
            let samples: Vec<f64> = (0..frames)
                .map(|frame| f64::from(flat[frame * stride + channel]))
                .collect();
            rows.push(resampler.downsample(&samples, ratio)?);
        }

        stream.push(&block_from_rows(&rows, 0, rows_len(&rows)))?;
        progress.update(end - window.start, total);
        start = end;
    }

    Ok((stream.finish(intersection.len())?, target_rate))
}

fn downsample_wav(
    recording: &Recording,
    layout: &WaveletLayout,
    intersection: &Intersection,
    window: Range<u64>,
    target_rate: f64,
    output: &Path,
    config: &ExtractConfig,
) -> Result<(u64, f64)> {
    let factor = downsample_factor(recording.metadata.sampling_rate, target_rate)?;
    let output_rate = recording.metadata.sampling_rate / factor as f64;
    let descriptor = layout.descriptor;
    descriptor.chunks_per_channel()?;

    let location = CoefficientLocation {
        path: recording.path.clone(),
        dataset: layout.dataset.clone(),
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers())
        .build()
        .map_err(|e| BrwError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    debug!("Reconstructing on {} workers", pool.current_num_threads());

    let total = intersection.len();
    let finished = AtomicUsize::new(0);
    let tasks: Vec<(usize, usize)> = intersection.source_indices.iter().copied().enumerate().collect();

    let mut rows: Vec<(usize, Vec<f64>)> = pool.install(|| {
        tasks
            .par_iter()
            .map(|&(position, channel)| -> Result<(usize, Vec<f64>)> {
                let stream = location.open()?;
                let samples = reconstruct_channel(&stream, channel, &descriptor)?;
                let end = descriptor.samples_before_frame(window.end).min(samples.len());
                let start = descriptor.samples_before_frame(window.start).min(end);
                let mut resampler = Resampler::new();
                let resampled = resampler.downsample(&samples[start..end], factor as f64)?;

                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                if done * 100 / total / PRINT_PROGRESS_STEP
                    > (done - 1) * 100 / total / PRINT_PROGRESS_STEP
                {
                    info!("{}% of channels reconstructed...", done * 100 / total);
                }
                Ok((position, resampled))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    rows.sort_by_key(|(position, _)| *position);
    let rows: Vec<Vec<f64>> = rows.into_iter().map(|(_, row)| row).collect();

    let mut stream = OutputStream::create(
        output,
        &recording.metadata,
        &intersection.matched,
        output_rate,
        config,
    )?;
    let frames = rows_len(&rows);
    let block_frames = config.wav_block_frames.max(1);
    let mut start = 0;
    while start < frames {
        let end = (start + block_frames).min(frames);
        stream.push(&block_from_rows(&rows, start, end))?;
        start = end;
    }

    Ok((stream.finish(intersection.len())?, output_rate))
}

/// Shortest row length; all rows normally agree.
fn rows_len(rows: &[Vec<f64>]) -> usize {
    rows.iter().map(Vec::len).min().unwrap_or(0)
}

fn block_from_rows(rows: &[Vec<f64>], start: usize, end: usize) -> SampleBlock {
    Array2::from_shape_fn((rows.len(), end - start), |(channel, frame)| {
        to_sample(rows[channel][start + frame])
    })
}

/// Output container being filled block by block.
struct OutputStream {
    path: PathBuf,
    writer: Option<ContainerWriter>,
    sampling_rate: f64,
    frames_written: u64,
}

impl OutputStream {
    fn create(
        path: &Path,
        source: &RecordingMetadata,
        electrodes: &[Electrode],
        sampling_rate: f64,
        config: &ExtractConfig,
    ) -> Result<Self> {
        // Outputs are always plain BW4-RAW containers
        let metadata = RecordingMetadata {
            generation: Generation::Bw4,
            encoding: Encoding::Raw,
            sampling_rate,
            frame_count: 0,
            ..source.clone()
        };
        let writer = ContainerWriter::create_empty(path, &metadata, electrodes)?
            .with_chunk_len(config.raw_chunk_len);
        Ok(OutputStream {
            path: path.to_path_buf(),
            writer: Some(writer),
            sampling_rate,
            frames_written: 0,
        })
    }

    fn push(&mut self, block: &SampleBlock) -> Result<()> {
        match self.writer.take() {
            Some(mut writer) => {
                writer.write_initial_block(block, OUTPUT_ORDER, self.sampling_rate)?;
                writer.finalize()?;
                self.frames_written = block.ncols() as u64;
            }
            None => {
                if block.ncols() == 0 {
                    return Ok(());
                }
                let cumulative = self.frames_written + block.ncols() as u64;
                ContainerWriter::append_block(&self.path, cumulative, block, OUTPUT_ORDER)?;
                self.frames_written = cumulative;
            }
        }
        Ok(())
    }

    /// Closes the stream, writing an empty initial block if nothing was pushed.
    fn finish(mut self, channels: usize) -> Result<u64> {
        if self.writer.is_some() {
            self.push(&SampleBlock::zeros((channels, 0)))?;
        }
        Ok(self.frames_written)
    }
}

/// Logs progress at fixed percentage steps.
struct Progress {
    what: &'static str,
    percent_done: u64,
}

impl Progress {
    fn new(what: &'static str) -> Self {
        Progress {
            what,
            percent_done: PRINT_PROGRESS_STEP as u64,
        }
    }

    fn update(&mut self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let progress = done * 100 / total;
        if progress >= self.percent_done {
            info!("{}% of {} done...", progress, self.what);
            while self.percent_done <= progress {
                self.percent_done += PRINT_PROGRESS_STEP as u64;
            }
        }
    }
}

// Helper function to list `.brw` files in a folder, sorted by name
fn brw_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        let is_brw = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(BRW_EXTENSION))
            .unwrap_or(false);
        if is_brw && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
