use hdf5::types::{FixedAscii, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::channel_map::{canonical_grid, electrode_at};
use crate::types::*;

// Container paths
pub(crate) const NREC_FRAMES: &str = "/3BRecInfo/3BRecVars/NRecFrames";
pub(crate) const SAMPLING_RATE: &str = "/3BRecInfo/3BRecVars/SamplingRate";
pub(crate) const SIGNAL_INVERSION: &str = "/3BRecInfo/3BRecVars/SignalInversion";
pub(crate) const MAX_VOLT: &str = "/3BRecInfo/3BRecVars/MaxVolt";
pub(crate) const MIN_VOLT: &str = "/3BRecInfo/3BRecVars/MinVolt";
pub(crate) const BIT_DEPTH: &str = "/3BRecInfo/3BRecVars/BitDepth";
pub(crate) const NEW_SAMPLING: &str = "/3BRecInfo/3BRecVars/NewSampling";
pub(crate) const START_TIME: &str = "/3BRecInfo/3BRecVars/startTime";
pub(crate) const END_TIME: &str = "/3BRecInfo/3BRecVars/endTime";
pub(crate) const RAW_CHS: &str = "/3BRecInfo/3BMeaStreams/Raw/Chs";
pub(crate) const WAVELET_CHS: &str = "/3BRecInfo/3BMeaStreams/WaveletCoefficients/Chs";
pub(crate) const BW4_RAW_DATA: &str = "/3BData/Raw";
pub(crate) const BW4_WAVELET_DATA: &str = "/3BData/WaveletBasedEncodedRaw";
pub(crate) const DESCRIPTION_ATTR: &str = "Description";
pub(crate) const VERSION_ATTR: &str = "Version";

const EXPERIMENT_SETTINGS: &str = "ExperimentSettings";
const BW5_RAW_DATA: &str = "Well_A1/Raw";
const BW5_WAVELET_DATA: &str = "Well_A1/WaveletBasedEncodedRaw";
const BW5_STORED_CHANNELS: &str = "Well_A1/StoredChIdxs";
const MAX_SETTINGS_LEN: usize = 1 << 20;
const COMPRESSION_LEVEL_ATTR: &str = "CompressionLevel";
const DATA_CHUNK_LENGTH_ATTR: &str = "DataChunkLength";

// BW5 hardware constants (the files do not store them)
const BW5_SIGNAL_INVERSION: i32 = 1;
const BW5_MAX_UVOLT: i32 = 4125;
const BW5_MIN_UVOLT: i32 = -4125;
const BW5_BIT_DEPTH: u8 = 12;

/// Opens a BRW container and reads everything needed to extract from it.
///
/// The file is closed again before returning; later stages reopen it for
/// the duration of their own work.
///
/// # Arguments
///
/// * `path` - Path to the `.brw` file
///
/// # Returns
///
/// A `Result` containing the `Recording` or a `Format`/`Metadata`/storage error.
pub fn open_recording<P: AsRef<Path>>(path: P) -> Result<Recording> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let variant = identify(&file)?;
    let (metadata, electrodes, layout) = read_variant(&file, variant)?;

    print_recording_summary(path, &metadata, electrodes.len());

    Ok(Recording {
        path: path.to_path_buf(),
        metadata,
        electrodes,
        layout,
    })
}

/// Determines the container variant from the generation-specific marker keys.
pub fn identify(file: &File) -> Result<ContainerVariant> {
    if path_exists(file, EXPERIMENT_SETTINGS) {
        if path_exists(file, BW5_RAW_DATA) {
            return Ok(ContainerVariant::Bw5Raw);
        }
        if path_exists(file, BW5_WAVELET_DATA) {
            return Ok(ContainerVariant::Bw5Wav);
        }
        return Err(BrwError::Format(format!(
            "BW5 container has neither {} nor {}",
            BW5_RAW_DATA, BW5_WAVELET_DATA
        )));
    }

    if path_exists(file, NREC_FRAMES) {
        if path_exists(file, RAW_CHS) {
            return Ok(ContainerVariant::Bw4Raw);
        }
        if path_exists(file, WAVELET_CHS) {
            return Ok(ContainerVariant::Bw4Wav);
        }
        return Err(BrwError::Format(
            "BW4 container has no electrode list".to_string(),
        ));
    }

    Err(BrwError::Format("file not recognized as a BRW container".to_string()))
}

/// Reads the recording metadata and electrode list of an open container.
pub fn load_parameters(file: &File) -> Result<(RecordingMetadata, ElectrodeList)> {
    let variant = identify(file)?;
    let (metadata, electrodes, _) = read_variant(file, variant)?;
    Ok((metadata, electrodes))
}

/// Single dispatch over the four container variants
fn read_variant(
    file: &File,
    variant: ContainerVariant,
) -> Result<(RecordingMetadata, ElectrodeList, SourceLayout)> {
    match variant {
        ContainerVariant::Bw4Raw => {
            let (metadata, electrodes) = read_bw4_header(file, Encoding::Raw)?;
            let layout = SourceLayout::Bw4Raw(RawLayout {
                dataset: BW4_RAW_DATA.to_string(),
                channels_per_frame: electrodes.len(),
            });
            Ok((metadata, electrodes, layout))
        }
        ContainerVariant::Bw4Wav => {
            let (metadata, electrodes) = read_bw4_header(file, Encoding::Wav)?;
            // The coefficient stream is optional here: header-only copies of
            // WAV recordings are still valid metadata sources.
            let descriptor = if path_exists(file, BW4_WAVELET_DATA) {
                read_wavelet_descriptor(&file.dataset(BW4_WAVELET_DATA)?, electrodes.len())?
            } else {
                WaveletStreamDescriptor::new(1, 0, electrodes.len(), 0)
            };
            let layout = SourceLayout::Bw4Wav(WaveletLayout {
                dataset: BW4_WAVELET_DATA.to_string(),
                descriptor,
            });
            Ok((metadata, electrodes, layout))
        }
        ContainerVariant::Bw5Raw => read_bw5_raw(file),
        ContainerVariant::Bw5Wav => read_bw5_wav(file),
    }
}

/// Helper function to read the explicit BW4 header fields
fn read_bw4_header(file: &File, encoding: Encoding) -> Result<(RecordingMetadata, ElectrodeList)> {
    let frame_count = read_frame_count(&file.dataset(NREC_FRAMES)?)?;
    let sampling_rate = read_first::<f64>(file, SAMPLING_RATE)?;
    let signal_inversion = read_first::<i32>(file, SIGNAL_INVERSION)?;
    let max_uvolt = read_first::<i32>(file, MAX_VOLT)?;
    let min_uvolt = read_first::<i32>(file, MIN_VOLT)?;
    let bit_depth = read_first::<i32>(file, BIT_DEPTH)?;

    let bit_depth = u8::try_from(bit_depth)
        .ok()
        .filter(|bits| (1..=16).contains(bits))
        .ok_or_else(|| BrwError::Metadata(format!("bit depth {} is out of range", bit_depth)))?;

    if max_uvolt <= min_uvolt {
        return Err(BrwError::Metadata(format!(
            "voltage range [{}, {}] is empty",
            min_uvolt, max_uvolt
        )));
    }

    let chs_path = match encoding {
        Encoding::Raw => RAW_CHS,
        Encoding::Wav => WAVELET_CHS,
    };
    let electrodes = read_electrode_list(file, chs_path)?;

    let metadata = RecordingMetadata {
        generation: Generation::Bw4,
        encoding,
        sampling_rate,
        frame_count,
        signal_inversion,
        min_uvolt,
        max_uvolt,
        bit_depth,
    };

    Ok((metadata, electrodes))
}

/// Helper function to read a BW5 container with a raw sample stream
fn read_bw5_raw(file: &File) -> Result<(RecordingMetadata, ElectrodeList, SourceLayout)> {
    let sampling_rate = read_experiment_frame_rate(file)?;
    let raw_len = file.dataset(BW5_RAW_DATA)?.size();
    let frame_count = (raw_len / GRID_SIZE) as u64;

    let metadata = bw5_metadata(Encoding::Raw, sampling_rate, frame_count);
    let layout = SourceLayout::Bw5Raw(RawLayout {
        dataset: BW5_RAW_DATA.to_string(),
        channels_per_frame: GRID_SIZE,
    });

    Ok((metadata, canonical_grid(), layout))
}

/// Helper function to read a BW5 container with a wavelet stream
fn read_bw5_wav(file: &File) -> Result<(RecordingMetadata, ElectrodeList, SourceLayout)> {
    let sampling_rate = read_experiment_frame_rate(file)?;

    let stored: Vec<i64> = file.dataset(BW5_STORED_CHANNELS)?.read_raw()?;
    let electrodes = stored
        .iter()
        .map(|&idx| {
            usize::try_from(idx)
                .ok()
                .and_then(electrode_at)
                .ok_or_else(|| {
                    BrwError::Metadata(format!("stored channel index {} is off the grid", idx))
                })
        })
        .collect::<Result<ElectrodeList>>()?;
    validate_electrodes(&electrodes, BW5_STORED_CHANNELS)?;

    let descriptor = read_wavelet_descriptor(&file.dataset(BW5_WAVELET_DATA)?, stored.len())?;
    let frame_count = descriptor.frame_count()?;

    let metadata = bw5_metadata(Encoding::Wav, sampling_rate, frame_count);
    let layout = SourceLayout::Bw5Wav(WaveletLayout {
        dataset: BW5_WAVELET_DATA.to_string(),
        descriptor,
    });

    Ok((metadata, electrodes, layout))
}

fn bw5_metadata(encoding: Encoding, sampling_rate: f64, frame_count: u64) -> RecordingMetadata {
    RecordingMetadata {
        generation: Generation::Bw5,
        encoding,
        sampling_rate,
        frame_count,
        signal_inversion: BW5_SIGNAL_INVERSION,
        min_uvolt: BW5_MIN_UVOLT,
        max_uvolt: BW5_MAX_UVOLT,
        bit_depth: BW5_BIT_DEPTH,
    }
}

/// Helper function to read the wavelet stream parameters of a coefficient dataset
fn read_wavelet_descriptor(dataset: &Dataset, channel_count: usize) -> Result<WaveletStreamDescriptor> {
    let compression_level: i64 = dataset.attr(COMPRESSION_LEVEL_ATTR)?.read_scalar()?;
    let frames_chunk_length: i64 = dataset.attr(DATA_CHUNK_LENGTH_ATTR)?.read_scalar()?;

    let compression_level = u32::try_from(compression_level)
        .ok()
        .filter(|level| (1..=16).contains(level))
        .ok_or_else(|| {
            BrwError::Metadata(format!("compression level {} is out of range", compression_level))
        })?;
    let frames_chunk_length = usize::try_from(frames_chunk_length).map_err(|_| {
        BrwError::Metadata(format!("data chunk length {} is negative", frames_chunk_length))
    })?;

    let descriptor = WaveletStreamDescriptor::new(
        compression_level,
        frames_chunk_length,
        channel_count,
        dataset.size(),
    );
    debug!(
        "Wavelet stream: level {}, {} frames/chunk, {} coefficients/chunk, {} channels, {} coefficients",
        descriptor.compression_level,
        descriptor.frames_chunk_length,
        descriptor.coefs_chunk_length,
        descriptor.channel_count,
        descriptor.total_coefficient_length
    );
    Ok(descriptor)
}

/// Helper function to pull `TimeConverter.FrameRate` out of the BW5 settings JSON
fn read_experiment_frame_rate(file: &File) -> Result<f64> {
    let text = read_first_string(&file.dataset(EXPERIMENT_SETTINGS)?)?;
    let settings: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| BrwError::Metadata(format!("ExperimentSettings is not valid JSON: {}", e)))?;

    settings
        .get("TimeConverter")
        .and_then(|converter| converter.get("FrameRate"))
        .and_then(serde_json::Value::as_f64)
        .filter(|rate| *rate > 0.0)
        .ok_or_else(|| {
            BrwError::Metadata("ExperimentSettings has no positive TimeConverter.FrameRate".to_string())
        })
}

/// Reads the frame count, which is stored as float64 in headers and as int64
/// once an output container has been finalized.
pub(crate) fn read_frame_count(dataset: &Dataset) -> Result<u64> {
    let frames = match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::Float(_) => {
            let value = first_value(dataset.read_raw::<f64>()?, NREC_FRAMES)?;
            if !value.is_finite() || value < 0.0 {
                return Err(BrwError::Metadata(format!("frame count {} is invalid", value)));
            }
            value as u64
        }
        _ => {
            let value = first_value(dataset.read_raw::<i64>()?, NREC_FRAMES)?;
            u64::try_from(value)
                .map_err(|_| BrwError::Metadata(format!("frame count {} is negative", value)))?
        }
    };
    Ok(frames)
}

/// Reads and validates an electrode list dataset.
pub(crate) fn read_electrode_list(group: &Group, path: &str) -> Result<ElectrodeList> {
    let electrodes: ElectrodeList = group.dataset(path)?.read_raw()?;
    validate_electrodes(&electrodes, path)?;
    Ok(electrodes)
}

fn validate_electrodes(electrodes: &[Electrode], path: &str) -> Result<()> {
    if electrodes.len() > GRID_SIZE {
        return Err(BrwError::Metadata(format!(
            "{} lists {} electrodes, more than the {} on the array",
            path,
            electrodes.len(),
            GRID_SIZE
        )));
    }
    let mut seen = HashSet::with_capacity(electrodes.len());
    for electrode in electrodes {
        if !electrode.is_on_grid() {
            return Err(BrwError::Metadata(format!(
                "{} contains off-grid electrode {}",
                path, electrode
            )));
        }
        if !seen.insert(*electrode) {
            return Err(BrwError::Metadata(format!(
                "{} lists electrode {} twice",
                path, electrode
            )));
        }
    }
    Ok(())
}

/// Reads the first element of a one-element dataset.
pub(crate) fn read_first<T: hdf5::H5Type + Copy>(group: &Group, path: &str) -> Result<T> {
    if !path_exists(group, path) {
        return Err(BrwError::Metadata(format!("missing field {}", path)));
    }
    first_value(group.dataset(path)?.read_raw::<T>()?, path)
}

fn first_value<T: Copy>(values: Vec<T>, path: &str) -> Result<T> {
    values
        .first()
        .copied()
        .ok_or_else(|| BrwError::Metadata(format!("field {} is empty", path)))
}

/// Helper function to read the first string of a string dataset, accepting
/// both UTF-8 and ASCII variable-length strings
fn read_first_string(dataset: &Dataset) -> Result<String> {
    if let Ok(values) = dataset.read_raw::<VarLenUnicode>() {
        if let Some(value) = values.first() {
            return Ok(value.as_str().to_string());
        }
    }
    if let Ok(values) = dataset.read_raw::<VarLenAscii>() {
        if let Some(value) = values.first() {
            return Ok(value.as_str().to_string());
        }
    }
    // Fixed-length strings convert to any wider fixed length
    let values = dataset.read_raw::<FixedAscii<MAX_SETTINGS_LEN>>()?;
    values
        .first()
        .map(|value| value.as_str().to_string())
        .ok_or_else(|| BrwError::Metadata(format!("{} is empty", dataset.name())))
}

/// Reads a string attribute from the root of a container.
pub(crate) fn read_string_attr(file: &File, name: &str) -> Result<String> {
    let attr = file
        .attr(name)
        .map_err(|_| BrwError::Metadata(format!("missing attribute {}", name)))?;
    if let Ok(value) = attr.read_scalar::<VarLenUnicode>() {
        return Ok(value.as_str().to_string());
    }
    Ok(attr.read_scalar::<VarLenAscii>()?.as_str().to_string())
}

/// True if every component of `path` exists below `group`.
pub(crate) fn path_exists(group: &Group, path: &str) -> bool {
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(component);
        if !group.link_exists(&current) {
            return false;
        }
    }
    !current.is_empty()
}

// Helper function to log a recording summary
fn print_recording_summary(path: &Path, metadata: &RecordingMetadata, num_electrodes: usize) {
    info!(
        "Reading {} ({} {}): {} electrode{}, {} frames at {:.2} kS/s ({:.3} seconds)",
        path.display(),
        metadata.generation,
        metadata.encoding,
        num_electrodes,
        if num_electrodes != 1 { "s" } else { "" },
        metadata.frame_count,
        metadata.sampling_rate / 1000.0,
        metadata.duration_secs()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unrecognized_file_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.brw");
        {
            let file = File::create(&path).unwrap();
            file.create_group("Something").unwrap();
        }
        let file = File::open(&path).unwrap();
        assert!(matches!(identify(&file), Err(BrwError::Format(_))));
    }

    #[test]
    fn nested_paths_are_checked_component_wise() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested.brw");
        let file = File::create(&path).unwrap();
        file.create_group("3BRecInfo").unwrap();
        assert!(path_exists(&file, "3BRecInfo"));
        assert!(path_exists(&file, "/3BRecInfo"));
        assert!(!path_exists(&file, NREC_FRAMES));
        assert!(!path_exists(&file, ""));
    }

    #[test]
    fn missing_header_field_is_a_metadata_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.brw");
        let file = File::create(&path).unwrap();
        let vars = file.create_group("3BRecInfo").unwrap().create_group("3BRecVars").unwrap();
        vars.new_dataset_builder()
            .with_data(&[10.0f64][..])
            .create("NRecFrames")
            .unwrap();
        let chs = [Electrode::new(1, 1)];
        file.create_group("3BRecInfo/3BMeaStreams").unwrap();
        file.create_group("3BRecInfo/3BMeaStreams/Raw").unwrap();
        file.new_dataset_builder()
            .with_data(&chs[..])
            .create(RAW_CHS)
            .unwrap();

        assert_eq!(identify(&file).unwrap(), ContainerVariant::Bw4Raw);
        assert!(matches!(load_parameters(&file), Err(BrwError::Metadata(_))));
    }

    #[test]
    fn duplicate_electrodes_are_rejected() {
        let list = [Electrode::new(3, 4), Electrode::new(3, 4)];
        assert!(matches!(validate_electrodes(&list, RAW_CHS), Err(BrwError::Metadata(_))));
        let off_grid = [Electrode::new(0, 4)];
        assert!(matches!(validate_electrodes(&off_grid, RAW_CHS), Err(BrwError::Metadata(_))));
    }
}
