use hdf5::H5Type;
use ndarray::Array2;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Number of electrodes along each side of the array.
pub const GRID_SIDE: i16 = 64;

/// Total number of electrodes on the array (64 × 64).
pub const GRID_SIZE: usize = 4096;

/// Container generation.
///
/// BW4 files carry their recording variables as explicit datasets under
/// `/3BRecInfo`, BW5 files store a JSON `ExperimentSettings` blob and keep the
/// streams under `Well_A1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Generation {
    Bw4,
    Bw5,
}

impl Generation {
    /// Tag written to the `Description` attribute of output containers.
    pub fn tag(self) -> &'static str {
        match self {
            Generation::Bw4 => "BW4",
            Generation::Bw5 => "BW5",
        }
    }

    /// Parses a tag case-insensitively.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "BW4" => Some(Generation::Bw4),
            "BW5" => Some(Generation::Bw5),
            _ => None,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Payload encoding of the sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Encoding {
    /// Uncompressed interleaved int16 samples
    Raw,
    /// Wavelet-compressed coefficients
    Wav,
}

impl Encoding {
    /// Tag written to the `Version` attribute of output containers.
    pub fn tag(self) -> &'static str {
        match self {
            Encoding::Raw => "RAW",
            Encoding::Wav => "WAV",
        }
    }

    /// Parses a tag case-insensitively.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "RAW" => Some(Encoding::Raw),
            "WAV" => Some(Encoding::Wav),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One of the four container variants ({BW4, BW5} × {RAW, WAV}).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerVariant {
    Bw4Raw,
    Bw4Wav,
    Bw5Raw,
    Bw5Wav,
}

impl ContainerVariant {
    pub fn new(generation: Generation, encoding: Encoding) -> Self {
        match (generation, encoding) {
            (Generation::Bw4, Encoding::Raw) => ContainerVariant::Bw4Raw,
            (Generation::Bw4, Encoding::Wav) => ContainerVariant::Bw4Wav,
            (Generation::Bw5, Encoding::Raw) => ContainerVariant::Bw5Raw,
            (Generation::Bw5, Encoding::Wav) => ContainerVariant::Bw5Wav,
        }
    }

    pub fn generation(self) -> Generation {
        match self {
            ContainerVariant::Bw4Raw | ContainerVariant::Bw4Wav => Generation::Bw4,
            ContainerVariant::Bw5Raw | ContainerVariant::Bw5Wav => Generation::Bw5,
        }
    }

    pub fn encoding(self) -> Encoding {
        match self {
            ContainerVariant::Bw4Raw | ContainerVariant::Bw5Raw => Encoding::Raw,
            ContainerVariant::Bw4Wav | ContainerVariant::Bw5Wav => Encoding::Wav,
        }
    }
}

impl fmt::Display for ContainerVariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.generation(), self.encoding())
    }
}

/// Recording parameters shared by every container variant.
///
/// For BW4 files these come straight from the header datasets. BW5 files
/// only store the frame rate, so the voltage range, bit depth and signal
/// inversion are filled in with the fixed hardware constants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingMetadata {
    /// Container generation
    pub generation: Generation,
    /// Payload encoding
    pub encoding: Encoding,
    /// Sampling rate (Hz)
    pub sampling_rate: f64,
    /// Number of frames (one frame = one sample on every recorded electrode)
    pub frame_count: u64,
    /// Signal inversion, either 1 or -1 depending on the acquisition version
    pub signal_inversion: i32,
    /// Lower bound of the digitized range (μV)
    pub min_uvolt: i32,
    /// Upper bound of the digitized range (μV)
    pub max_uvolt: i32,
    /// Number of bits used out of the 16-bit sample word
    pub bit_depth: u8,
}

impl RecordingMetadata {
    /// Variant this metadata was read from.
    pub fn variant(&self) -> ContainerVariant {
        ContainerVariant::new(self.generation, self.encoding)
    }

    /// Number of distinct digital codes, `2^bit_depth`, saturating at
    /// `u64::MAX`.
    pub fn quantization_level(&self) -> u64 {
        2u64.checked_pow(u32::from(self.bit_depth)).unwrap_or(u64::MAX)
    }

    /// Microvolts represented by one quantization step.
    pub fn quant_to_volt_factor(&self) -> f64 {
        let range = i64::from(self.max_uvolt) - i64::from(self.min_uvolt);
        range as f64 / self.quantization_level() as f64
    }

    /// Returns `(counts_to_microvolts, microvolt_offset)` for converting raw
    /// codes to voltages with the recording's signal inversion applied.
    pub fn digital_to_analog(&self) -> (f64, f64) {
        let inversion = f64::from(self.signal_inversion);
        (
            inversion * self.quant_to_volt_factor(),
            inversion * f64::from(self.min_uvolt),
        )
    }

    /// Converts one raw sample code to microvolts.
    pub fn to_microvolts(&self, code: i16) -> f64 {
        let (scale, offset) = self.digital_to_analog();
        f64::from(code) * scale + offset
    }

    /// Recording duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sampling_rate > 0.0 {
            self.frame_count as f64 / self.sampling_rate
        } else {
            0.0
        }
    }
}

/// One electrode of the array, addressed by 1-based (row, col).
///
/// The in-file representation is the `{Row: int16, Col: int16}` compound used
/// by the `Chs` datasets. Ordering is by row, then column, which is the
/// canonical order.
#[derive(H5Type, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(C)]
pub struct Electrode {
    #[hdf5(rename = "Row")]
    pub row: i16,
    #[hdf5(rename = "Col")]
    pub col: i16,
}

impl Electrode {
    pub const fn new(row: i16, col: i16) -> Self {
        Electrode { row, col }
    }

    /// True when both coordinates lie on the 64 × 64 grid.
    pub fn is_on_grid(&self) -> bool {
        (1..=GRID_SIDE).contains(&self.row) && (1..=GRID_SIDE).contains(&self.col)
    }
}

impl fmt::Display for Electrode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Electrodes in container-declared order.
pub type ElectrodeList = Vec<Electrode>;

/// Parameters of a wavelet-compressed coefficient stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaveletStreamDescriptor {
    /// Number of inverse transform passes needed to restore native resolution
    pub compression_level: u32,
    /// Frames covered by one chunk before compression
    pub frames_chunk_length: usize,
    /// Coefficients per chunk per channel
    pub coefs_chunk_length: usize,
    /// Number of channels multiplexed in the stream
    pub channel_count: usize,
    /// Total length of the coefficient stream
    pub total_coefficient_length: usize,
}

/// Layout of an uncompressed, frame-interleaved sample stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawLayout {
    /// HDF5 path of the int16 sample dataset
    pub dataset: String,
    /// Samples stored per frame (the length of the source electrode list)
    pub channels_per_frame: usize,
}

/// Layout of a wavelet coefficient stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaveletLayout {
    /// HDF5 path of the coefficient dataset
    pub dataset: String,
    pub descriptor: WaveletStreamDescriptor,
}

/// Per-variant payload location, one arm per container variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SourceLayout {
    Bw4Raw(RawLayout),
    Bw4Wav(WaveletLayout),
    Bw5Raw(RawLayout),
    Bw5Wav(WaveletLayout),
}

impl SourceLayout {
    pub fn variant(&self) -> ContainerVariant {
        match self {
            SourceLayout::Bw4Raw(_) => ContainerVariant::Bw4Raw,
            SourceLayout::Bw4Wav(_) => ContainerVariant::Bw4Wav,
            SourceLayout::Bw5Raw(_) => ContainerVariant::Bw5Raw,
            SourceLayout::Bw5Wav(_) => ContainerVariant::Bw5Wav,
        }
    }
}

/// Everything known about a source recording after opening it.
///
/// # Examples
///
/// ```no_run
/// use brw_extract::open;
///
/// let recording = open("path/to/recording.brw").unwrap();
/// println!("{} at {} Hz", recording.layout.variant(), recording.metadata.sampling_rate);
/// println!("Recording duration: {:.2} seconds", recording.metadata.duration_secs());
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Recording {
    /// Path the recording was opened from
    pub path: PathBuf,
    /// Header values
    pub metadata: RecordingMetadata,
    /// Recorded electrodes in container order
    pub electrodes: ElectrodeList,
    /// Where and how the samples are stored
    pub layout: SourceLayout,
}

/// Transient `[channels × frames]` buffer of samples.
pub type SampleBlock = Array2<i16>;

/// Metadata carried by a `_exportCh` selection container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportTag {
    /// Generation of the recording the selection was made on
    pub source_generation: Generation,
    /// Encoding of the recording the selection was made on
    pub source_encoding: Encoding,
    /// Native sampling rate of the source (Hz)
    pub sampling_rate: f64,
    /// Native frame count of the source
    pub frame_count: u64,
    /// Requested output rate for the downsample stage (Hz)
    pub target_rate: f64,
    /// Start of the requested window (s)
    pub start_sec: f64,
    /// End of the requested window (s)
    pub end_sec: f64,
    /// Selected electrodes in canonical order
    pub electrodes: ElectrodeList,
}

/// Error type for every operation in the crate.
///
/// Format, metadata and channel-mismatch errors abort the file being
/// processed; batch drivers report them and move on to the next file.
#[derive(Error, Debug)]
pub enum BrwError {
    /// Unrecognized container signature or inconsistent chunk arithmetic
    #[error("format error: {0}")]
    Format(String),

    /// Expected header field missing or malformed
    #[error("metadata error: {0}")]
    Metadata(String),

    /// A selected electrode is not recorded in the source
    #[error("electrode {electrode} is not present in {source_name}")]
    ChannelMismatch {
        electrode: Electrode,
        source_name: String,
    },

    /// Invalid resampling request
    #[error("resample error: {0}")]
    Resample(String),

    /// Export tag no longer matches the live source recording
    #[error("export {export} does not match its source: {reason}")]
    StaleExport { export: PathBuf, reason: String },

    /// Writer used out of its lifecycle order
    #[error("invalid writer state: {0}")]
    InvalidState(String),

    /// File system failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HDF5 storage failure
    #[error("storage error: {0}")]
    Storage(#[from] hdf5::Error),
}

impl BrwError {
    /// True for underlying storage failures (file system or HDF5).
    pub fn is_io(&self) -> bool {
        matches!(self, BrwError::Io(_) | BrwError::Storage(_))
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, BrwError>;
