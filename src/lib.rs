pub mod channel_map;
pub mod config;
pub mod pipeline;
mod reader;
pub mod resample;
pub mod types;
pub mod wavelet;
pub mod writer;

use std::path::Path;

// Re-export types
pub use config::ExtractConfig;
pub use pipeline::{
    export_selection, run_batch, run_downsample, run_downsample_from, scan_folder, BatchReport,
    DownsampleSummary, ExtractionState, FileOutcome, RecordingSummary,
};
pub use reader::{identify, load_parameters};
pub use types::*;
pub use writer::{read_export_tag, ContainerWriter, FlattenOrder};

/// Opens a BRW recording and returns its metadata, electrode list and
/// stream layout.
///
/// # Examples
///
/// ```no_run
/// use brw_extract::open;
///
/// let result = open("path/to/your/recording.brw");
/// match result {
///     Ok(recording) => println!("Sampling rate: {} Hz", recording.metadata.sampling_rate),
///     Err(e) => println!("Error opening file: {}", e),
/// }
/// ```
pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Recording> {
    reader::open_recording(file_path)
}
