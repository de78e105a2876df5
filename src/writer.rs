//! Incremental writer for output containers.
//!
//! An output container goes through a fixed lifecycle:
//!
//! 1. [`ContainerWriter::create_empty`] writes the header attributes and
//!    placeholder recording variables.
//! 2. [`ContainerWriter::write_initial_block`] creates the resizable sample
//!    stream and finalizes the sampling rate and frame count.
//! 3. [`ContainerWriter::finalize`] closes the file.
//! 4. [`ContainerWriter::append_block`] reopens the file by path for every
//!    further block, grows the stream and rewrites the frame count.
//!
//! Because each append is self-contained, an interruption between two
//! appends leaves a valid container covering every block written so far.

use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, Group, H5Type, SimpleExtents};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::reader::{
    path_exists, read_electrode_list, read_first, read_frame_count, read_string_attr, BIT_DEPTH,
    BW4_RAW_DATA, DESCRIPTION_ATTR, END_TIME, MAX_VOLT, MIN_VOLT, NEW_SAMPLING, NREC_FRAMES,
    RAW_CHS, SAMPLING_RATE, SIGNAL_INVERSION, START_TIME, VERSION_ATTR,
};
use crate::types::*;

/// Default HDF5 chunk length of the sample stream (elements).
pub const DEFAULT_RAW_CHUNK_LEN: usize = 65_536;

/// How a `[channels × frames]` block is laid out in the flat sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenOrder {
    /// Frame by frame, every channel of a frame adjacent. This is the layout
    /// readers of the raw stream expect.
    Interleaved,
    /// Channel by channel: all frames of channel 0, then channel 1, ...
    Planar,
}

/// Flattens a sample block into stream order.
pub fn flatten_block(block: &SampleBlock, order: FlattenOrder) -> Vec<i16> {
    match order {
        FlattenOrder::Interleaved => block.t().iter().copied().collect(),
        FlattenOrder::Planar => block.iter().copied().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Created,
    Streaming,
}

/// Handle on an output container while it is first being written.
pub struct ContainerWriter {
    path: PathBuf,
    file: File,
    state: WriterState,
    channel_count: usize,
    raw_chunk_len: usize,
}

impl ContainerWriter {
    /// Creates a new container with header attributes and placeholder
    /// recording variables taken from `metadata`.
    ///
    /// # Arguments
    ///
    /// * `path` - Output file, truncated if it exists
    /// * `metadata` - Recording parameters to store
    /// * `electrodes` - Electrode list of the output stream
    pub fn create_empty<P: AsRef<Path>>(
        path: P,
        metadata: &RecordingMetadata,
        electrodes: &[Electrode],
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        write_string_attr(&file, DESCRIPTION_ATTR, metadata.generation.tag())?;
        write_string_attr(&file, VERSION_ATTR, metadata.encoding.tag())?;

        let rec_info = file.create_group("3BRecInfo")?;
        rec_info.create_group("3BRecVars")?;
        rec_info.create_group("3BMeaStreams")?.create_group("Raw")?;

        write_value(&file, SAMPLING_RATE, metadata.sampling_rate)?;
        write_value(&file, NREC_FRAMES, metadata.frame_count as f64)?;
        write_value(&file, SIGNAL_INVERSION, metadata.signal_inversion)?;
        write_value(&file, MAX_VOLT, metadata.max_uvolt)?;
        write_value(&file, MIN_VOLT, metadata.min_uvolt)?;
        write_value(&file, BIT_DEPTH, i32::from(metadata.bit_depth))?;
        file.new_dataset_builder()
            .with_data(electrodes)
            .create(RAW_CHS)?;

        debug!(
            "Created {} with {} electrode{}",
            path.display(),
            electrodes.len(),
            if electrodes.len() != 1 { "s" } else { "" }
        );

        Ok(ContainerWriter {
            path,
            file,
            state: WriterState::Created,
            channel_count: electrodes.len(),
            raw_chunk_len: DEFAULT_RAW_CHUNK_LEN,
        })
    }

    /// Sets the HDF5 chunk length used for the sample stream.
    pub fn with_chunk_len(mut self, raw_chunk_len: usize) -> Self {
        self.raw_chunk_len = raw_chunk_len.max(1);
        self
    }

    /// Writes the first block of samples and finalizes the sampling rate and
    /// frame count. Must be called exactly once, before any append.
    pub fn write_initial_block(
        &mut self,
        block: &SampleBlock,
        order: FlattenOrder,
        sampling_rate: f64,
    ) -> Result<()> {
        if self.state != WriterState::Created {
            return Err(BrwError::InvalidState(format!(
                "initial block already written to {}",
                self.path.display()
            )));
        }
        check_channel_count(block, self.channel_count, &self.path)?;

        let flat = flatten_block(block, order);
        let dataset = self
            .file
            .create_group("3BData")?
            .new_dataset::<i16>()
            .shape(SimpleExtents::resizable([flat.len()]))
            .chunk(self.raw_chunk_len)
            .create("Raw")?;
        if !flat.is_empty() {
            dataset.write_slice(&flat[..], 0..flat.len())?;
        }

        replace_value(&self.file, SAMPLING_RATE, sampling_rate)?;
        replace_value(&self.file, NREC_FRAMES, block.ncols() as i64)?;
        self.state = WriterState::Streaming;

        debug!(
            "Wrote initial block of {} frames to {}",
            block.ncols(),
            self.path.display()
        );
        Ok(())
    }

    /// Stores the selection-export parameters consumed by the downsample stage.
    pub fn write_export_tag(&mut self, target_rate: f64, start_sec: f64, end_sec: f64) -> Result<()> {
        replace_value(&self.file, NEW_SAMPLING, target_rate)?;
        replace_value(&self.file, START_TIME, start_sec)?;
        replace_value(&self.file, END_TIME, end_sec)?;
        Ok(())
    }

    /// Closes the container. No further writes go through this handle.
    pub fn finalize(self) -> Result<()> {
        let path = self.path;
        self.file.close()?;
        debug!("Closed {}", path.display());
        Ok(())
    }

    /// Appends a block to a container whose initial block has been written.
    ///
    /// Reopens the file, grows the sample stream by the flattened block,
    /// rewrites the frame count to `cumulative_frames` and closes the file.
    /// `cumulative_frames` has to match the frames physically present after
    /// the append.
    pub fn append_block<P: AsRef<Path>>(
        path: P,
        cumulative_frames: u64,
        block: &SampleBlock,
        order: FlattenOrder,
    ) -> Result<()> {
        let path = path.as_ref();
        let file = File::open_rw(path)?;

        if !path_exists(&file, BW4_RAW_DATA) {
            return Err(BrwError::InvalidState(format!(
                "{} has no sample stream yet; write the initial block first",
                path.display()
            )));
        }
        let channel_count = file.dataset(RAW_CHS)?.size();
        check_channel_count(block, channel_count, path)?;

        let dataset = file.dataset(BW4_RAW_DATA)?;
        let old_len = dataset.size();
        let flat = flatten_block(block, order);
        let new_len = old_len + flat.len();

        let frames_present = if channel_count == 0 {
            0
        } else {
            (new_len / channel_count) as u64
        };
        if frames_present != cumulative_frames {
            return Err(BrwError::InvalidState(format!(
                "frame count {} does not match the {} frames stored in {}",
                cumulative_frames,
                frames_present,
                path.display()
            )));
        }

        grow_stream(&dataset, old_len, &flat)?;
        replace_value(&file, NREC_FRAMES, cumulative_frames as i64)?;
        file.close()?;

        debug!(
            "Appended {} frames to {} ({} total)",
            block.ncols(),
            path.display(),
            cumulative_frames
        );
        Ok(())
    }
}

/// Reads the selection parameters back out of an `_exportCh` container.
pub fn read_export_tag<P: AsRef<Path>>(path: P) -> Result<ExportTag> {
    let file = File::open(path.as_ref())?;

    let description = read_string_attr(&file, DESCRIPTION_ATTR)?;
    let version = read_string_attr(&file, VERSION_ATTR)?;
    let source_generation = Generation::from_tag(&description)
        .ok_or_else(|| BrwError::Metadata(format!("unknown generation tag '{}'", description)))?;
    let source_encoding = Encoding::from_tag(&version)
        .ok_or_else(|| BrwError::Metadata(format!("unknown encoding tag '{}'", version)))?;

    Ok(ExportTag {
        source_generation,
        source_encoding,
        sampling_rate: read_first::<f64>(&file, SAMPLING_RATE)?,
        frame_count: read_frame_count(&file.dataset(NREC_FRAMES)?)?,
        target_rate: read_first::<f64>(&file, NEW_SAMPLING)?,
        start_sec: read_first::<f64>(&file, START_TIME)?,
        end_sec: read_first::<f64>(&file, END_TIME)?,
        electrodes: read_electrode_list(&file, RAW_CHS)?,
    })
}

// Helper function to make sure a block matches the container's electrode list
fn check_channel_count(block: &SampleBlock, expected: usize, path: &Path) -> Result<()> {
    if block.nrows() != expected {
        return Err(BrwError::InvalidState(format!(
            "block has {} channels but {} lists {} electrodes",
            block.nrows(),
            path.display(),
            expected
        )));
    }
    Ok(())
}

// Helper function to resize the stream and write the new tail
fn grow_stream(dataset: &Dataset, old_len: usize, flat: &[i16]) -> Result<()> {
    if flat.is_empty() {
        return Ok(());
    }
    let new_len = old_len + flat.len();
    dataset.resize(new_len)?;
    dataset.write_slice(flat, old_len..new_len)?;
    Ok(())
}

// Helper function to write a one-element dataset
fn write_value<T: H5Type + Copy>(group: &Group, path: &str, value: T) -> Result<()> {
    group
        .new_dataset_builder()
        .with_data(&[value][..])
        .create(path)?;
    Ok(())
}

// Helper function to replace a one-element dataset, possibly changing its type
fn replace_value<T: H5Type + Copy>(group: &Group, path: &str, value: T) -> Result<()> {
    if path_exists(group, path) {
        group.unlink(path)?;
    }
    write_value(group, path, value)
}

// Helper function to write a scalar string attribute
fn write_string_attr(file: &File, name: &str, value: &str) -> Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|e| BrwError::Metadata(format!("cannot store '{}' as {}: {}", value, name, e)))?;
    file.new_attr::<VarLenUnicode>()
        .shape(())
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn interleaved_flatten_is_frame_major() {
        let block: SampleBlock = array![[1, 2, 3], [10, 20, 30]];
        assert_eq!(
            flatten_block(&block, FlattenOrder::Interleaved),
            vec![1, 10, 2, 20, 3, 30]
        );
    }

    #[test]
    fn planar_flatten_is_channel_major() {
        let block: SampleBlock = array![[1, 2, 3], [10, 20, 30]];
        assert_eq!(
            flatten_block(&block, FlattenOrder::Planar),
            vec![1, 2, 3, 10, 20, 30]
        );
    }
}
