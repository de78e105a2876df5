mod common;

use brw_extract::{
    open, read_export_tag, BrwError, ContainerWriter, Electrode, Encoding, FlattenOrder,
    Generation, RecordingMetadata, SampleBlock,
};
use common::read_output_channels;
use ndarray::Array2;
use tempfile::tempdir;

fn metadata() -> RecordingMetadata {
    RecordingMetadata {
        generation: Generation::Bw4,
        encoding: Encoding::Raw,
        sampling_rate: 7022.0,
        frame_count: 1234,
        signal_inversion: -1,
        min_uvolt: -2000,
        max_uvolt: 3000,
        bit_depth: 8,
    }
}

fn electrodes() -> Vec<Electrode> {
    vec![Electrode::new(2, 7), Electrode::new(10, 1), Electrode::new(64, 64)]
}

/// `[3 × frames]` block whose sample at (c, f) is `offset + 100 * c + f`.
fn block(frames: usize, offset: i16) -> SampleBlock {
    Array2::from_shape_fn((3, frames), |(c, f)| offset + 100 * c as i16 + f as i16)
}

#[test]
fn header_round_trips_after_create() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("out.brw");
    let writer = ContainerWriter::create_empty(&path, &metadata(), &electrodes()).unwrap();
    writer.finalize().unwrap();

    let recording = open(&path).unwrap();
    assert_eq!(recording.metadata, metadata());
    assert_eq!(recording.electrodes, electrodes());
}

#[test]
fn frame_count_tracks_initial_and_appended_blocks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("out.brw");
    let mut writer = ContainerWriter::create_empty(&path, &metadata(), &electrodes())
        .unwrap()
        .with_chunk_len(4);
    writer
        .write_initial_block(&block(5, 0), FlattenOrder::Interleaved, 500.0)
        .unwrap();
    writer.finalize().unwrap();

    ContainerWriter::append_block(&path, 8, &block(3, 1000), FlattenOrder::Interleaved).unwrap();
    ContainerWriter::append_block(&path, 12, &block(4, 2000), FlattenOrder::Interleaved).unwrap();

    let recording = open(&path).unwrap();
    assert_eq!(recording.metadata.frame_count, 12);
    assert_eq!(recording.metadata.sampling_rate, 500.0);

    let channels = read_output_channels(&path);
    assert_eq!(channels.len(), 3);
    assert_eq!(channels[1][..5], [100, 101, 102, 103, 104]);
    assert_eq!(channels[1][5..8], [1100, 1101, 1102]);
    assert_eq!(channels[2][8..], [2200, 2201, 2202, 2203]);
}

#[test]
fn planar_blocks_are_written_channel_by_channel() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("planar.brw");
    let mut writer = ContainerWriter::create_empty(&path, &metadata(), &electrodes()).unwrap();
    writer
        .write_initial_block(&block(2, 0), FlattenOrder::Planar, 500.0)
        .unwrap();
    writer.finalize().unwrap();

    let file = hdf5::File::open(&path).unwrap();
    let raw: Vec<i16> = file.dataset("3BData/Raw").unwrap().read_raw().unwrap();
    assert_eq!(raw, vec![0, 1, 100, 101, 200, 201]);
}

#[test]
fn second_initial_block_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("out.brw");
    let mut writer = ContainerWriter::create_empty(&path, &metadata(), &electrodes()).unwrap();
    writer
        .write_initial_block(&block(2, 0), FlattenOrder::Interleaved, 500.0)
        .unwrap();
    let err = writer
        .write_initial_block(&block(2, 0), FlattenOrder::Interleaved, 500.0)
        .unwrap_err();
    assert!(matches!(err, BrwError::InvalidState(_)));
}

#[test]
fn append_requires_an_initial_block_and_a_matching_count() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("out.brw");
    let writer = ContainerWriter::create_empty(&path, &metadata(), &electrodes()).unwrap();
    writer.finalize().unwrap();

    let err = ContainerWriter::append_block(&path, 2, &block(2, 0), FlattenOrder::Interleaved)
        .unwrap_err();
    assert!(matches!(err, BrwError::InvalidState(_)));

    let mut writer = ContainerWriter::create_empty(&path, &metadata(), &electrodes()).unwrap();
    writer
        .write_initial_block(&block(2, 0), FlattenOrder::Interleaved, 500.0)
        .unwrap();
    writer.finalize().unwrap();

    let err = ContainerWriter::append_block(&path, 3, &block(2, 0), FlattenOrder::Interleaved)
        .unwrap_err();
    assert!(matches!(err, BrwError::InvalidState(_)));
    assert_eq!(open(&path).unwrap().metadata.frame_count, 2);
}

#[test]
fn failed_append_keeps_the_blocks_already_written() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("out.brw");
    let mut writer = ContainerWriter::create_empty(&path, &metadata(), &electrodes())
        .unwrap()
        .with_chunk_len(4);
    writer
        .write_initial_block(&block(5, 0), FlattenOrder::Interleaved, 500.0)
        .unwrap();
    writer.finalize().unwrap();
    ContainerWriter::append_block(&path, 8, &block(3, 1000), FlattenOrder::Interleaved).unwrap();

    // HDF5 refuses a read-write open while the file is held read-only
    let reader = hdf5::File::open(&path).unwrap();
    let err = ContainerWriter::append_block(&path, 12, &block(4, 2000), FlattenOrder::Interleaved)
        .unwrap_err();
    assert!(err.is_io(), "unexpected error {:?}", err);
    drop(reader);

    assert!(path.exists());
    let recording = open(&path).unwrap();
    assert_eq!(recording.metadata.frame_count, 8);
    let channels = read_output_channels(&path);
    assert_eq!(channels[0].len(), 8);
    assert_eq!(channels[0][5..], [1000, 1001, 1002]);

    // The container is still appendable once the file is released
    ContainerWriter::append_block(&path, 12, &block(4, 2000), FlattenOrder::Interleaved).unwrap();
    assert_eq!(open(&path).unwrap().metadata.frame_count, 12);
}

#[test]
fn export_tag_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tag_exportCh.brw");
    let mut source = metadata();
    source.generation = Generation::Bw5;
    source.encoding = Encoding::Wav;

    let mut writer = ContainerWriter::create_empty(&path, &source, &electrodes()).unwrap();
    writer.write_export_tag(250.0, 1.5, 4.0).unwrap();
    writer.finalize().unwrap();

    let tag = read_export_tag(&path).unwrap();
    assert_eq!(tag.source_generation, Generation::Bw5);
    assert_eq!(tag.source_encoding, Encoding::Wav);
    assert_eq!(tag.sampling_rate, 7022.0);
    assert_eq!(tag.frame_count, 1234);
    assert_eq!(tag.target_rate, 250.0);
    assert_eq!(tag.start_sec, 1.5);
    assert_eq!(tag.end_sec, 4.0);
    assert_eq!(tag.electrodes, electrodes());
}

#[test]
fn unwritable_path_is_an_io_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing").join("out.brw");
    let err = ContainerWriter::create_empty(&path, &metadata(), &electrodes())
        .err()
        .unwrap();
    assert!(err.is_io());
}
