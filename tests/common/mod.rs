//! Synthetic BRW containers for integration tests.
#![allow(dead_code)]

use brw_extract::Electrode;
use hdf5::types::VarLenUnicode;
use hdf5::{File, Group, H5Type};
use std::path::Path;

pub const BW4_RECORDING_CHANNELS: [Electrode; 2] = [Electrode::new(1, 1), Electrode::new(1, 2)];

fn write_value<T: H5Type + Copy>(group: &Group, path: &str, value: T) {
    group
        .new_dataset_builder()
        .with_data(&[value][..])
        .create(path)
        .unwrap();
}

fn write_bw4_header(file: &File, frames: u64, sampling_rate: f64, chs_group: &str, electrodes: &[Electrode]) {
    let vars = file
        .create_group("3BRecInfo")
        .unwrap()
        .create_group("3BRecVars")
        .unwrap();
    write_value(&vars, "NRecFrames", frames as f64);
    write_value(&vars, "SamplingRate", sampling_rate);
    write_value(&vars, "SignalInversion", 1i32);
    write_value(&vars, "MaxVolt", 4125i32);
    write_value(&vars, "MinVolt", -4125i32);
    write_value(&vars, "BitDepth", 12i32);

    file.create_group("3BRecInfo/3BMeaStreams").unwrap();
    file.create_group(&format!("3BRecInfo/3BMeaStreams/{}", chs_group))
        .unwrap();
    file.new_dataset_builder()
        .with_data(electrodes)
        .create(format!("3BRecInfo/3BMeaStreams/{}/Chs", chs_group).as_str())
        .unwrap();
}

/// BW4-RAW recording; `channels[c][f]` is sample `f` of electrode `c`.
pub fn write_bw4_raw(path: &Path, sampling_rate: f64, electrodes: &[Electrode], channels: &[Vec<i16>]) {
    let frames = channels.first().map_or(0, Vec::len);
    let file = File::create(path).unwrap();
    write_bw4_header(&file, frames as u64, sampling_rate, "Raw", electrodes);

    let mut interleaved = Vec::with_capacity(frames * channels.len());
    for frame in 0..frames {
        for channel in channels {
            interleaved.push(channel[frame]);
        }
    }
    file.create_group("3BData").unwrap();
    file.new_dataset_builder()
        .with_data(&interleaved[..])
        .create("3BData/Raw")
        .unwrap();
}

/// The 2-electrode, 10-frame, 1 kHz recording used by the end-to-end tests.
pub fn write_small_bw4_raw(path: &Path) {
    let first: Vec<i16> = (0..10).map(|i| 100 + i).collect();
    let second = vec![-50i16; 10];
    write_bw4_raw(path, 1000.0, &BW4_RECORDING_CHANNELS, &[first, second]);
}

fn write_experiment_settings(file: &File, sampling_rate: f64) {
    let json = format!(
        r#"{{"TimeConverter":{{"FrameRate":{}}},"MeaPlate":{{"Name":"test"}}}}"#,
        sampling_rate
    );
    let value: VarLenUnicode = json.parse().unwrap();
    file.new_dataset_builder()
        .with_data(&[value][..])
        .create("ExperimentSettings")
        .unwrap();
}

/// BW5-RAW recording with every electrode set to `value(frame, grid_index)`.
pub fn write_bw5_raw(path: &Path, sampling_rate: f64, frames: usize, value: impl Fn(usize, usize) -> i16) {
    let file = File::create(path).unwrap();
    write_experiment_settings(&file, sampling_rate);

    let mut samples = Vec::with_capacity(frames * 4096);
    for frame in 0..frames {
        for index in 0..4096 {
            samples.push(value(frame, index));
        }
    }
    file.create_group("Well_A1").unwrap();
    file.new_dataset_builder()
        .with_data(&samples[..])
        .create("Well_A1/Raw")
        .unwrap();
}

/// Coefficient stream in which every channel reconstructs to a constant.
///
/// Each chunk carries `approx = value * sqrt(2)^level` and zero detail.
pub fn constant_coefficients(values: &[f64], level: u32, frames_chunk: usize, chunks: usize) -> Vec<f64> {
    let coefs_chunk = frames_chunk.div_ceil(1 << level) * 2;
    let half = coefs_chunk / 2;
    let gain = std::f64::consts::SQRT_2.powi(level as i32);
    let mut stream = Vec::with_capacity(coefs_chunk * values.len() * chunks);
    for _ in 0..chunks {
        for value in values {
            stream.extend(std::iter::repeat(value * gain).take(half));
            stream.extend(std::iter::repeat(0.0).take(coefs_chunk - half));
        }
    }
    stream
}

fn write_coefficients(group: &Group, name: &str, coefficients: &[f64], level: u32, frames_chunk: usize) {
    let dataset = group
        .new_dataset_builder()
        .with_data(coefficients)
        .create(name)
        .unwrap();
    dataset
        .new_attr::<i64>()
        .shape(())
        .create("CompressionLevel")
        .unwrap()
        .write_scalar(&i64::from(level))
        .unwrap();
    dataset
        .new_attr::<i64>()
        .shape(())
        .create("DataChunkLength")
        .unwrap()
        .write_scalar(&(frames_chunk as i64))
        .unwrap();
}

/// BW5-WAV recording storing the channels at the given flat grid indices.
pub fn write_bw5_wav(
    path: &Path,
    sampling_rate: f64,
    stored: &[i64],
    coefficients: &[f64],
    level: u32,
    frames_chunk: usize,
) {
    let file = File::create(path).unwrap();
    write_experiment_settings(&file, sampling_rate);
    let well = file.create_group("Well_A1").unwrap();
    well.new_dataset_builder()
        .with_data(stored)
        .create("StoredChIdxs")
        .unwrap();
    write_coefficients(&well, "WaveletBasedEncodedRaw", coefficients, level, frames_chunk);
}

/// BW4-WAV recording; the frame count in the header is taken as given.
pub fn write_bw4_wav(
    path: &Path,
    sampling_rate: f64,
    frames: u64,
    electrodes: &[Electrode],
    coefficients: &[f64],
    level: u32,
    frames_chunk: usize,
) {
    let file = File::create(path).unwrap();
    write_bw4_header(&file, frames, sampling_rate, "WaveletCoefficients", electrodes);
    let data = file.create_group("3BData").unwrap();
    write_coefficients(&data, "WaveletBasedEncodedRaw", coefficients, level, frames_chunk);
}

/// Reads the interleaved output stream back as `[channel][frame]`.
pub fn read_output_channels(path: &Path) -> Vec<Vec<i16>> {
    let file = File::open(path).unwrap();
    let channels = file.dataset("3BRecInfo/3BMeaStreams/Raw/Chs").unwrap().size();
    let samples: Vec<i16> = file.dataset("3BData/Raw").unwrap().read_raw().unwrap();
    let frames = if channels == 0 { 0 } else { samples.len() / channels };
    (0..channels)
        .map(|c| (0..frames).map(|f| samples[f * channels + c]).collect())
        .collect()
}
