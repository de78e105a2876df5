//! Reconstruction of wavelet-compressed channels.
//!
//! A compressed stream stores, for every chunk period, one block of
//! `coefs_chunk_length` coefficients per channel, channels back to back:
//!
//! ```text
//! | ch0 chunk0 | ch1 chunk0 | ... | chN chunk0 | ch0 chunk1 | ch1 chunk1 | ...
//! ```
//!
//! Each block holds the approximation coefficients followed by the detail
//! coefficients of one level of a sym7 periodized DWT. Further levels were
//! encoded as approximation only.

use std::path::{Path, PathBuf};

use crate::types::{BrwError, Result, WaveletStreamDescriptor};

/// Low-pass decomposition filter of the sym7 wavelet.
const SYM7_DEC_LO: [f64; 14] = [
    0.002681814568257878,
    -0.0010473848886829163,
    -0.01263630340325193,
    0.03051551316596357,
    0.0678926935013727,
    -0.049552834937127255,
    0.017441255086855827,
    0.5361019170917628,
    0.767764317003164,
    0.2886296317515146,
    -0.14004724044296152,
    -0.10780823770381774,
    0.004010244871533663,
    0.010268176708511255,
];

/// Left rotation applied to both coefficient halves before reconstruction.
/// Compensates a fixed offset introduced by the acquisition-side encoder.
const COEFFICIENT_ROTATION: usize = 5;

/// Samples dropped from each end of a reconstructed chunk.
const BOUNDARY_TRIM: usize = 2;

impl WaveletStreamDescriptor {
    /// Builds a descriptor, deriving the per-chunk coefficient length as
    /// `ceil(frames_chunk_length / 2^compression_level) * 2`.
    pub fn new(
        compression_level: u32,
        frames_chunk_length: usize,
        channel_count: usize,
        total_coefficient_length: usize,
    ) -> Self {
        let divisor = 1usize << compression_level;
        let coefs_chunk_length = frames_chunk_length.div_ceil(divisor) * 2;
        WaveletStreamDescriptor {
            compression_level,
            frames_chunk_length,
            coefs_chunk_length,
            channel_count,
            total_coefficient_length,
        }
    }

    /// Distance between two consecutive chunks of the same channel.
    pub fn chunk_stride(&self) -> usize {
        self.coefs_chunk_length * self.channel_count
    }

    /// Number of chunks each channel owns.
    ///
    /// Walking the stream in steps of [`chunk_stride`](Self::chunk_stride)
    /// has to land exactly on the end of the stream; anything else means the
    /// descriptor and the stream disagree.
    pub fn chunks_per_channel(&self) -> Result<usize> {
        if self.compression_level == 0 {
            return Err(BrwError::Format(
                "compression level must be at least 1".to_string(),
            ));
        }
        let stride = self.chunk_stride();
        if stride == 0 {
            return Err(BrwError::Format(format!(
                "chunk walk cannot advance (chunk length {}, {} channels)",
                self.coefs_chunk_length, self.channel_count
            )));
        }
        if self.total_coefficient_length % stride != 0 {
            return Err(BrwError::Format(format!(
                "coefficient stream of length {} ends in a partial chunk row \
                 ({} coefficients past the last complete {}-coefficient row); \
                 truncated recordings are not decoded",
                self.total_coefficient_length,
                self.total_coefficient_length % stride,
                stride
            )));
        }
        Ok(self.total_coefficient_length / stride)
    }

    /// Frames restored from one chunk before boundary trimming.
    pub fn frames_per_chunk(&self) -> usize {
        (self.coefs_chunk_length / 2) << self.compression_level
    }

    /// Frame count of the recording according to the chunk walk.
    pub fn frame_count(&self) -> Result<u64> {
        Ok((self.chunks_per_channel()? * self.frames_per_chunk()) as u64)
    }

    /// Samples kept from one chunk once both boundaries are trimmed.
    pub fn samples_per_chunk(&self) -> usize {
        self.frames_per_chunk().saturating_sub(2 * BOUNDARY_TRIM)
    }

    /// Number of reconstructed samples that come from native frames before
    /// `frame`.
    ///
    /// Reconstruction drops the first and last [`BOUNDARY_TRIM`] frames of
    /// every chunk, so sample `i` of a reconstructed channel is not native
    /// frame `i`. Slicing a reconstructed channel with
    /// `samples_before_frame(start)..samples_before_frame(end)` keeps exactly
    /// the samples whose native frame lies in `start..end`.
    pub fn samples_before_frame(&self, frame: u64) -> usize {
        let frames_per_chunk = self.frames_per_chunk() as u64;
        let kept = self.samples_per_chunk() as u64;
        if frames_per_chunk == 0 || kept == 0 {
            return 0;
        }
        let whole_chunks = frame / frames_per_chunk;
        let into_chunk = (frame % frames_per_chunk)
            .saturating_sub(BOUNDARY_TRIM as u64)
            .min(kept);
        (whole_chunks * kept + into_chunk) as usize
    }

    /// Offsets of every chunk belonging to `channel`.
    pub fn chunk_offsets(&self, channel: usize) -> Result<impl Iterator<Item = usize>> {
        if channel >= self.channel_count {
            return Err(BrwError::Format(format!(
                "channel {} is outside a stream of {} channels",
                channel, self.channel_count
            )));
        }
        let chunks = self.chunks_per_channel()?;
        let first = channel * self.coefs_chunk_length;
        let stride = self.chunk_stride();
        Ok((0..chunks).map(move |k| first + k * stride))
    }
}

/// Random access to a coefficient stream.
pub trait CoefficientSource {
    /// Reads `len` coefficients starting at `offset`.
    fn read_coefficients(&self, offset: usize, len: usize) -> Result<Vec<f64>>;
}

impl CoefficientSource for [f64] {
    fn read_coefficients(&self, offset: usize, len: usize) -> Result<Vec<f64>> {
        self.get(offset..offset + len)
            .map(<[f64]>::to_vec)
            .ok_or_else(|| {
                BrwError::Format(format!(
                    "coefficient range {}..{} is past the end of the stream ({})",
                    offset,
                    offset + len,
                    self.len()
                ))
            })
    }
}

impl CoefficientSource for Vec<f64> {
    fn read_coefficients(&self, offset: usize, len: usize) -> Result<Vec<f64>> {
        self.as_slice().read_coefficients(offset, len)
    }
}

/// Coefficient dataset inside a container file.
///
/// Every instance opens its own read-only handle, so reconstruction tasks
/// running on different worker threads never share one.
pub struct Hdf5CoefficientStream {
    _file: hdf5::File,
    dataset: hdf5::Dataset,
}

impl Hdf5CoefficientStream {
    pub fn open<P: AsRef<Path>>(path: P, dataset: &str) -> Result<Self> {
        let file = hdf5::File::open(path.as_ref())?;
        let dataset = file.dataset(dataset)?;
        Ok(Hdf5CoefficientStream {
            _file: file,
            dataset,
        })
    }
}

impl CoefficientSource for Hdf5CoefficientStream {
    fn read_coefficients(&self, offset: usize, len: usize) -> Result<Vec<f64>> {
        let values = self
            .dataset
            .read_slice_1d::<f64, _>(offset..offset + len)?;
        Ok(values.to_vec())
    }
}

/// Location of a coefficient stream on disk, cheap to send to worker threads.
#[derive(Debug, Clone)]
pub struct CoefficientLocation {
    pub path: PathBuf,
    pub dataset: String,
}

impl CoefficientLocation {
    pub fn open(&self) -> Result<Hdf5CoefficientStream> {
        Hdf5CoefficientStream::open(&self.path, &self.dataset)
    }
}

/// Reconstructs the full-resolution samples of one channel.
///
/// Pure with respect to its inputs, so channels can be reconstructed
/// independently on separate threads.
pub fn reconstruct_channel<S: CoefficientSource + ?Sized>(
    stream: &S,
    channel_index: usize,
    descriptor: &WaveletStreamDescriptor,
) -> Result<Vec<f64>> {
    let offsets = descriptor.chunk_offsets(channel_index)?;
    let chunk_len = descriptor.coefs_chunk_length;
    let mut samples = Vec::new();

    for offset in offsets {
        let coefs = stream.read_coefficients(offset, chunk_len)?;
        let frames = reconstruct_chunk(&coefs, descriptor.compression_level);
        if frames.len() > 2 * BOUNDARY_TRIM {
            samples.extend_from_slice(&frames[BOUNDARY_TRIM..frames.len() - BOUNDARY_TRIM]);
        }
    }

    Ok(samples)
}

/// Inverse-transforms one chunk of coefficients.
fn reconstruct_chunk(coefs: &[f64], compression_level: u32) -> Vec<f64> {
    let half = coefs.len() / 2;
    let mut approx = coefs[..half].to_vec();
    let mut detail = coefs[half..2 * half].to_vec();
    rotate_coefficients(&mut approx);
    rotate_coefficients(&mut detail);

    let mut frames = idwt_periodized(&approx, Some(&detail));
    for _ in 1..compression_level {
        frames = idwt_periodized(&frames, None);
    }
    frames
}

// Helper function to undo the encoder offset: out[i] = in[(i + 5) mod n]
fn rotate_coefficients(values: &mut [f64]) {
    if !values.is_empty() {
        let shift = COEFFICIENT_ROTATION % values.len();
        values.rotate_left(shift);
    }
}

/// One level of the inverse sym7 DWT with periodic boundary handling.
///
/// Produces `2 * approx.len()` samples. A missing detail band is treated as
/// all zeros.
fn idwt_periodized(approx: &[f64], detail: Option<&[f64]>) -> Vec<f64> {
    let n = approx.len();
    let mut output = vec![0.0; 2 * n];
    if n == 0 {
        return output;
    }

    let filter_len = SYM7_DEC_LO.len();
    let half_filter = filter_len / 2;
    let start = filter_len / 4;
    let rec_lo: Vec<f64> = SYM7_DEC_LO.iter().rev().copied().collect();
    let rec_hi: Vec<f64> = SYM7_DEC_LO
        .iter()
        .enumerate()
        .map(|(k, &h)| if k % 2 == 0 { h } else { -h })
        .collect();

    for m in 0..n {
        let mut even = 0.0;
        let mut odd = 0.0;
        for j in 0..half_filter {
            let idx = (m as isize + start as isize - j as isize).rem_euclid(n as isize) as usize;
            let a = approx[idx];
            even += rec_lo[2 * j] * a;
            odd += rec_lo[2 * j + 1] * a;
            if let Some(detail) = detail {
                let d = detail[idx];
                even += rec_hi[2 * j] * d;
                odd += rec_hi[2 * j + 1] * d;
            }
        }
        output[2 * m] = even;
        output[2 * m + 1] = odd;
    }

    output
}
