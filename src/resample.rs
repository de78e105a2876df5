//! Fixed-ratio, band-limited downsampling.
//!
//! Resampling happens in the frequency domain: the spectrum of the input is
//! truncated to the bins representable at the new length and transformed
//! back. This is the classic Fourier method, so the output is periodic-
//! extension accurate rather than bit-exact with any particular library.

use rustfft::{num_complex::Complex, FftPlanner};

use crate::types::{BrwError, Result};

/// Ratio between the source and target rates.
///
/// Only downsampling is supported: the target must be positive and no higher
/// than the source.
pub fn compute_ratio(source_hz: f64, target_hz: f64) -> Result<f64> {
    if !source_hz.is_finite() || source_hz <= 0.0 {
        return Err(BrwError::Resample(format!(
            "source rate must be positive, got {} Hz",
            source_hz
        )));
    }
    if !target_hz.is_finite() || target_hz <= 0.0 {
        return Err(BrwError::Resample(format!(
            "target rate must be positive, got {} Hz",
            target_hz
        )));
    }
    if target_hz > source_hz {
        return Err(BrwError::Resample(format!(
            "upsampling is not supported ({} Hz -> {} Hz)",
            source_hz, target_hz
        )));
    }
    Ok(source_hz / target_hz)
}

/// Integer decimation factor `floor(source / target)`.
pub fn downsample_factor(source_hz: f64, target_hz: f64) -> Result<usize> {
    let ratio = compute_ratio(source_hz, target_hz)?;
    Ok(ratio.floor() as usize)
}

/// Number of samples produced when downsampling `len` samples by `ratio`.
pub fn output_len(len: usize, ratio: f64) -> usize {
    (len as f64 / ratio).floor() as usize
}

/// FFT resampler that keeps its plans between calls.
///
/// Blocks in a recording all share a handful of lengths, so caching the
/// planner avoids re-planning for every block.
pub struct Resampler {
    planner: FftPlanner<f64>,
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Resampler {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// Downsamples `samples` by `ratio`, returning `floor(len / ratio)` samples.
    pub fn downsample(&mut self, samples: &[f64], ratio: f64) -> Result<Vec<f64>> {
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(BrwError::Resample(format!(
                "downsample ratio must be at least 1, got {}",
                ratio
            )));
        }
        let num = output_len(samples.len(), ratio);
        Ok(self.resample_to(samples, num))
    }

    /// Resamples `samples` to exactly `num` samples (`num <= samples.len()`).
    fn resample_to(&mut self, samples: &[f64], num: usize) -> Vec<f64> {
        let nx = samples.len();
        if num == 0 {
            return Vec::new();
        }
        if num == nx {
            return samples.to_vec();
        }

        // Forward transform of the full input
        let mut spectrum: Vec<Complex<f64>> =
            samples.iter().map(|&s| Complex::new(s, 0.0)).collect();
        self.planner.plan_fft_forward(nx).process(&mut spectrum);

        // Keep the bins that fit in the shorter signal
        let nyquist = num / 2;
        let mut half: Vec<Complex<f64>> = spectrum[..=nyquist].to_vec();
        if num % 2 == 0 {
            // The new Nyquist bin folds both the positive and negative frequency
            half[nyquist] *= 2.0;
        }

        // Rebuild a Hermitian spectrum of length `num`
        let mut output = vec![Complex::new(0.0, 0.0); num];
        output[0] = Complex::new(half[0].re, 0.0);
        for k in 1..=nyquist {
            if num - k == k {
                output[k] = Complex::new(half[k].re, 0.0);
            } else {
                output[k] = half[k];
                output[num - k] = half[k].conj();
            }
        }

        self.planner.plan_fft_inverse(num).process(&mut output);

        // rustfft leaves the inverse unnormalized: 1/num, then the num/nx gain
        let scale = 1.0 / nx as f64;
        output.iter().map(|c| c.re * scale).collect()
    }
}

/// Convenience wrapper around [`Resampler::downsample`] for one-off calls.
pub fn downsample(samples: &[f64], ratio: f64) -> Result<Vec<f64>> {
    Resampler::new().downsample(samples, ratio)
}

/// Rounds a resampled value to the nearest int16 code, saturating at the
/// type bounds.
pub fn to_sample(value: f64) -> i16 {
    value.round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn ratio_rejects_upsampling_and_non_positive_targets() {
        assert!(matches!(compute_ratio(1000.0, 0.0), Err(BrwError::Resample(_))));
        assert!(matches!(compute_ratio(1000.0, -5.0), Err(BrwError::Resample(_))));
        assert!(matches!(compute_ratio(1000.0, 2000.0), Err(BrwError::Resample(_))));
        assert_eq!(compute_ratio(1000.0, 100.0).unwrap(), 10.0);
        assert_eq!(compute_ratio(1000.0, 1000.0).unwrap(), 1.0);
    }

    #[test]
    fn factor_floors_the_ratio() {
        assert_eq!(downsample_factor(17_855.5, 1000.0).unwrap(), 17);
        assert_eq!(downsample_factor(1000.0, 300.0).unwrap(), 3);
    }

    #[test]
    fn halving_returns_floor_of_half_the_samples() {
        for n in [0usize, 1, 2, 7, 10, 101, 256] {
            let samples: Vec<f64> = (0..n).map(|i| (i as f64 * 0.3).sin()).collect();
            let out = downsample(&samples, 2.0).unwrap();
            assert_eq!(out.len(), n / 2, "n = {}", n);
        }
    }

    #[test]
    fn constant_signal_stays_constant() {
        let samples = vec![42.0; 1000];
        let out = downsample(&samples, 10.0).unwrap();
        assert_eq!(out.len(), 100);
        assert!(out.iter().all(|v| (v - 42.0).abs() < 1e-9));
    }

    #[test]
    fn single_output_sample_is_the_mean() {
        let samples: Vec<f64> = (1..=10).map(f64::from).collect();
        let out = downsample(&samples, 10.0).unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0] - 5.5).abs() < 1e-9);
    }

    #[test]
    fn low_frequency_sine_survives_decimation() {
        let rate = 1000.0;
        let freq = 5.0;
        let samples: Vec<f64> = (0..1000)
            .map(|i| (2.0 * PI * freq * i as f64 / rate).sin())
            .collect();
        let out = downsample(&samples, 4.0).unwrap();
        assert_eq!(out.len(), 250);
        for (i, value) in out.iter().enumerate() {
            let expected = (2.0 * PI * freq * i as f64 / (rate / 4.0)).sin();
            assert!((value - expected).abs() < 1e-6, "sample {}", i);
        }
    }

    #[test]
    fn invalid_ratio_is_rejected() {
        assert!(downsample(&[1.0, 2.0], 0.5).is_err());
        assert!(downsample(&[1.0, 2.0], f64::NAN).is_err());
    }

    #[test]
    fn samples_round_and_saturate() {
        assert_eq!(to_sample(1.6), 2);
        assert_eq!(to_sample(-1.6), -2);
        assert_eq!(to_sample(1e9), i16::MAX);
        assert_eq!(to_sample(-1e9), i16::MIN);
    }
}
