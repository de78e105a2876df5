use brw_extract::resample::Resampler;
use brw_extract::wavelet::reconstruct_channel;
use brw_extract::WaveletStreamDescriptor;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

pub fn bench_downsample_block(c: &mut Criterion) {
    // One default-sized RAW block of a single channel
    let samples: Vec<f64> = (0..100_000)
        .map(|i| (i as f64 * 0.01).sin() * 500.0)
        .collect();
    let mut resampler = Resampler::new();

    c.bench_function("downsample_100k_by_17.8", |b| {
        b.iter(|| {
            let result = resampler.downsample(black_box(&samples), 17.8555);
            black_box(result.map(|out| out.len()))
        });
    });
}

pub fn bench_reconstruct_channel(c: &mut Criterion) {
    // 64 channels, 20 chunks of 4096 frames at compression level 3
    let descriptor = WaveletStreamDescriptor::new(3, 4096, 64, 1024 * 64 * 20);
    let stream: Vec<f64> = (0..descriptor.total_coefficient_length)
        .map(|i| ((i % 1024) as f64 * 0.3).cos())
        .collect();

    c.bench_function("reconstruct_channel_level3", |b| {
        b.iter(|| {
            let result = reconstruct_channel(black_box(&stream), 7, &descriptor);
            black_box(result.map(|samples| samples.len()))
        });
    });
}

criterion_group!(benches, bench_downsample_block, bench_reconstruct_channel);
criterion_main!(benches);
