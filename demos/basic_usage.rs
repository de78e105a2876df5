use brw_extract::channel_map::indices_of;
use brw_extract::{export_selection, open, run_downsample, ExtractConfig, SourceLayout};
use std::error::Error;
use std::path::Path;

fn main() -> Result<(), Box<dyn Error>> {
    // Open a recording
    let source = Path::new("data/slice1.brw");
    let recording = open(source)?;

    // Print basic file information
    println!("Container: {}", recording.layout.variant());
    println!("Sampling rate: {} Hz", recording.metadata.sampling_rate);
    println!(
        "Frames: {} ({:.3} seconds)",
        recording.metadata.frame_count,
        recording.metadata.duration_secs()
    );
    let (scale, offset) = recording.metadata.digital_to_analog();
    println!("Conversion: {:.4} uV/count, offset {} uV", scale, offset);

    // Print electrode information
    let (rows, cols) = indices_of(&recording.electrodes);
    println!("Number of electrodes: {}", recording.electrodes.len());
    for (row, col) in rows.iter().zip(&cols).take(5) {
        println!("  ({}, {})", row, col);
    }
    if recording.electrodes.len() > 5 {
        println!("  ... and {} more", recording.electrodes.len() - 5);
    }

    if let SourceLayout::Bw4Wav(layout) | SourceLayout::Bw5Wav(layout) = &recording.layout {
        println!(
            "Wavelet stream: level {}, {} coefficients per chunk",
            layout.descriptor.compression_level, layout.descriptor.coefs_chunk_length
        );
    }

    // Keep every other row and column, first ten seconds, resampled to 1 kHz
    let export = export_selection(source, &recording.electrodes, 1, 1, 1000.0, 0.0, 10.0)?;
    println!("\nSelection written to {}", export.display());

    let summary = run_downsample(&export, &ExtractConfig::default())?;
    println!(
        "Resampled {} electrodes, {} frames at {} Hz into {}",
        summary.electrodes,
        summary.frames_written,
        summary.output_rate,
        summary.output.display()
    );

    Ok(())
}
