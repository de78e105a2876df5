use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::writer::DEFAULT_RAW_CHUNK_LEN;

/// Tuning knobs for extraction runs.
///
/// Every field is optional in the TOML file; missing fields take the
/// defaults below.
///
/// ```toml
/// raw_block_frames = 100000
/// wav_block_frames = 100000
/// worker_threads = 8
/// raw_chunk_len = 65536
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Frames read per block on RAW sources
    pub raw_block_frames: usize,
    /// Frames written per block on WAV sources
    pub wav_block_frames: usize,
    /// Size of the reconstruction pool; 0 uses one thread per core
    pub worker_threads: usize,
    /// HDF5 chunk length of output sample streams
    pub raw_chunk_len: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            raw_block_frames: 100_000,
            wav_block_frames: 100_000,
            worker_threads: 0,
            raw_chunk_len: DEFAULT_RAW_CHUNK_LEN,
        }
    }
}

impl ExtractConfig {
    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: ExtractConfig = toml::from_str(&s)?;
        Ok(cfg)
    }

    /// Number of reconstruction workers to start.
    pub fn workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: ExtractConfig = toml::from_str("worker_threads = 3").unwrap();
        assert_eq!(cfg.worker_threads, 3);
        assert_eq!(cfg.raw_block_frames, 100_000);
        assert_eq!(cfg.workers(), 3);
    }

    #[test]
    fn zero_workers_means_all_cores() {
        let cfg = ExtractConfig::default();
        assert!(cfg.workers() >= 1);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extract.toml");
        fs::write(&path, "raw_block_frames = 512\nraw_chunk_len = 1024\n").unwrap();
        let cfg = ExtractConfig::load_from(&path).unwrap();
        assert_eq!(cfg.raw_block_frames, 512);
        assert_eq!(cfg.raw_chunk_len, 1024);
        assert_eq!(cfg.wav_block_frames, 100_000);
    }
}
