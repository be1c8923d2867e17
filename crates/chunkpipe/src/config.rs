use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the chunked transcode pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory that receives the merged outputs and the encoded-chunk work dirs
    pub output_dir: PathBuf,
    /// Process the largest files first (false = smallest first)
    pub largest_first: bool,
    /// Forward only every Nth progress event to the console
    pub progress_interval: u32,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Video encoder passed to `-c:v`
    pub video_codec: String,
    /// Encoder preset passed to `-preset`
    pub preset: String,
    /// Hardware acceleration method for decoding (`-hwaccel`), if any
    pub hwaccel: Option<String>,
    /// Approximate byte budget of one source chunk (e.g., 100 MiB)
    pub target_chunk_bytes: u64,
    /// Lower bound for the computed segment duration in seconds
    pub min_segment_secs: f64,
    /// Segment duration used when the source duration or size is unknown
    pub default_segment_secs: f64,
    /// Encoded chunks at or below this size are treated as truncated
    pub min_encoded_chunk_bytes: u64,
    /// Maximum source/output duration difference that still counts as a good merge
    pub duration_tolerance_secs: f64,
    /// Seconds to wait for ffmpeg to quit after a stop request before killing it
    pub stop_grace_secs: u64,
    /// Redo splits that have chunks but no completion marker
    pub strict_split: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            output_dir: PathBuf::from("02"),
            largest_first: true,
            progress_interval: 1,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            video_codec: "libvvenc".to_string(),
            preset: "fast".to_string(),
            hwaccel: Some("auto".to_string()),
            target_chunk_bytes: 100 * 1024 * 1024, // 100 MiB
            min_segment_secs: 10.0,
            default_segment_secs: 300.0,
            min_encoded_chunk_bytes: 1024,
            duration_tolerance_secs: 10.0,
            stop_grace_secs: 15,
            strict_split: false,
        }
    }

    /// Load configuration from a file, or return defaults if path is None
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            // TOML by extension, JSON otherwise
            if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                config = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
            } else {
                config = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
            }
        }

        Ok(config)
    }

    /// Progress sampling interval, never below 1
    pub fn sample_every(&self) -> u32 {
        self.progress_interval.max(1)
    }
}
