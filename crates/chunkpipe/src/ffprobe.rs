use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use log::debug;
use crate::config::PipelineConfig;
use crate::error::ToolError;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
}

/// What the pipeline needs to know about a media file
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// Container duration in seconds (0 when unknown)
    pub duration: f64,
    /// Container size in bytes (0 when unknown)
    pub size: u64,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl MediaInfo {
    /// Placeholder for files ffprobe could not read
    pub fn unknown() -> Self {
        Self {
            duration: 0.0,
            size: 0,
            codec: "unknown".to_string(),
            width: 0,
            height: 0,
            frame_rate: 0.0,
        }
    }

    pub fn resolution(&self) -> String {
        if self.width == 0 || self.height == 0 {
            "unknown".to_string()
        } else {
            format!("{}x{}", self.width, self.height)
        }
    }
}

impl FFProbeData {
    /// Reduce the raw ffprobe document to [`MediaInfo`]
    pub fn media_info(&self) -> MediaInfo {
        let mut info = MediaInfo::unknown();

        info.duration = self
            .format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(0.0);
        info.size = self
            .format
            .size
            .as_deref()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let video = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref().map(|t| t == "video").unwrap_or(true));

        if let Some(stream) = video {
            if let Some(codec) = &stream.codec_name {
                info.codec = codec.clone();
            }
            info.width = stream.width.unwrap_or(0).max(0) as u32;
            info.height = stream.height.unwrap_or(0).max(0) as u32;
            info.frame_rate = stream
                .r_frame_rate
                .as_deref()
                .and_then(parse_frame_rate)
                .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate))
                .unwrap_or(0.0);
        }

        info
    }
}

/// Parse a frame rate such as "30000/1001", "25/1" or "29.97"
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num_str, den_str)) = frame_rate_str.split_once('/') {
        let num = num_str.trim().parse::<f64>().ok()?;
        let den = den_str.trim().parse::<f64>().ok()?;
        if den != 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }

    frame_rate_str
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|&f| f > 0.0 && f < 1000.0)
}

/// Source of media metadata
#[allow(async_fn_in_trait)]
pub trait MediaProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;

    /// Probe, but report unreadable files as [`MediaInfo::unknown`]
    async fn probe_or_unknown(&self, path: &Path) -> MediaInfo {
        match self.probe(path).await {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Could not probe {}: {:#}", path.display(), e);
                MediaInfo::unknown()
            }
        }
    }
}

/// [`MediaProber`] backed by the ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_bin: PathBuf,
}

impl FfprobeProber {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            ffprobe_bin: cfg.ffprobe_bin.clone(),
        }
    }

    /// Verify ffprobe runs; returns the first line of `ffprobe -version`
    pub async fn check_available(&self) -> Result<String> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|_| ToolError::NotFound {
                tool: "ffprobe",
                path: self.ffprobe_bin.clone(),
            })?;

        if !output.status.success() {
            return Err(ToolError::failed(
                "ffprobe",
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            )
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }
}

impl MediaProber for FfprobeProber {
    async fn probe(&self, file_path: &Path) -> Result<MediaInfo> {
        // Verify file exists before trying to probe
        if !file_path.exists() {
            anyhow::bail!("File does not exist: {}", file_path.display());
        }

        debug!("ffprobe: probing {}", file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::failed("ffprobe", output.status.code(), &stderr))
                .with_context(|| format!("ffprobe could not read {}", file_path.display()));
        }

        let data: FFProbeData = serde_json::from_slice(&output.stdout)
            .map_err(|e| ToolError::Malformed {
                tool: "ffprobe",
                detail: e.to_string(),
            })
            .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))?;

        Ok(data.media_info())
    }
}
