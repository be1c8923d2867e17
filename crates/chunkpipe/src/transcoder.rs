use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;
use crate::cancel::{CancelLevel, CancelToken};
use crate::config::PipelineConfig;
use crate::error::ToolError;
use crate::progress::{ProgressParser, ProgressSnapshot};

/// How an encode ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// ffmpeg exited cleanly; the output is complete
    Finished,
    /// ffmpeg was asked to stop because of cancellation; the output is partial
    Stopped,
}

/// The external transcoder: segmenting, encoding and lossless concatenation
#[allow(async_fn_in_trait)]
pub trait Transcoder {
    /// Stream-copy `source` into numbered segments of about `segment_secs` each.
    /// `pattern` contains a `%03d` placeholder for the 1-based segment number.
    /// A hard cancel stops the segmenter and fails the split.
    async fn split(&self, source: &Path, pattern: &Path, segment_secs: f64, cancel: &CancelToken) -> Result<()>;

    /// Re-encode `input` into `output`, reporting progress snapshots.
    ///
    /// The encode is stopped once `cancel` reaches `stop_at`; below that level
    /// cancellation is ignored and the encode runs to completion.
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancelToken,
        stop_at: CancelLevel,
        on_progress: &mut dyn FnMut(ProgressSnapshot),
    ) -> Result<EncodeOutcome>;

    /// Concatenate the files listed in a concat-demuxer `manifest` into `output`.
    /// A hard cancel stops the merge and fails it.
    async fn concat(&self, manifest: &Path, output: &Path, cancel: &CancelToken) -> Result<()>;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 7.1.1-1ubuntu1" -> FFmpegVersion { major: 7, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self> {
        // Release builds print N.N[.N], some distros prefix an "n"
        let version_part = version_str
            .split_whitespace()
            .map(|s| s.strip_prefix('n').unwrap_or(s))
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        let mut numbers = version_part.split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });

        let major = numbers
            .next()
            .flatten()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?;
        let minor = numbers.next().flatten().unwrap_or(0);
        let patch = numbers.next().flatten().unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Command builder for generating FFmpeg command lines
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    video_codec: String,
    preset: String,
    hwaccel: Option<String>,
}

impl CommandBuilder {
    pub fn new(cfg: &PipelineConfig) -> Self {
        CommandBuilder {
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            hwaccel: cfg.hwaccel.clone(),
        }
    }

    /// Build the lossless segmenting command
    ///
    /// Segments are stream-copied, numbered from 1, and each starts its
    /// timestamps at zero so it can be encoded on its own.
    pub fn build_split_command(&self, source: &Path, pattern: &Path, segment_secs: f64) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        args.push("-i".to_string());
        args.push(source.to_string_lossy().to_string());

        args.push("-c".to_string());
        args.push("copy".to_string());
        args.push("-map".to_string());
        args.push("0".to_string());

        args.push("-f".to_string());
        args.push("segment".to_string());
        args.push("-segment_format".to_string());
        args.push("mp4".to_string());
        args.push("-segment_time".to_string());
        args.push(format!("{:.3}", segment_secs));
        args.push("-segment_start_number".to_string());
        args.push("1".to_string());
        args.push("-reset_timestamps".to_string());
        args.push("1".to_string());

        args.push(pattern.to_string_lossy().to_string());
        args
    }

    /// Build the chunk encode command
    ///
    /// Video is re-encoded with the configured codec/preset, audio is copied.
    /// Progress goes to stdout as `key=value` blocks.
    pub fn build_encode_command(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-progress", "pipe:1"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if let Some(hwaccel) = &self.hwaccel {
            args.push("-hwaccel".to_string());
            args.push(hwaccel.clone());
        }

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        args.push("-c:v".to_string());
        args.push(self.video_codec.clone());
        args.push("-preset".to_string());
        args.push(self.preset.clone());

        args.push("-c:a".to_string());
        args.push("copy".to_string());

        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Build the concat-demuxer merge command
    pub fn build_concat_command(&self, manifest: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        args.push("-i".to_string());
        args.push(manifest.to_string_lossy().to_string());
        args.push("-c".to_string());
        args.push("copy".to_string());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

/// [`Transcoder`] that drives a local ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
    builder: CommandBuilder,
    stop_grace: Duration,
}

impl FfmpegTranscoder {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            builder: CommandBuilder::new(cfg),
            stop_grace: Duration::from_secs(cfg.stop_grace_secs),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        // Keep terminal interrupts away from ffmpeg; stopping it is our decision
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd
    }

    fn not_found(&self) -> ToolError {
        ToolError::NotFound {
            tool: "ffmpeg",
            path: self.ffmpeg_bin.clone(),
        }
    }

    /// Validate the ffmpeg install: it must run and provide the configured encoder.
    /// Returns the parsed version when the banner carries one.
    pub async fn check_environment(&self, video_codec: &str) -> Result<Option<FFmpegVersion>> {
        let output = self
            .command()
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|_| self.not_found())?;

        if !output.status.success() {
            return Err(ToolError::failed("ffmpeg", output.status.code(), &String::from_utf8_lossy(&output.stderr)).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or_default();
        let version = match FFmpegVersion::parse(first_line) {
            Ok(v) => {
                info!("🎬 FFmpeg {}.{}.{} detected", v.major, v.minor, v.patch);
                Some(v)
            }
            Err(e) => {
                // Git snapshots print "N-12345-g..." instead of a release number
                warn!("Could not parse FFmpeg version ({}), continuing", e);
                None
            }
        };

        let encoders = self
            .command()
            .arg("-hide_banner")
            .arg("-encoders")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|_| self.not_found())?;

        if !encoders.status.success() {
            return Err(ToolError::failed("ffmpeg", encoders.status.code(), &String::from_utf8_lossy(&encoders.stderr)).into());
        }

        let listing = String::from_utf8_lossy(&encoders.stdout);
        if !lists_encoder(&listing, video_codec) {
            return Err(ToolError::MissingEncoder {
                encoder: video_codec.to_string(),
            }
            .into());
        }

        Ok(version)
    }

    /// Run ffmpeg without progress tracking; fails on non-zero exit or when
    /// `cancel` reaches [`CancelLevel::Hard`] first
    async fn run_to_completion(&self, args: Vec<String>, cancel: &CancelToken) -> Result<()> {
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| self.not_found())?;

        let mut stdin = child.stdin.take();
        let stderr = child.stderr.take().context("Failed to capture FFmpeg stderr")?;
        let stderr_handle = tokio::spawn(collect_lines(stderr));

        let mut stop_requested = false;
        let mut kill_deadline: Option<Instant> = None;

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.context("Failed to wait for FFmpeg process")?;
                }
                _ = cancel.reached(CancelLevel::Hard), if !stop_requested => {
                    info!("Asking ffmpeg to stop");
                    stop_requested = true;
                    request_quit(&mut stdin, &mut child).await;
                    kill_deadline = Some(Instant::now() + self.stop_grace);
                }
                _ = sleep_until_opt(kill_deadline), if kill_deadline.is_some() => {
                    warn!("ffmpeg did not quit within {:?}, killing it", self.stop_grace);
                    let _ = child.start_kill();
                    kill_deadline = None;
                }
            }
        };
        let stderr = stderr_handle.await.unwrap_or_default();

        if stop_requested {
            anyhow::bail!("ffmpeg stopped by cancellation (status {:?})", status.code());
        }
        if !status.success() {
            return Err(ToolError::failed("ffmpeg", status.code(), &stderr).into());
        }
        Ok(())
    }
}

/// Check an `ffmpeg -encoders` listing for an encoder name
fn lists_encoder(listing: &str, encoder: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(encoder))
}

/// Ask ffmpeg to quit gracefully; kill it if its stdin is unusable
async fn request_quit(stdin: &mut Option<ChildStdin>, child: &mut Child) {
    let sent = match stdin.as_mut() {
        Some(pipe) => pipe.write_all(b"q\n").await.is_ok() && pipe.flush().await.is_ok(),
        None => false,
    };
    *stdin = None;
    if !sent {
        let _ = child.start_kill();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = Vec::new();
    let mut line_stream = BufReader::new(reader).lines();
    while let Ok(Some(line)) = line_stream.next_line().await {
        lines.push(line);
    }
    lines.join("\n")
}

impl Transcoder for FfmpegTranscoder {
    async fn split(&self, source: &Path, pattern: &Path, segment_secs: f64, cancel: &CancelToken) -> Result<()> {
        let args = self.builder.build_split_command(source, pattern, segment_secs);
        self.run_to_completion(args, cancel)
            .await
            .with_context(|| format!("Segmenting failed for {}", source.display()))
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancelToken,
        stop_at: CancelLevel,
        on_progress: &mut dyn FnMut(ProgressSnapshot),
    ) -> Result<EncodeOutcome> {
        let args = self.builder.build_encode_command(input, output);
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| self.not_found())?;

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take().context("Failed to capture FFmpeg stdout")?;
        let stderr = child.stderr.take().context("Failed to capture FFmpeg stderr")?;
        let stderr_handle = tokio::spawn(collect_lines(stderr));

        let mut progress_lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::new();
        let mut stop_requested = false;
        let mut kill_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                line = progress_lines.next_line() => {
                    match line.context("Failed to read FFmpeg progress")? {
                        Some(line) => {
                            if let Some(snapshot) = parser.feed(&line) {
                                on_progress(snapshot);
                            }
                        }
                        None => break,
                    }
                }
                _ = cancel.reached(stop_at), if !stop_requested => {
                    info!("Asking ffmpeg to stop encoding {}", output.display());
                    stop_requested = true;
                    request_quit(&mut stdin, &mut child).await;
                    kill_deadline = Some(Instant::now() + self.stop_grace);
                }
                _ = sleep_until_opt(kill_deadline), if kill_deadline.is_some() => {
                    warn!("ffmpeg did not quit within {:?}, killing it", self.stop_grace);
                    let _ = child.start_kill();
                    kill_deadline = None;
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for FFmpeg process")?;
        let stderr = stderr_handle.await.unwrap_or_default();

        if stop_requested {
            debug!("ffmpeg stopped on request (status {:?})", status.code());
            return Ok(EncodeOutcome::Stopped);
        }
        if !status.success() {
            return Err(ToolError::failed("ffmpeg", status.code(), &stderr))
                .with_context(|| format!("Encoding failed for {}", input.display()));
        }
        Ok(EncodeOutcome::Finished)
    }

    async fn concat(&self, manifest: &Path, output: &Path, cancel: &CancelToken) -> Result<()> {
        let args = self.builder.build_concat_command(manifest, output);
        self.run_to_completion(args, cancel)
            .await
            .with_context(|| format!("Concatenation into {} failed", output.display()))
    }
}
