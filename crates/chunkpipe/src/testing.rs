use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use anyhow::{anyhow, Context, Result};
use crate::cancel::{CancelLevel, CancelToken};
use crate::config::PipelineConfig;
use crate::ffprobe::{MediaInfo, MediaProber};
use crate::progress::{ChunkInfo, ChunkProgress, ProgressSink, ProgressSnapshot};
use crate::scan::Candidate;
use crate::transcoder::{EncodeOutcome, Transcoder};
use crate::unit::{self, WorkUnit};

/// Bytes written for every fake encoded chunk (above the truncation threshold)
pub const ENCODED_CHUNK_BYTES: usize = 2048;

/// Fake media file: every `D <secs>` line adds to its duration, other lines are payload
pub fn fake_media(duration: f64) -> String {
    format!("D {}\n", duration)
}

pub fn fake_duration(content: &str) -> Option<f64> {
    let durations: Vec<f64> = content
        .lines()
        .filter_map(|l| l.strip_prefix("D "))
        .filter_map(|d| d.trim().parse::<f64>().ok())
        .collect();
    (!durations.is_empty()).then(|| durations.iter().sum())
}

fn read_duration(path: &Path) -> Result<f64> {
    let bytes = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    fake_duration(&String::from_utf8_lossy(&bytes)).ok_or_else(|| anyhow!("not a media file: {}", path.display()))
}

/// Scratch library with an input root and an output directory
pub struct Library {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
    pub out: PathBuf,
}

impl Library {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("library");
        let out = dir.path().join("encoded");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&out).unwrap();
        Self { _dir: dir, root, out }
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            output_dir: self.out.clone(),
            ..PipelineConfig::default_config()
        }
    }

    pub fn add_source(&self, name: &str, duration: f64) -> PathBuf {
        let path = self.root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, fake_media(duration)).unwrap();
        path
    }

    /// Candidate with a declared size, so chunk counts can be steered
    pub fn candidate(&self, name: &str, duration: f64, size: u64) -> Candidate {
        Candidate {
            path: self.add_source(name, duration),
            size,
        }
    }

    pub fn unit(&self, name: &str, duration: f64, size: u64) -> WorkUnit {
        let c = self.candidate(name, duration, size);
        let unit = WorkUnit::new(&c.path, c.size, &self.out).unwrap();
        unit.prepare_dirs().unwrap();
        unit
    }
}

#[derive(Debug, Default)]
pub struct FakeProber;

impl MediaProber for FakeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let duration = read_duration(path)?;
        Ok(MediaInfo {
            duration,
            size: unit::file_size(path),
            codec: "h264".to_string(),
            width: 1920,
            height: 1080,
            frame_rate: 25.0,
        })
    }
}

#[derive(Debug, Default)]
struct Script {
    cancel_during: Option<(u32, CancelLevel)>,
    cancel_during_split: Option<CancelLevel>,
    failures: HashMap<u32, usize>,
    concat_drift_secs: f64,
}

#[derive(Debug, Default)]
struct Calls {
    splits: usize,
    encodes: Vec<String>,
    concats: Vec<Vec<String>>,
}

/// Scriptable [`Transcoder`] that records what it was asked to do
#[derive(Debug, Default)]
pub struct FakeTranscoder {
    script: Mutex<Script>,
    calls: Mutex<Calls>,
}

impl FakeTranscoder {
    /// Raise cancellation to `level` while chunk `seq` is being encoded
    pub fn cancel_during(self, seq: u32, level: CancelLevel) -> Self {
        self.script.lock().unwrap().cancel_during = Some((seq, level));
        self
    }

    /// Raise cancellation to `level` while the segmenter is running
    pub fn cancel_during_split(self, level: CancelLevel) -> Self {
        self.script.lock().unwrap().cancel_during_split = Some(level);
        self
    }

    /// Make the next `times` encodes of chunk `seq` fail as if ffmpeg was killed
    pub fn fail_encode(self, seq: u32, times: usize) -> Self {
        self.script.lock().unwrap().failures.insert(seq, times);
        self
    }

    /// Add `secs` of extra duration to every merged output
    pub fn concat_drift(self, secs: f64) -> Self {
        self.script.lock().unwrap().concat_drift_secs = secs;
        self
    }

    pub fn split_calls(&self) -> usize {
        self.calls.lock().unwrap().splits
    }

    /// Names of the source chunks handed to `encode`, in call order
    pub fn encoded_inputs(&self) -> Vec<String> {
        self.calls.lock().unwrap().encodes.clone()
    }

    /// File names listed in each concat manifest
    pub fn concat_orders(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().concats.clone()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

impl Transcoder for FakeTranscoder {
    async fn split(&self, source: &Path, pattern: &Path, segment_secs: f64, cancel: &CancelToken) -> Result<()> {
        self.calls.lock().unwrap().splits += 1;
        let cancel_level = self.script.lock().unwrap().cancel_during_split;

        let duration = read_duration(source)?;
        let mut remaining = duration;
        let mut seq = 1;
        while remaining > 1e-9 {
            let len = remaining.min(segment_secs);
            let name = pattern.to_string_lossy().replace("%03d", &format!("{:03}", seq));
            fs::write(&name, fake_media(len))?;
            remaining -= len;
            seq += 1;

            // Stop after the first segment, as a killed segmenter would
            if let Some(level) = cancel_level {
                cancel.request(level);
            }
            if cancel.is_hard() {
                anyhow::bail!("ffmpeg stopped by cancellation");
            }
        }
        Ok(())
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancelToken,
        stop_at: CancelLevel,
        on_progress: &mut dyn FnMut(ProgressSnapshot),
    ) -> Result<EncodeOutcome> {
        self.calls.lock().unwrap().encodes.push(file_name(input));
        let seq = unit::chunk_sequence(input).ok_or_else(|| anyhow!("not a chunk: {}", input.display()))?;
        let duration = read_duration(input)?;

        for step in 1..=4 {
            on_progress(ProgressSnapshot {
                out_time_secs: duration * step as f64 / 4.0,
                speed: 2.0,
                bitrate_kbps: 1000.0,
                total_size: 256 * step,
                ..Default::default()
            });
        }

        let (cancel_level, should_fail) = {
            let mut script = self.script.lock().unwrap();
            let cancel_level = script.cancel_during.filter(|(s, _)| *s == seq).map(|(_, l)| l);
            let should_fail = match script.failures.get_mut(&seq) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            (cancel_level, should_fail)
        };

        if let Some(level) = cancel_level {
            cancel.request(level);
        }
        if cancel.level() >= stop_at {
            fs::write(output, "partial")?;
            return Ok(EncodeOutcome::Stopped);
        }
        if should_fail {
            fs::write(output, "partial")?;
            anyhow::bail!("ffmpeg failed (exit code signal)");
        }

        // Pad the comment line so concatenated chunks keep one `D` line each
        let header = format!("{}# {}", fake_media(duration), file_name(input));
        let content = format!("{:<width$}\n", header, width = ENCODED_CHUNK_BYTES - 1);
        fs::write(output, content)?;
        Ok(EncodeOutcome::Finished)
    }

    async fn concat(&self, manifest: &Path, output: &Path, cancel: &CancelToken) -> Result<()> {
        if cancel.is_hard() {
            anyhow::bail!("ffmpeg stopped by cancellation");
        }
        let dir = manifest.parent().unwrap();
        let listing = fs::read_to_string(manifest)?;

        let mut names = Vec::new();
        let mut merged = Vec::new();
        for line in listing.lines() {
            let quoted = line
                .strip_prefix("file '")
                .and_then(|l| l.strip_suffix('\''))
                .ok_or_else(|| anyhow!("bad manifest line: {}", line))?;
            let name = quoted.replace("'\\''", "'");
            merged.extend(fs::read(dir.join(&name))?);
            names.push(name);
        }

        let drift = self.script.lock().unwrap().concat_drift_secs;
        if drift != 0.0 {
            merged.extend(fake_media(drift).into_bytes());
        }

        self.calls.lock().unwrap().concats.push(names);
        fs::write(output, merged)?;
        Ok(())
    }
}

/// Sink that keeps every forwarded progress event
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub started: Vec<usize>,
    pub events: Vec<(usize, ChunkProgress)>,
    pub finished: Vec<(usize, u64)>,
}

impl ProgressSink for RecordingSink {
    fn chunk_started(&mut self, chunk: &ChunkInfo) {
        self.started.push(chunk.index);
    }

    fn progress(&mut self, chunk: &ChunkInfo, progress: &ChunkProgress) {
        self.events.push((chunk.index, progress.clone()));
    }

    fn chunk_finished(&mut self, chunk: &ChunkInfo, output_bytes: u64) {
        self.finished.push((chunk.index, output_bytes));
    }
}
