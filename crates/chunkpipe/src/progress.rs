use humansize::{format_size, BINARY};

/// One immutable progress sample from an encode
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// Output timestamp reached, in seconds
    pub out_time_secs: f64,
    pub frame: u64,
    pub fps: f64,
    /// Output bitrate in kbit/s
    pub bitrate_kbps: f64,
    /// Bytes written so far
    pub total_size: u64,
    /// Encode speed as a multiple of realtime
    pub speed: f64,
    /// Set on the final block (`progress=end`)
    pub is_complete: bool,
}

/// Accumulates `key=value` lines from `-progress` output into snapshots
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressSnapshot,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a snapshot when a progress block is complete
    pub fn feed(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key {
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.current.frame = frame;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse() {
                    self.current.fps = fps;
                }
            }
            "bitrate" => {
                // "1234.5kbits/s" or "N/A"
                if let Some(kbps) = value.strip_suffix("kbits/s").and_then(|v| v.trim().parse().ok()) {
                    self.current.bitrate_kbps = kbps;
                }
            }
            "total_size" => {
                if let Ok(size) = value.parse() {
                    self.current.total_size = size;
                }
            }
            // out_time_ms carries microseconds as well, so only the _us key is used
            "out_time_us" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.current.out_time_secs = us.max(0) as f64 / 1_000_000.0;
                }
            }
            "out_time" => {
                if let Some(secs) = parse_timestamp(value) {
                    self.current.out_time_secs = secs;
                }
            }
            "speed" => {
                if let Some(speed) = value.strip_suffix('x').and_then(|v| v.trim().parse().ok()) {
                    self.current.speed = speed;
                }
            }
            "progress" => {
                self.current.is_complete = value == "end";
                return Some(self.current.clone());
            }
            _ => {}
        }

        None
    }
}

/// Parse "HH:MM:SS.micro" or plain seconds; negative timestamps are rejected
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let parts: Vec<&str> = value.split(':').collect();
    let secs = match parts.as_slice() {
        [h, m, s] => h.parse::<f64>().ok()? * 3600.0 + m.parse::<f64>().ok()? * 60.0 + s.parse::<f64>().ok()?,
        [s] => s.parse::<f64>().ok()?,
        _ => return None,
    };
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// The chunk an encode belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInfo {
    /// 1-based position in the unit
    pub index: usize,
    pub total: usize,
    /// Source chunk duration in seconds (0 when unknown)
    pub duration_secs: f64,
}

impl ChunkInfo {
    pub fn is_last(&self) -> bool {
        self.index == self.total
    }
}

/// A snapshot interpreted against its chunk's duration
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkProgress {
    pub snapshot: ProgressSnapshot,
    pub eta_secs: f64,
    pub percent: f64,
    /// Expected final size of the encoded chunk at the current bitrate
    pub projected_bytes: u64,
}

impl ChunkProgress {
    pub fn new(chunk: &ChunkInfo, snapshot: ProgressSnapshot) -> Self {
        let duration = chunk.duration_secs;
        let elapsed = snapshot.out_time_secs;

        let eta_secs = if snapshot.speed > 0.0 {
            ((duration - elapsed) / snapshot.speed).max(0.0)
        } else {
            0.0
        };
        let percent = if duration > 0.0 {
            100.0 * elapsed / duration
        } else {
            0.0
        };
        let projected_bytes = (duration * snapshot.bitrate_kbps * 1000.0 / 8.0).max(0.0) as u64;

        Self {
            snapshot,
            eta_secs,
            percent,
            projected_bytes,
        }
    }

    /// Single console line describing this sample
    pub fn render_line(&self) -> String {
        let s = &self.snapshot;
        format!(
            "    Chunk ETA:{} | {:.2}% | size:{} | ETA size:{} | fps:{:.2} | bitrate:{:.1}kbit/s | speed:{:.2}x",
            format_eta(self.eta_secs),
            self.percent,
            format_size(s.total_size, BINARY),
            format_size(self.projected_bytes, BINARY),
            s.fps,
            s.bitrate_kbps,
            s.speed
        )
    }
}

/// Format seconds as H:MM:SS
pub fn format_eta(secs: f64) -> String {
    let d = chrono::Duration::seconds(secs.max(0.0) as i64);
    format!("{}:{:02}:{:02}", d.num_hours(), d.num_minutes() % 60, d.num_seconds() % 60)
}

/// Receives progress from the chunk encoder
pub trait ProgressSink {
    fn chunk_started(&mut self, _chunk: &ChunkInfo) {}

    fn progress(&mut self, chunk: &ChunkInfo, progress: &ChunkProgress);

    fn chunk_finished(&mut self, _chunk: &ChunkInfo, _output_bytes: u64) {}
}

/// Sink that drops everything
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn progress(&mut self, _chunk: &ChunkInfo, _progress: &ChunkProgress) {}
}

/// Passes through every Nth event
#[derive(Debug)]
pub struct Sampler {
    every: u32,
    seen: u64,
}

impl Sampler {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
        }
    }

    /// Count one event; true if it should be reported
    pub fn tick(&mut self) -> bool {
        self.seen += 1;
        self.seen % self.every as u64 == 0
    }
}
