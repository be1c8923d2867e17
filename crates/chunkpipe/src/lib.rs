pub mod config;
pub mod error;
pub mod cancel;
pub mod scan;
pub mod lock;
pub mod ffprobe;
pub mod progress;
pub mod transcoder;
pub mod unit;
pub mod state;
pub mod split;
pub mod encode;
pub mod merge;
pub mod verify;
pub mod pipeline;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::ToolError;
pub use cancel::{install_signal_handlers, CancelLevel, CancelToken};
pub use scan::{scan_media, Candidate, SizeOrder};
pub use ffprobe::{FfprobeProber, MediaInfo, MediaProber};
pub use progress::{ChunkInfo, ChunkProgress, NullProgress, ProgressSink};
pub use transcoder::{FfmpegTranscoder, Transcoder};
pub use unit::WorkUnit;
pub use state::ResumeStage;
pub use pipeline::{Pipeline, RunSummary, UnitOutcome, UnitStage};
