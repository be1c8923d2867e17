use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{error, info, warn};
use crate::cancel::{CancelLevel, CancelToken};
use crate::config::PipelineConfig;
use crate::ffprobe::MediaProber;
use crate::progress::{ChunkInfo, ChunkProgress, ProgressSink, ProgressSnapshot, Sampler};
use crate::state;
use crate::transcoder::{EncodeOutcome, Transcoder};
use crate::unit::{self, WorkUnit};

/// How the chunk loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeRun {
    /// Every chunk has an encoded counterpart, listed in sequence order
    Complete(Vec<PathBuf>),
    /// Stopped by cancellation; `next_chunk` (1-based) is where a rerun starts
    Interrupted { next_chunk: usize },
}

/// Remove a file, treating "already gone" as success
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn discard_partial(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        warn!("Could not remove partial chunk {}: {}", path.display(), e);
    }
}

fn mark_clean_stop(unit: &WorkUnit) -> Result<()> {
    fs::write(unit.clean_stop_marker(), b"")
        .with_context(|| format!("Failed to write resume marker in {}", unit.encoded_dir.display()))
}

/// Read and remove the clean-stop marker; true if the last run left one
fn take_clean_stop(unit: &WorkUnit) -> Result<bool> {
    let marker = unit.clean_stop_marker();
    if !marker.exists() {
        return Ok(false);
    }
    remove_if_exists(&marker).with_context(|| format!("Failed to remove {}", marker.display()))?;
    Ok(true)
}

/// Drop the newest encoded chunk unless the previous run stopped cleanly
fn reconcile_previous_run(unit: &WorkUnit) -> Result<()> {
    let clean = take_clean_stop(unit)?;
    let encoded = unit::encoded_chunks(&unit.encoded_dir)?;
    if let Some(last) = state::distrusted_chunk(&encoded, clean) {
        info!(
            "  [Resume Check] Deleting last encoded chunk to ensure integrity: {}",
            last.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        remove_if_exists(last).with_context(|| format!("Failed to remove {}", last.display()))?;
    }
    Ok(())
}

/// Encodes a unit's source chunks one at a time
pub struct ChunkEncoder<'a, P, T> {
    pub cfg: &'a PipelineConfig,
    pub prober: &'a P,
    pub transcoder: &'a T,
}

impl<'a, P: MediaProber, T: Transcoder> ChunkEncoder<'a, P, T> {
    pub fn new(cfg: &'a PipelineConfig, prober: &'a P, transcoder: &'a T) -> Self {
        Self { cfg, prober, transcoder }
    }

    async fn encode_once(
        &self,
        chunk: &Path,
        output: &Path,
        info: &ChunkInfo,
        cancel: &CancelToken,
        sink: &mut dyn ProgressSink,
    ) -> Result<EncodeOutcome> {
        let stop_at = if info.is_last() {
            CancelLevel::Hard
        } else {
            CancelLevel::Soft
        };
        let mut sampler = Sampler::new(self.cfg.sample_every());
        let mut forward = |snapshot: ProgressSnapshot| {
            if sampler.tick() {
                sink.progress(info, &ChunkProgress::new(info, snapshot));
            }
        };
        self.transcoder
            .encode(chunk, output, cancel, stop_at, &mut forward)
            .await
    }

    /// Encode every chunk that lacks a complete encoded counterpart.
    ///
    /// A soft cancel stops before the next non-last chunk and interrupts a
    /// non-last chunk in flight; the last chunk is allowed to finish and is
    /// retried once if its encoder died. A hard cancel stops everything.
    pub async fn encode_all(
        &self,
        unit: &WorkUnit,
        chunks: &[PathBuf],
        cancel: &CancelToken,
        sink: &mut dyn ProgressSink,
    ) -> Result<EncodeRun> {
        reconcile_previous_run(unit)?;

        let total = chunks.len();
        let mut encoded = Vec::with_capacity(total);

        for (i, chunk) in chunks.iter().enumerate() {
            let index = i + 1;
            let is_last = index == total;

            if cancel.is_hard() || (cancel.is_cancelled() && !is_last) {
                info!("  Stopping before chunk {}/{}", index, total);
                mark_clean_stop(unit)?;
                return Ok(EncodeRun::Interrupted { next_chunk: index });
            }
            if cancel.is_cancelled() {
                info!("  Interrupt received, but this is the LAST chunk. Finishing file processing...");
            }

            let output = unit.encoded_path_for(chunk);
            if state::is_complete_chunk(&output, self.cfg.min_encoded_chunk_bytes) {
                info!("  [Chunk {}/{}] Already encoded. Skipping.", index, total);
                encoded.push(output);
                continue;
            }

            let info = ChunkInfo {
                index,
                total,
                duration_secs: self.prober.probe_or_unknown(chunk).await.duration,
            };
            info!("  [Chunk {}/{}] Encoding {}...", index, total, chunk.display());
            sink.chunk_started(&info);

            let mut result = self.encode_once(chunk, &output, &info, cancel, sink).await;

            if is_last && result.is_err() && cancel.is_cancelled() && !cancel.is_hard() {
                if let Err(e) = &result {
                    warn!("  Interrupted during last chunk ({:#}). Retrying to finalize file...", e);
                }
                discard_partial(&output);
                result = self.encode_once(chunk, &output, &info, cancel, sink).await;
                if let Err(e) = &result {
                    error!("  Failed to finish last chunk despite retry: {:#}", e);
                    discard_partial(&output);
                    mark_clean_stop(unit)?;
                    return Ok(EncodeRun::Interrupted { next_chunk: index });
                }
            }

            match result {
                Ok(EncodeOutcome::Finished) => {
                    sink.chunk_finished(&info, unit::file_size(&output));
                    encoded.push(output);
                }
                Ok(EncodeOutcome::Stopped) => {
                    info!("  Encoding of chunk {}/{} interrupted", index, total);
                    discard_partial(&output);
                    mark_clean_stop(unit)?;
                    return Ok(EncodeRun::Interrupted { next_chunk: index });
                }
                Err(e) if cancel.is_cancelled() => {
                    info!("  Encoding interrupted: {:#}", e);
                    discard_partial(&output);
                    mark_clean_stop(unit)?;
                    return Ok(EncodeRun::Interrupted { next_chunk: index });
                }
                Err(e) => {
                    discard_partial(&output);
                    mark_clean_stop(unit)?;
                    return Err(e.context(format!("Error encoding chunk {}", chunk.display())));
                }
            }
        }

        mark_clean_stop(unit)?;
        Ok(EncodeRun::Complete(encoded))
    }
}
