use std::fs;
use std::path::PathBuf;
use anyhow::{Context, Result};
use log::{info, warn};
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::encode::remove_if_exists;
use crate::transcoder::Transcoder;
use crate::unit::{self, WorkUnit};

/// Segment duration that makes each chunk roughly `target_chunk_bytes`.
///
/// `(target / size) * duration`, floored at `min_segment_secs`; when size or
/// duration is unknown the fixed default is used.
pub fn segment_time(source_bytes: u64, duration_secs: f64, cfg: &PipelineConfig) -> f64 {
    if source_bytes == 0 || !(duration_secs > 0.0) {
        return cfg.default_segment_secs;
    }
    let secs = (cfg.target_chunk_bytes as f64 / source_bytes as f64) * duration_secs;
    secs.max(cfg.min_segment_secs)
}

/// Number of segments a source of `duration_secs` yields at `segment_secs`
pub fn expected_chunk_count(duration_secs: f64, segment_secs: f64) -> usize {
    if !(duration_secs > 0.0) || !(segment_secs > 0.0) {
        return 0;
    }
    (duration_secs / segment_secs).ceil() as usize
}

fn remove_all(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        remove_if_exists(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Drop encoded chunks (and the clean-stop marker) derived from a discarded split
fn discard_encoded(unit: &WorkUnit) -> Result<()> {
    let encoded = unit::encoded_chunks(&unit.encoded_dir)?;
    if !encoded.is_empty() {
        warn!("  Discarding {} encoded chunks made from that split", encoded.len());
    }
    remove_all(&encoded)?;
    remove_if_exists(&unit.clean_stop_marker())
        .with_context(|| format!("Failed to remove resume marker in {}", unit.encoded_dir.display()))
}

/// Cut the unit's source into chunks unless a previous run already did.
///
/// Returns the source chunks in sequence order. If the segmenter fails (or is
/// stopped by a hard cancel) the chunks it left behind are removed, so the
/// next run splits again instead of trusting a partial set.
pub async fn split_source<T: Transcoder>(
    transcoder: &T,
    unit: &WorkUnit,
    duration_secs: f64,
    cfg: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let existing = unit::source_chunks(&unit.chunk_dir)?;
    let marked = unit.split_marker().exists();

    if !existing.is_empty() {
        if marked {
            info!("  Found {} existing source chunks. Skipping split.", existing.len());
            return Ok(existing);
        }
        if !cfg.strict_split {
            warn!(
                "  Found {} source chunks without a completion marker; trusting them as a complete split",
                existing.len()
            );
            return Ok(existing);
        }
        warn!("  Discarding {} source chunks from an unfinished split", existing.len());
        remove_all(&existing)?;
        discard_encoded(unit)?;
    }

    let segment_secs = segment_time(unit.size, duration_secs, cfg);
    info!(
        "  Splitting into ~{} chunks (segment time: {:.2}s)...",
        humansize::format_size(cfg.target_chunk_bytes, humansize::BINARY),
        segment_secs
    );

    if let Err(e) = transcoder
        .split(&unit.source, &unit.chunk_pattern(), segment_secs, cancel)
        .await
    {
        let partial = unit::source_chunks(&unit.chunk_dir)?;
        if !partial.is_empty() {
            warn!("  Removing {} chunks left by the interrupted split", partial.len());
        }
        remove_all(&partial)?;
        return Err(e);
    }

    fs::write(unit.split_marker(), b"")
        .with_context(|| format!("Failed to write split marker in {}", unit.chunk_dir.display()))?;

    let chunks = unit::source_chunks(&unit.chunk_dir)?;
    if chunks.is_empty() {
        anyhow::bail!("Segmenter produced no chunks for {}", unit.source.display());
    }
    info!("  Split produced {} chunks", chunks.len());
    Ok(chunks)
}
