use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{info, warn};
use crate::cancel::CancelToken;
use crate::encode::remove_if_exists;
use crate::transcoder::Transcoder;
use crate::unit::{self, WorkUnit};

/// Manifest handed to ffmpeg's concat demuxer, written next to the chunks
pub const MANIFEST_NAME: &str = "concat_list.txt";

/// Quote a file name for a concat manifest line: `'` becomes `'\''`
pub fn escape_concat_name(name: &str) -> String {
    name.replace('\'', "'\\''")
}

/// Manifest text listing `chunks` by file name.
///
/// Chunks must be strictly ascending by sequence number; anything else would
/// splice the output out of order.
pub fn manifest_contents(chunks: &[PathBuf]) -> Result<String> {
    let mut out = String::new();
    let mut previous: Option<u32> = None;

    for chunk in chunks {
        let seq = unit::chunk_sequence(chunk)
            .with_context(|| format!("Not a chunk file: {}", chunk.display()))?;
        if previous.is_some_and(|p| seq <= p) {
            anyhow::bail!("Chunks out of order at {}", chunk.display());
        }
        previous = Some(seq);

        let name = chunk
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("Chunk has no file name: {}", chunk.display()))?;
        out.push_str(&format!("file '{}'\n", escape_concat_name(&name)));
    }
    Ok(out)
}

/// Every source chunk must have its encoded counterpart, position for position
pub fn ensure_gap_free(unit: &WorkUnit, source_chunks: &[PathBuf], encoded: &[PathBuf]) -> Result<()> {
    if source_chunks.len() != encoded.len() {
        anyhow::bail!(
            "Expected {} encoded chunks for {}, found {}",
            source_chunks.len(),
            unit.basename,
            encoded.len()
        );
    }
    for (source, enc) in source_chunks.iter().zip(encoded) {
        if *enc != unit.encoded_path_for(source) || !enc.is_file() {
            anyhow::bail!("Missing encoded chunk for {}", source.display());
        }
    }
    Ok(())
}

/// Concatenate encoded chunks into `output` with stream copy.
///
/// The manifest is removed whether or not the merge succeeded; a failed merge
/// also removes whatever part of `output` was written.
pub async fn merge_chunks<T: Transcoder>(
    transcoder: &T,
    chunks: &[PathBuf],
    output: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let first = chunks.first().context("No encoded chunks to merge")?;
    let dir = first.parent().context("Encoded chunk has no parent directory")?;
    let manifest = dir.join(MANIFEST_NAME);

    fs::write(&manifest, manifest_contents(chunks)?)
        .with_context(|| format!("Failed to write concat list: {}", manifest.display()))?;

    info!("  Merging {} chunks into {}...", chunks.len(), output.display());
    let result = transcoder.concat(&manifest, output, cancel).await;

    if let Err(e) = remove_if_exists(&manifest) {
        warn!("Could not remove {}: {}", manifest.display(), e);
    }
    if result.is_err() {
        if let Err(e) = remove_if_exists(output) {
            warn!("Could not remove partial output {}: {}", output.display(), e);
        }
    }
    result.with_context(|| format!("Failed to merge chunks into {}", output.display()))
}
