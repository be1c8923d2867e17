use std::fs;
use std::io;
use std::path::Path;
use anyhow::{Context, Result};
use log::{info, warn};
use crate::ffprobe::MediaProber;
use crate::unit::WorkUnit;

/// Result of comparing the merged output against its source
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    /// Durations agreed; source and work directories were deleted
    Cleaned { diff_secs: f64 },
    /// Durations disagreed or could not be read; everything was kept
    MismatchKept {
        source_secs: Option<f64>,
        output_secs: Option<f64>,
    },
}

/// Strictly less than the tolerance; a diff exactly at the tolerance is a mismatch
pub fn durations_agree(source_secs: f64, output_secs: f64, tolerance_secs: f64) -> bool {
    (source_secs - output_secs).abs() < tolerance_secs
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove {}", dir.display()))
        }
        _ => Ok(()),
    }
}

async fn probed_duration<P: MediaProber>(prober: &P, path: &Path) -> Option<f64> {
    match prober.probe(path).await {
        Ok(info) if info.duration > 0.0 => Some(info.duration),
        Ok(_) => {
            warn!("  No usable duration for {}", path.display());
            None
        }
        Err(e) => {
            warn!("  Could not probe {}: {:#}", path.display(), e);
            None
        }
    }
}

/// Compare durations and, when they match, delete the source and both work
/// directories. Nothing is deleted unless both durations are known.
pub async fn verify_and_cleanup<P: MediaProber>(
    prober: &P,
    unit: &WorkUnit,
    tolerance_secs: f64,
) -> Result<VerifyOutcome> {
    info!("  Verifying durations...");
    let source_secs = probed_duration(prober, &unit.source).await;
    let output_secs = probed_duration(prober, &unit.final_output).await;

    let (src, out) = match (source_secs, output_secs) {
        (Some(src), Some(out)) => (src, out),
        _ => {
            warn!("  ⚠️ Could not verify {}; keeping source files", unit.source.display());
            return Ok(VerifyOutcome::MismatchKept { source_secs, output_secs });
        }
    };

    let diff = (src - out).abs();
    if !durations_agree(src, out, tolerance_secs) {
        warn!(
            "  ⚠️ WARNING: Duration mismatch ({:.2}s vs {:.2}s). Keeping source files.",
            src, out
        );
        return Ok(VerifyOutcome::MismatchKept { source_secs, output_secs });
    }

    info!("  ✅ Success! Durations match (diff: {:.2}s).", diff);
    info!("  Deleting original and temp files...");
    fs::remove_file(&unit.source)
        .with_context(|| format!("Failed to delete source {}", unit.source.display()))?;
    remove_dir_if_exists(&unit.chunk_dir)?;
    remove_dir_if_exists(&unit.encoded_dir)?;

    Ok(VerifyOutcome::Cleaned { diff_secs: diff })
}
