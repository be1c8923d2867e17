use std::fmt;
use std::path::PathBuf;
use anyhow::Result;
use chrono::{DateTime, Local};
use log::{error, info};
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::encode::{ChunkEncoder, EncodeRun};
use crate::ffprobe::MediaProber;
use crate::lock::{self, LockGuard};
use crate::merge;
use crate::progress::ProgressSink;
use crate::scan::Candidate;
use crate::split;
use crate::state::{self, ResumeStage};
use crate::transcoder::Transcoder;
use crate::unit::WorkUnit;
use crate::verify::{self, VerifyOutcome};

/// Stage a unit was in, reported when it fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStage {
    Claiming,
    Probing,
    Splitting,
    Encoding,
    Merging,
    Verifying,
}

impl fmt::Display for UnitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitStage::Claiming => "claim",
            UnitStage::Probing => "probe",
            UnitStage::Splitting => "split",
            UnitStage::Encoding => "encode",
            UnitStage::Merging => "merge",
            UnitStage::Verifying => "verify",
        };
        f.write_str(name)
    }
}

/// How a single unit ended in this run
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// Output verified; source and work directories deleted
    Cleaned { diff_secs: f64 },
    /// Output written but not verified; everything kept
    MismatchKept {
        source_secs: Option<f64>,
        output_secs: Option<f64>,
    },
    /// Cancelled before the output was produced
    Incomplete { next_chunk: Option<usize> },
    Failed { stage: UnitStage, error: String },
    /// Another run holds the lock (or a crashed run left it behind)
    SkippedLocked,
    /// Source disappeared between discovery and processing
    Missing,
}

impl UnitOutcome {
    /// A merged output exists for this unit
    pub fn is_processed(&self) -> bool {
        matches!(self, UnitOutcome::Cleaned { .. } | UnitOutcome::MismatchKept { .. })
    }
}

impl From<VerifyOutcome> for UnitOutcome {
    fn from(v: VerifyOutcome) -> Self {
        match v {
            VerifyOutcome::Cleaned { diff_secs } => UnitOutcome::Cleaned { diff_secs },
            VerifyOutcome::MismatchKept { source_secs, output_secs } => {
                UnitOutcome::MismatchKept { source_secs, output_secs }
            }
        }
    }
}

/// Totals for one run over the library
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub found: usize,
    pub processed: usize,
    pub cleaned: usize,
    pub mismatched: usize,
    pub failed: usize,
    pub skipped_locked: usize,
    pub missing: usize,
    pub incomplete: usize,
    pub stopped_by_cancel: bool,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub outcomes: Vec<(PathBuf, UnitOutcome)>,
}

impl RunSummary {
    pub fn new(found: usize) -> Self {
        let now = Local::now();
        Self {
            found,
            processed: 0,
            cleaned: 0,
            mismatched: 0,
            failed: 0,
            skipped_locked: 0,
            missing: 0,
            incomplete: 0,
            stopped_by_cancel: false,
            started_at: now,
            finished_at: now,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, source: PathBuf, outcome: UnitOutcome) {
        if outcome.is_processed() {
            self.processed += 1;
        }
        match &outcome {
            UnitOutcome::Cleaned { .. } => self.cleaned += 1,
            UnitOutcome::MismatchKept { .. } => self.mismatched += 1,
            UnitOutcome::Incomplete { .. } => self.incomplete += 1,
            UnitOutcome::Failed { .. } => self.failed += 1,
            UnitOutcome::SkippedLocked => self.skipped_locked += 1,
            UnitOutcome::Missing => self.missing += 1,
        }
        self.outcomes.push((source, outcome));
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// The chunked transcode pipeline over a prober and a transcoder
pub struct Pipeline<P, T> {
    cfg: PipelineConfig,
    prober: P,
    transcoder: T,
}

impl<P: MediaProber, T: Transcoder> Pipeline<P, T> {
    pub fn new(cfg: PipelineConfig, prober: P, transcoder: T) -> Self {
        Self { cfg, prober, transcoder }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    pub fn transcoder(&self) -> &T {
        &self.transcoder
    }

    /// Process candidates in order until done or cancelled.
    ///
    /// A failed unit does not stop the run. Once cancellation is observed the
    /// current unit ends as its stage allows and no further unit starts.
    pub async fn run(
        &self,
        candidates: &[Candidate],
        cancel: &CancelToken,
        sink: &mut dyn ProgressSink,
    ) -> RunSummary {
        let total = candidates.len();
        let mut summary = RunSummary::new(total);

        for (i, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Process stopped by user.");
                summary.stopped_by_cancel = true;
                break;
            }

            let outcome = self.process_unit(i + 1, total, candidate, cancel, sink).await;
            let finished = outcome.is_processed();
            summary.record(candidate.path.clone(), outcome);

            if cancel.is_cancelled() {
                if finished {
                    info!("Finished last file completion. Stopping now.");
                }
                summary.stopped_by_cancel = true;
                break;
            }
        }

        summary.finished_at = Local::now();
        summary
    }

    /// Claim one candidate and take it as far as possible.
    ///
    /// The lock is released on every exit path.
    pub async fn process_unit(
        &self,
        position: usize,
        total: usize,
        candidate: &Candidate,
        cancel: &CancelToken,
        sink: &mut dyn ProgressSink,
    ) -> UnitOutcome {
        let path = &candidate.path;

        if lock::is_locked(path) {
            info!("[{}/{}] Skipping (locked): {}", position, total, path.display());
            return UnitOutcome::SkippedLocked;
        }
        if !path.exists() {
            info!("[{}/{}] Skipping (missing): {}", position, total, path.display());
            return UnitOutcome::Missing;
        }

        let _guard = match LockGuard::acquire(path) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("[{}/{}] Skipping (locked): {}", position, total, path.display());
                return UnitOutcome::SkippedLocked;
            }
            Err(e) => {
                error!("❌ Could not lock {}: {:#}", path.display(), e);
                return UnitOutcome::Failed {
                    stage: UnitStage::Claiming,
                    error: format!("{:#}", e),
                };
            }
        };

        info!("[{}/{}] Processing: {}", position, total, path.display());

        let mut stage = UnitStage::Claiming;
        match self.run_stages(candidate, &mut stage, cancel, sink).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("❌ Error processing {} during {}: {:#}", path.display(), stage, e);
                UnitOutcome::Failed {
                    stage,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    async fn run_stages(
        &self,
        candidate: &Candidate,
        stage: &mut UnitStage,
        cancel: &CancelToken,
        sink: &mut dyn ProgressSink,
    ) -> Result<UnitOutcome> {
        let unit = WorkUnit::new(&candidate.path, candidate.size, &self.cfg.output_dir)?;

        *stage = UnitStage::Probing;
        let info = self.prober.probe_or_unknown(&unit.source).await;
        info!(
            "  Duration: {:.2}s, Size: {}, Codec: {}, Resolution: {}",
            info.duration,
            humansize::format_size(unit.size, humansize::BINARY),
            info.codec,
            info.resolution()
        );
        unit.prepare_dirs()?;

        *stage = UnitStage::Splitting;
        let chunks = match split::split_source(&self.transcoder, &unit, info.duration, &self.cfg, cancel).await {
            Ok(chunks) => chunks,
            Err(e) if cancel.is_hard() => {
                info!("  Split of {} stopped: {:#}", unit.basename, e);
                return Ok(UnitOutcome::Incomplete { next_chunk: None });
            }
            Err(e) => return Err(e),
        };
        if cancel.is_cancelled() {
            info!("  Cancelled after split; {} will resume at encoding", unit.basename);
            return Ok(UnitOutcome::Incomplete { next_chunk: None });
        }

        *stage = UnitStage::Encoding;
        let encoded = match ChunkEncoder::new(&self.cfg, &self.prober, &self.transcoder)
            .encode_all(&unit, &chunks, cancel, sink)
            .await?
        {
            EncodeRun::Complete(encoded) => encoded,
            EncodeRun::Interrupted { next_chunk } => {
                info!("  {} left incomplete; resumes at chunk {}/{}", unit.basename, next_chunk, chunks.len());
                return Ok(UnitOutcome::Incomplete {
                    next_chunk: Some(next_chunk),
                });
            }
        };

        *stage = UnitStage::Merging;
        merge::ensure_gap_free(&unit, &chunks, &encoded)?;
        if let Err(e) = merge::merge_chunks(&self.transcoder, &encoded, &unit.final_output, cancel).await {
            if cancel.is_hard() {
                info!("  Merge of {} stopped; every chunk is kept for the next run", unit.basename);
                return Ok(UnitOutcome::Incomplete { next_chunk: None });
            }
            return Err(e);
        }

        *stage = UnitStage::Verifying;
        let verified = verify::verify_and_cleanup(&self.prober, &unit, self.cfg.duration_tolerance_secs).await?;
        Ok(verified.into())
    }

    /// Resume stage of every candidate, derived from disk only
    pub fn status(&self, candidates: &[Candidate]) -> Result<Vec<(PathBuf, ResumeStage)>> {
        candidates
            .iter()
            .map(|c| {
                let unit = WorkUnit::new(&c.path, c.size, &self.cfg.output_dir)?;
                let snapshot = state::inspect(&unit, self.cfg.min_encoded_chunk_bytes)?;
                Ok((c.path.clone(), snapshot.stage()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::cancel::CancelLevel;
    use crate::progress::NullProgress;
    use crate::scan::{scan_media, SizeOrder};
    use crate::testing::{FakeProber, FakeTranscoder, Library, RecordingSink};
    use crate::unit;

    const MIB: u64 = 1024 * 1024;

    fn pipeline(lib: &Library, transcoder: FakeTranscoder) -> Pipeline<FakeProber, FakeTranscoder> {
        Pipeline::new(lib.config(), FakeProber, transcoder)
    }

    fn unit_for(lib: &Library, c: &Candidate) -> WorkUnit {
        WorkUnit::new(&c.path, c.size, &lib.out).unwrap()
    }

    #[tokio::test]
    async fn test_full_run_then_idempotent_rerun() {
        let lib = Library::new();
        lib.add_source("a.mkv", 120.0);
        lib.add_source("shows/b.avi", 45.0);
        lib.add_source("notes.txt", 1.0);

        let p = pipeline(&lib, FakeTranscoder::default());
        let candidates = scan_media(&lib.root, SizeOrder::LargestFirst, Some(&lib.out)).unwrap();
        assert_eq!(candidates.len(), 2);

        let summary = p.run(&candidates, &CancelToken::new(), &mut NullProgress).await;
        assert_eq!(summary.found, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.cleaned, 2);
        assert!(!summary.stopped_by_cancel);
        assert!(lib.out.join("a.mp4").exists());
        assert!(lib.out.join("b.mp4").exists());
        assert!(!lib.root.join("a.mkv").exists());
        assert!(!lib.root.join(".tmp_chunks_a").exists());
        assert!(!lib.out.join(".tmp_encoded_a").exists());
        assert!(!lib.root.join("a.mkv.lock").exists());

        let rerun = scan_media(&lib.root, SizeOrder::LargestFirst, Some(&lib.out)).unwrap();
        assert!(rerun.is_empty());
        let summary = p.run(&rerun, &CancelToken::new(), &mut NullProgress).await;
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn test_feature_length_source_is_cut_into_twelve_chunks() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 3600.0, 1_200_000_000);
        let p = pipeline(&lib, FakeTranscoder::default());
        let mut sink = RecordingSink::default();

        let outcome = p.process_unit(1, 1, &c, &CancelToken::new(), &mut sink).await;

        assert!(matches!(outcome, UnitOutcome::Cleaned { .. }));
        assert_eq!(p.transcoder().encoded_inputs().len(), 12);
        assert_eq!(p.transcoder().concat_orders()[0].len(), 12);
        assert_eq!(sink.started, (1..=12).collect::<Vec<_>>());
        let merged = fs::read_to_string(lib.out.join("film.mp4")).unwrap();
        assert!(merged.contains("# chunk_001.mp4"));
    }

    #[tokio::test]
    async fn test_soft_cancel_on_middle_chunk_then_resume() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 500.0, 500 * MIB);
        let other = lib.candidate("other.mkv", 50.0, 10 * MIB);
        let candidates = vec![c.clone(), other.clone()];
        let unit = unit_for(&lib, &c);

        let p = pipeline(&lib, FakeTranscoder::default().cancel_during(2, CancelLevel::Soft));
        let summary = p.run(&candidates, &CancelToken::new(), &mut NullProgress).await;

        assert!(summary.stopped_by_cancel);
        assert_eq!(summary.incomplete, 1);
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].1, UnitOutcome::Incomplete { next_chunk: Some(2) });
        assert!(!unit.final_output.exists());
        assert!(!lock::is_locked(&c.path));
        assert!(other.path.exists());
        assert_eq!(
            p.status(&[c.clone()]).unwrap()[0].1,
            ResumeStage::Encoding { next_chunk: 2, total: 5 }
        );

        let resumed = pipeline(&lib, FakeTranscoder::default());
        let summary = resumed.run(&candidates, &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.cleaned, 2);
        assert_eq!(resumed.transcoder().split_calls(), 1);
        let encoded = resumed.transcoder().encoded_inputs();
        assert_eq!(&encoded[..4], ["chunk_002.mp4", "chunk_003.mp4", "chunk_004.mp4", "chunk_005.mp4"]);
        assert!(unit.final_output.exists());
        assert!(!c.path.exists());
    }

    #[tokio::test]
    async fn test_soft_cancel_on_last_chunk_still_finishes_unit() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 300.0, 300 * MIB);
        let next = lib.candidate("next.mkv", 50.0, 10 * MIB);

        let p = pipeline(&lib, FakeTranscoder::default().cancel_during(3, CancelLevel::Soft));
        let summary = p.run(&[c.clone(), next.clone()], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.cleaned, 1);
        assert!(summary.stopped_by_cancel);
        assert!(lib.out.join("film.mp4").exists());
        // The next unit never started
        assert!(next.path.exists());
        assert!(!lib.out.join("next.mp4").exists());
    }

    #[tokio::test]
    async fn test_killed_last_chunk_is_retried_to_completion() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 300.0, 300 * MIB);
        let transcoder = FakeTranscoder::default()
            .cancel_during(3, CancelLevel::Soft)
            .fail_encode(3, 1);

        let p = pipeline(&lib, transcoder);
        let summary = p.run(&[c], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.cleaned, 1);
        assert_eq!(
            p.transcoder().encoded_inputs().iter().filter(|n| *n == "chunk_003.mp4").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_hard_cancel_leaves_unit_incomplete() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 300.0, 300 * MIB);

        let p = pipeline(&lib, FakeTranscoder::default().cancel_during(3, CancelLevel::Hard));
        let summary = p.run(&[c.clone()], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.outcomes[0].1, UnitOutcome::Incomplete { next_chunk: Some(3) });
        assert!(!lock::is_locked(&c.path));
        assert!(c.path.exists());
    }

    #[tokio::test]
    async fn test_failure_moves_on_to_next_unit() {
        let lib = Library::new();
        let bad = lib.candidate("bad.mkv", 300.0, 300 * MIB);
        let good = lib.candidate("good.mkv", 50.0, 10 * MIB);

        let p = pipeline(&lib, FakeTranscoder::default().fail_encode(2, 1));
        let summary = p.run(&[bad.clone(), good], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cleaned, 1);
        assert!(matches!(
            &summary.outcomes[0].1,
            UnitOutcome::Failed { stage: UnitStage::Encoding, .. }
        ));
        assert!(!lock::is_locked(&bad.path));
        assert!(bad.path.exists());
    }

    #[tokio::test]
    async fn test_duration_mismatch_keeps_source() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 3600.0, 1_200_000_000);

        let p = pipeline(&lib, FakeTranscoder::default().concat_drift(11.0));
        let summary = p.run(&[c.clone()], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.mismatched, 1);
        assert!(c.path.exists());
        assert!(lib.out.join("film.mp4").exists());
        assert!(lib.root.join(".tmp_chunks_film").exists());
        assert!(lib.out.join(".tmp_encoded_film").exists());
    }

    #[tokio::test]
    async fn test_duration_within_tolerance_cleans() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 3600.0, 1_200_000_000);

        let p = pipeline(&lib, FakeTranscoder::default().concat_drift(9.5));
        let summary = p.run(&[c.clone()], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.cleaned, 1);
        assert!(!c.path.exists());
    }

    #[tokio::test]
    async fn test_locked_and_missing_sources_are_skipped() {
        let lib = Library::new();
        let locked = lib.candidate("locked.mkv", 50.0, 10 * MIB);
        fs::write(lock::lock_path(&locked.path), b"").unwrap();
        let gone = lib.candidate("gone.mkv", 50.0, 10 * MIB);
        fs::remove_file(&gone.path).unwrap();

        let p = pipeline(&lib, FakeTranscoder::default());
        let summary = p.run(&[locked.clone(), gone], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.skipped_locked, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.processed, 0);
        // Someone else's lock is left alone
        assert!(lock::is_locked(&locked.path));
        assert_eq!(p.transcoder().split_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start_processes_nothing() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 50.0, 10 * MIB);
        let cancel = CancelToken::new();
        cancel.request(CancelLevel::Soft);

        let p = pipeline(&lib, FakeTranscoder::default());
        let summary = p.run(&[c], &cancel, &mut NullProgress).await;

        assert!(summary.stopped_by_cancel);
        assert!(summary.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_hard_cancel_during_split_resplits_on_next_run() {
        let lib = Library::new();
        let c = lib.candidate("film.mkv", 300.0, 300 * MIB);
        let unit = unit_for(&lib, &c);

        let p = pipeline(&lib, FakeTranscoder::default().cancel_during_split(CancelLevel::Hard));
        let summary = p.run(&[c.clone()], &CancelToken::new(), &mut NullProgress).await;

        assert_eq!(summary.outcomes[0].1, UnitOutcome::Incomplete { next_chunk: None });
        assert!(summary.stopped_by_cancel);
        assert!(!lock::is_locked(&c.path));
        assert!(unit::source_chunks(&unit.chunk_dir).unwrap().is_empty());
        assert!(!unit.split_marker().exists());

        let resumed = pipeline(&lib, FakeTranscoder::default());
        let summary = resumed.run(&[c.clone()], &CancelToken::new(), &mut NullProgress).await;
        assert_eq!(summary.cleaned, 1);
        assert!(unit.final_output.exists());
    }
}
