use std::fmt;
use std::path::{Path, PathBuf};
use anyhow::Result;
use crate::lock;
use crate::unit::{self, WorkUnit};

/// Where a unit would pick up on the next run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeStage {
    /// Nothing split yet
    Fresh,
    /// Claimed by another run (or left behind by a crash)
    Locked,
    /// Split into `chunks`, nothing encoded yet
    Split { chunks: usize },
    /// Chunks before `next_chunk` (1-based) are encoded
    Encoding { next_chunk: usize, total: usize },
    /// Every chunk is encoded; merge is next
    ReadyToMerge { chunks: usize },
    /// Output written but work directories still present (unverified or mismatch)
    Merged,
    /// Source cleaned up, output present
    Done,
}

impl fmt::Display for ResumeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeStage::Fresh => write!(f, "fresh"),
            ResumeStage::Locked => write!(f, "locked"),
            ResumeStage::Split { chunks } => write!(f, "split into {} chunks", chunks),
            ResumeStage::Encoding { next_chunk, total } => {
                write!(f, "encoding, resumes at chunk {}/{}", next_chunk, total)
            }
            ResumeStage::ReadyToMerge { chunks } => write!(f, "all {} chunks encoded, ready to merge", chunks),
            ResumeStage::Merged => write!(f, "merged, awaiting verification"),
            ResumeStage::Done => write!(f, "done"),
        }
    }
}

/// An encoded chunk is reusable once it is larger than the truncation threshold
pub fn is_complete_chunk(path: &Path, min_bytes: u64) -> bool {
    unit::file_size(path) > min_bytes
}

/// The encoded chunk a resumed run must redo.
///
/// Without a clean-stop marker the newest encoded chunk may be a partial write
/// from a killed process, so the last one is distrusted. Earlier chunks were
/// flushed before the next one started.
pub fn distrusted_chunk(encoded: &[PathBuf], clean_stop: bool) -> Option<&PathBuf> {
    if clean_stop {
        None
    } else {
        encoded.last()
    }
}

/// Everything that can be learned about a unit by looking at the disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSnapshot {
    pub source_exists: bool,
    pub locked: bool,
    pub source_chunks: Vec<PathBuf>,
    pub split_marked: bool,
    pub encoded_chunks: Vec<PathBuf>,
    pub clean_stop: bool,
    pub output_exists: bool,
    /// Encoded chunks (by source position) that a resumed run would reuse
    pub reusable: Vec<bool>,
}

impl UnitSnapshot {
    /// 1-based index of the first chunk that still needs encoding
    pub fn next_chunk(&self) -> Option<usize> {
        self.reusable.iter().position(|ok| !ok).map(|i| i + 1)
    }

    pub fn stage(&self) -> ResumeStage {
        if !self.source_exists && self.output_exists {
            return ResumeStage::Done;
        }
        if self.locked {
            return ResumeStage::Locked;
        }
        if self.output_exists {
            return ResumeStage::Merged;
        }
        let total = self.source_chunks.len();
        if total == 0 {
            return ResumeStage::Fresh;
        }
        match self.next_chunk() {
            None => ResumeStage::ReadyToMerge { chunks: total },
            Some(1) if !self.reusable.iter().any(|ok| *ok) => ResumeStage::Split { chunks: total },
            Some(next_chunk) => ResumeStage::Encoding { next_chunk, total },
        }
    }
}

/// Derive a unit's state from its lock marker, work directories and output
pub fn inspect(unit: &WorkUnit, min_encoded_bytes: u64) -> Result<UnitSnapshot> {
    let source_chunks = unit::source_chunks(&unit.chunk_dir)?;
    let encoded_chunks = unit::encoded_chunks(&unit.encoded_dir)?;
    let clean_stop = unit.clean_stop_marker().exists();
    let distrusted = distrusted_chunk(&encoded_chunks, clean_stop);

    let reusable = source_chunks
        .iter()
        .map(|chunk| {
            let encoded = unit.encoded_path_for(chunk);
            Some(&encoded) != distrusted && is_complete_chunk(&encoded, min_encoded_bytes)
        })
        .collect();

    Ok(UnitSnapshot {
        source_exists: unit.source.exists(),
        locked: lock::is_locked(&unit.source),
        split_marked: unit.split_marker().exists(),
        output_exists: unit.final_output.exists(),
        source_chunks,
        encoded_chunks,
        clean_stop,
        reusable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        unit: WorkUnit,
    }

    fn fixture(source_chunks: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("lib/movie.mkv");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"source").unwrap();
        let unit = WorkUnit::new(&source, 6, &dir.path().join("out")).unwrap();
        unit.prepare_dirs().unwrap();
        for i in 1..=source_chunks {
            fs::write(unit.chunk_dir.join(format!("chunk_{:03}.mp4", i)), b"chunk").unwrap();
        }
        Fixture { _dir: dir, unit }
    }

    fn encode(unit: &WorkUnit, i: usize, bytes: usize) {
        let chunk = unit.chunk_dir.join(format!("chunk_{:03}.mp4", i));
        fs::write(unit.encoded_path_for(&chunk), vec![7u8; bytes]).unwrap();
    }

    #[test]
    fn test_fresh_unit() {
        let f = fixture(0);
        assert_eq!(inspect(&f.unit, 1024).unwrap().stage(), ResumeStage::Fresh);
    }

    #[test]
    fn test_split_but_not_encoded() {
        let f = fixture(4);
        let snap = inspect(&f.unit, 1024).unwrap();
        assert_eq!(snap.stage(), ResumeStage::Split { chunks: 4 });
        assert!(!snap.split_marked);
    }

    #[test]
    fn test_crash_distrusts_last_encoded_chunk() {
        let f = fixture(5);
        for i in 1..=3 {
            encode(&f.unit, i, 4096);
        }
        let snap = inspect(&f.unit, 1024).unwrap();
        assert_eq!(snap.reusable, vec![true, true, false, false, false]);
        assert_eq!(snap.stage(), ResumeStage::Encoding { next_chunk: 3, total: 5 });
    }

    #[test]
    fn test_clean_stop_trusts_last_encoded_chunk() {
        let f = fixture(5);
        encode(&f.unit, 1, 4096);
        fs::write(f.unit.clean_stop_marker(), b"").unwrap();
        let snap = inspect(&f.unit, 1024).unwrap();
        assert_eq!(snap.stage(), ResumeStage::Encoding { next_chunk: 2, total: 5 });
    }

    #[test]
    fn test_truncated_chunk_is_not_reused() {
        let f = fixture(3);
        encode(&f.unit, 1, 4096);
        encode(&f.unit, 2, 100);
        fs::write(f.unit.clean_stop_marker(), b"").unwrap();
        let snap = inspect(&f.unit, 1024).unwrap();
        assert_eq!(snap.next_chunk(), Some(2));
    }

    #[test]
    fn test_ready_to_merge_and_merged() {
        let f = fixture(2);
        encode(&f.unit, 1, 4096);
        encode(&f.unit, 2, 4096);
        fs::write(f.unit.clean_stop_marker(), b"").unwrap();
        assert_eq!(inspect(&f.unit, 1024).unwrap().stage(), ResumeStage::ReadyToMerge { chunks: 2 });

        fs::write(&f.unit.final_output, b"merged").unwrap();
        assert_eq!(inspect(&f.unit, 1024).unwrap().stage(), ResumeStage::Merged);

        fs::remove_file(&f.unit.source).unwrap();
        assert_eq!(inspect(&f.unit, 1024).unwrap().stage(), ResumeStage::Done);
    }

    #[test]
    fn test_lock_wins_over_progress() {
        let f = fixture(2);
        encode(&f.unit, 1, 4096);
        fs::write(lock::lock_path(&f.unit.source), b"").unwrap();
        assert_eq!(inspect(&f.unit, 1024).unwrap().stage(), ResumeStage::Locked);
    }
}
