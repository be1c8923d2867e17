use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

pub const CHUNK_PREFIX: &str = "chunk_";
pub const CHUNK_EXT: &str = "mp4";
pub const ENCODED_SUFFIX: &str = "_encoded";

/// Written once the segmenter exited cleanly
pub const SPLIT_DONE_MARKER: &str = ".split_done";
/// Written when the chunk loop exited through a handled path
pub const CLEAN_STOP_MARKER: &str = ".resume_clean";

/// One source file moving through split → encode → merge → verify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub source: PathBuf,
    /// Byte size at discovery time
    pub size: u64,
    pub basename: String,
    /// `<source dir>/.tmp_chunks_<basename>`
    pub chunk_dir: PathBuf,
    /// `<output dir>/.tmp_encoded_<basename>`
    pub encoded_dir: PathBuf,
    /// `<output dir>/<basename>.mp4`
    pub final_output: PathBuf,
}

impl WorkUnit {
    pub fn new(source: &Path, size: u64, output_dir: &Path) -> Result<Self> {
        let basename = source
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("Source has no usable file name: {}", source.display()))?
            .to_string();
        let parent = source
            .parent()
            .with_context(|| format!("Source has no parent directory: {}", source.display()))?;

        Ok(Self {
            source: source.to_path_buf(),
            size,
            chunk_dir: parent.join(format!(".tmp_chunks_{}", basename)),
            encoded_dir: output_dir.join(format!(".tmp_encoded_{}", basename)),
            final_output: output_dir.join(format!("{}.{}", basename, CHUNK_EXT)),
            basename,
        })
    }

    /// Create both work directories if they are missing
    pub fn prepare_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.chunk_dir)
            .with_context(|| format!("Failed to create chunk directory: {}", self.chunk_dir.display()))?;
        fs::create_dir_all(&self.encoded_dir)
            .with_context(|| format!("Failed to create encoded directory: {}", self.encoded_dir.display()))?;
        Ok(())
    }

    /// Pattern handed to the segmenter
    pub fn chunk_pattern(&self) -> PathBuf {
        self.chunk_dir.join(format!("{}%03d.{}", CHUNK_PREFIX, CHUNK_EXT))
    }

    /// Encoded counterpart of a source chunk: `chunk_007.mp4` → `chunk_007_encoded.mp4`
    pub fn encoded_path_for(&self, source_chunk: &Path) -> PathBuf {
        let stem = source_chunk
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        self.encoded_dir.join(format!("{}{}.{}", stem, ENCODED_SUFFIX, CHUNK_EXT))
    }

    pub fn split_marker(&self) -> PathBuf {
        self.chunk_dir.join(SPLIT_DONE_MARKER)
    }

    pub fn clean_stop_marker(&self) -> PathBuf {
        self.encoded_dir.join(CLEAN_STOP_MARKER)
    }
}

/// Sequence number of a chunk file name, for either chunk flavour
pub fn chunk_sequence(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(CHUNK_PREFIX)?;
    let stem = rest.strip_suffix(&format!(".{}", CHUNK_EXT))?;
    let digits = stem.strip_suffix(ENCODED_SUFFIX).unwrap_or(stem);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn list_chunks(dir: &Path, encoded: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut chunks: Vec<(u32, PathBuf)> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            let is_encoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.ends_with(ENCODED_SUFFIX))
                .unwrap_or(false);
            is_encoded == encoded
        })
        .filter_map(|path| chunk_sequence(&path).map(|n| (n, path)))
        .collect();

    // Numeric order, so chunk_1000 follows chunk_999
    chunks.sort_by_key(|(n, _)| *n);
    Ok(chunks.into_iter().map(|(_, p)| p).collect())
}

/// Source chunks in a directory, ascending by sequence number
pub fn source_chunks(dir: &Path) -> Result<Vec<PathBuf>> {
    list_chunks(dir, false)
}

/// Encoded chunks in a directory, ascending by sequence number
pub fn encoded_chunks(dir: &Path) -> Result<Vec<PathBuf>> {
    list_chunks(dir, true)
}

/// Size of a file, 0 if it cannot be read
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
