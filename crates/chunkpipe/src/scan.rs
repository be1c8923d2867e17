use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use walkdir::{DirEntry, WalkDir};
use log::{debug, info, warn};
use crate::lock;

/// Media container extensions considered for transcoding
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg"];

/// Order in which candidates are returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOrder {
    LargestFirst,
    SmallestFirst,
}

/// A media file found under the library root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// Size in bytes at discovery time
    pub size: u64,
}

/// Check whether a path carries one of the known media extensions (case-insensitive)
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(entry: &DirEntry) -> bool {
    // The root itself may legitimately live under a dot-directory
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

/// Walk `root` depth-first, skipping hidden entries and the `exclude` subtree
fn walk_visible<'a>(root: &Path, exclude: Option<&'a Path>) -> impl Iterator<Item = DirEntry> + 'a {
    let root_display = root.display().to_string();
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |e| !is_hidden(e) && exclude.map(|x| e.path() != x).unwrap_or(true))
        .filter_map(move |entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!("Error reading directory entry under {}: {}", root_display, e);
                None
            }
        })
}

/// Enumerate media files under `root`, ordered by size.
///
/// Hidden files and directories (relative to `root`) are skipped, as is the
/// `exclude` directory (normally the output directory). Files that vanish
/// while being enumerated are skipped silently.
pub fn scan_media(root: &Path, order: SizeOrder, exclude: Option<&Path>) -> Result<Vec<Candidate>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve library root: {}", root.display()))?;
    let exclude = exclude.and_then(|p| p.canonicalize().ok());

    info!("Scanning directory: {}", root.display());

    let mut candidates = Vec::new();
    let mut files_checked = 0usize;

    for entry in walk_visible(&root, exclude.as_deref()) {
        if !entry.file_type().is_file() {
            continue;
        }
        files_checked += 1;

        let path = entry.path();
        if !is_media_file(path) {
            continue;
        }

        // Gone between readdir and stat: another process got there first
        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                debug!("Skipping {} (could not stat: {})", path.display(), e);
                continue;
            }
        };

        debug!("Found media file: {} ({} bytes)", path.display(), size);
        candidates.push(Candidate {
            path: path.to_path_buf(),
            size,
        });
    }

    match order {
        SizeOrder::LargestFirst => candidates.sort_by(|a, b| b.size.cmp(&a.size)),
        SizeOrder::SmallestFirst => candidates.sort_by(|a, b| a.size.cmp(&b.size)),
    }

    info!(
        "Scan complete: checked {} files, found {} media files",
        files_checked,
        candidates.len()
    );
    Ok(candidates)
}

/// Find lock markers that belong to media files under `root`
pub fn find_lock_markers(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        anyhow::bail!("Not a directory: {}", root.display());
    }

    let markers = walk_visible(root, None)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let path = e.into_path();
            lock::locked_source(&path)
                .filter(|source| is_media_file(source))
                .map(|_| path)
        })
        .collect();
    Ok(markers)
}
