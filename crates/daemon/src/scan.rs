//! Scanner module for discovering candidate inputs in a watch folder.
//!
//! Walks the folder, skips hidden directories, the folder's own completed and
//! error areas and every file the orchestrator itself creates, then applies the
//! folder's include/exclude globs to the file name.

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern, PatternError};
use log::debug;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A file discovered during a folder scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    /// Full path to the file.
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
    /// Last modified time of the file.
    pub modified: Option<DateTime<Utc>>,
}

/// Path of the in-progress output for `destination`.
///
/// `/out/movie.mkv` -> `/out/movie.partial.mkv`
pub fn partial_output_path(destination: &Path) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match destination.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    destination.with_file_name(name)
}

/// Path of the human-readable report written next to an errored input.
///
/// `/in/error/movie.mkv` -> `/in/error/movie.mkv.error.txt`
pub fn error_report_path(input: &Path) -> PathBuf {
    let mut report = input.as_os_str().to_owned();
    report.push(".error.txt");
    PathBuf::from(report)
}

/// Path of the marker left next to an input kept in place after completion.
///
/// `/in/movie.mkv` -> `/in/movie.mkv.done`
pub fn done_marker_path(input: &Path) -> PathBuf {
    let mut marker = input.as_os_str().to_owned();
    marker.push(".done");
    PathBuf::from(marker)
}

/// Files created by the orchestrator that must never become jobs.
pub fn is_internal_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    name.starts_with('.')
        || name.ends_with(".lock")
        || name.ends_with(".lock.tmp")
        || name.ends_with(".lock.reclaim")
        || name.ends_with(".error.txt")
        || name.ends_with(".done")
        || name.ends_with(".done.tmp")
        || name.contains(".partial.")
        || name.ends_with(".partial")
}

/// Compiled include/exclude globs, matched case-insensitively against the file name.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl FileFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, PatternError> {
        Ok(Self {
            include: include
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<Result<_, _>>()?,
            exclude: exclude
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    /// True if the name matches at least one include pattern and no exclude pattern.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        // Check exclude patterns first (if any match, reject)
        if let Some(pattern) = self
            .exclude
            .iter()
            .find(|p| p.matches_with(filename, MATCH_OPTIONS))
        {
            debug!("File '{}' excluded by pattern '{}'", filename, pattern);
            return false;
        }

        self.include
            .iter()
            .any(|p| p.matches_with(filename, MATCH_OPTIONS))
    }
}

/// Options for one folder scan.
#[derive(Debug, Clone)]
pub struct ScanOptions<'a> {
    pub recursive: bool,
    /// Directories never descended into (completed/error areas).
    pub skip_dirs: &'a [PathBuf],
    pub filter: &'a FileFilter,
}

/// Scans `root` for candidate files, oldest modification first.
///
/// Fails only if `root` itself cannot be read; unreadable entries below it are skipped.
pub fn scan_folder(root: &Path, options: &ScanOptions<'_>) -> Result<Vec<ScanCandidate>, io::Error> {
    std::fs::read_dir(root).map(drop)?;

    let max_depth = if options.recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            // Skip hidden directories
            let hidden = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            !hidden && !options.skip_dirs.iter().any(|d| d == entry.path())
        });

    let mut candidates = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();

        // Only process files
        if !entry.file_type().is_file() {
            continue;
        }
        if is_internal_file(path) {
            continue;
        }
        if !options.filter.matches(path) {
            debug!("Ignoring {} (pattern filter)", path.display());
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            candidates.push(ScanCandidate {
                path: path.to_path_buf(),
                size_bytes: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
    }

    candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(candidates)
}
