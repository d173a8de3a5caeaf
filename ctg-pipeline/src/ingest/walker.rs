//! Source tree walker (discovery Phase A)
//!
//! Sequential traversal with ignore patterns and symlink-loop detection.
//! The walk is cheap (no file reads); content handling belongs to Phase B.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Files above this size are skipped outright; they are generated bundles
/// or binaries, not analyzable source.
const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Walker errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// General I/O error
    #[error("I/O error: {0}")]
    IoError(String),
}

/// One discovered candidate file, path relative to the walk root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: String,
    pub size: u64,
}

/// Source file walker
pub struct SourceWalker {
    ignore_patterns: Vec<String>,
    max_depth: Option<usize>,
}

impl SourceWalker {
    /// Create a walker with default ignore patterns for VCS metadata and
    /// dependency directories.
    pub fn new() -> Self {
        Self {
            ignore_patterns: vec![
                ".git".to_string(),
                ".svn".to_string(),
                "node_modules".to_string(),
                "target".to_string(),
                "__pycache__".to_string(),
                ".DS_Store".to_string(),
            ],
            max_depth: None,
        }
    }

    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns.extend(patterns);
        self
    }

    /// Enumerate analyzable source files under `root`.
    pub fn walk(&self, root: &Path) -> Result<Vec<DiscoveredFile>, ScanError> {
        if !root.exists() {
            return Err(ScanError::PathNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        let mut discovered = Vec::new();
        let mut symlink_visited = HashSet::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|entry| self.should_process_entry(entry, &mut symlink_visited));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !is_source_file(entry.path()) {
                continue;
            }

            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    tracing::warn!("Error reading metadata for {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if size > MAX_FILE_SIZE {
                tracing::debug!(
                    "Skipping oversized file {} ({} bytes)",
                    entry.path().display(),
                    size
                );
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| ScanError::IoError(e.to_string()))?;

            discovered.push(DiscoveredFile {
                path: relative.to_string_lossy().replace('\\', "/"),
                size,
            });
        }

        // Stable order keeps batch composition reproducible across sweeps
        discovered.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::debug!("Discovery walk found {} source files", discovered.len());
        Ok(discovered)
    }

    fn should_process_entry(
        &self,
        entry: &DirEntry,
        symlink_visited: &mut HashSet<PathBuf>,
    ) -> bool {
        let file_name = entry.file_name().to_string_lossy();

        for pattern in &self.ignore_patterns {
            if file_name == pattern.as_str() {
                return false;
            }
        }

        // Detect symlink loops
        if entry.file_type().is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !symlink_visited.insert(canonical) {
                    tracing::warn!("Symlink loop detected: {}", entry.path().display());
                    return false;
                }
            }
        }

        true
    }
}

impl Default for SourceWalker {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension allowlist for analyzable source files.
fn is_source_file(path: &Path) -> bool {
    let extension = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_lowercase(),
        None => return false,
    };
    matches!(
        extension.as_str(),
        "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" | "py" | "rs" | "go" | "java" | "rb"
            | "c" | "h" | "cpp" | "hpp" | "cc" | "cs" | "php" | "swift" | "kt" | "scala"
    )
}
