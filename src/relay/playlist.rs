//! Relay playlists: the ordered source files plus a transient concat manifest.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::error::SupervisorError;

/// Lists the media files in `dir` with the given extension, sorted by file
/// name bytes.
///
/// Ordering is lexicographic on purpose (`a-1, a-10, a-2`): segment names
/// carry a `YYYYMMDD_HHMMSS` stamp, so byte order is chronological order.
/// Paths are absolute because the manifest lives elsewhere and the concat
/// demuxer resolves relative entries against the manifest's directory.
pub fn collect_media(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, SupervisorError> {
    let dir = std::fs::canonicalize(dir).map_err(|e| {
        SupervisorError::config(format!(
            "relay source directory {} is not usable: {}",
            dir.display(),
            e
        ))
    })?;
    let entries = std::fs::read_dir(&dir).map_err(|e| {
        SupervisorError::config(format!(
            "relay source directory {} cannot be read: {}",
            dir.display(),
            e
        ))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == extension);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(SupervisorError::config(format!(
            "no .{} files found in {}",
            extension,
            dir.display()
        )));
    }
    files.sort();
    Ok(files)
}

/// One line of an ffmpeg concat manifest. Paths containing single quotes are
/// not supported.
pub fn manifest_entry(path: &Path) -> String {
    format!("file '{}'", path.display())
}

/// Source files for one relay attempt and the manifest listing them.
///
/// The manifest is removed by [`Playlist::discard`], or on drop if the
/// attempt unwinds before reaching it.
#[derive(Debug)]
pub struct Playlist {
    files: Vec<PathBuf>,
    manifest: Option<TempPath>,
}

impl Playlist {
    pub fn build(dir: &Path, extension: &str) -> Result<Self, SupervisorError> {
        let files = collect_media(dir, extension)?;

        let mut manifest = tempfile::Builder::new()
            .prefix("vcr-relay-")
            .suffix(".txt")
            .tempfile()?;
        for file in &files {
            writeln!(manifest, "{}", manifest_entry(file))?;
        }
        manifest.flush()?;

        Ok(Self {
            files,
            manifest: Some(manifest.into_temp_path()),
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn manifest_path(&self) -> &Path {
        self.manifest
            .as_deref()
            .unwrap_or_else(|| Path::new(""))
    }

    /// Deletes the manifest.
    pub fn discard(mut self) -> std::io::Result<()> {
        match self.manifest.take() {
            Some(path) => path.close(),
            None => Ok(()),
        }
    }
}
