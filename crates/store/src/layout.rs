//! On-disk layout of a store directory
//!
//! ```text
//! <root>/
//!   benchdb.json              format marker
//!   archive.tar               compacted records (may be absent)
//!   staging/
//!     entries/<stamp>-<pid>-<uuid>.data
//!     env/<fingerprint>.json
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk format written by this build
pub const FORMAT_VERSION: u32 = 1;

const MARKER_FILE: &str = "benchdb.json";
const ARCHIVE_FILE: &str = "archive.tar";
const STAGING_DIR: &str = "staging";
/// Extension of staged entry files
pub(crate) const STAGED_ENTRY_EXT: &str = "data";
/// Extension of staged environment files
pub(crate) const STAGED_ENV_EXT: &str = "json";
/// Prefix of in-progress archive rewrites
pub(crate) const ARCHIVE_TEMP_PREFIX: &str = ".archive-";
/// Prefix of in-progress small-file writes
const WRITE_TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    format: serde_json::Value,
}

/// Paths of one store directory
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Layout rooted at `root`; nothing is touched on disk
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compacted archive
    #[must_use]
    pub fn archive(&self) -> PathBuf {
        self.root.join(ARCHIVE_FILE)
    }

    /// Format marker file
    #[must_use]
    pub fn marker(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    /// Directory of staged entry files
    #[must_use]
    pub fn staged_entries_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR).join("entries")
    }

    /// Directory of staged environment snapshots
    #[must_use]
    pub fn staged_env_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR).join("env")
    }

    /// Create the root and check or write the format marker
    pub(crate) fn initialize(&self) -> Result<()> {
        if self.root.is_file() {
            return Err(Error::configuration(format!(
                "Cannot open store {} because a file with that name exists",
                self.root.display()
            )));
        }
        if !self.root.exists() {
            // Parallel creation on a network filesystem can race; create_dir_all tolerates it
            fs::create_dir_all(&self.root)
                .map_err(|e| Error::io(e, &self.root, "create_dir_all"))?;
            tracing::info!(root = %self.root.display(), "Created new store");
        }

        let marker = self.marker();
        if marker.exists() {
            let content =
                fs::read_to_string(&marker).map_err(|e| Error::io(e, &marker, "read"))?;
            let parsed: Marker = serde_json::from_str(&content).map_err(|e| {
                Error::serialization(format!("Invalid marker {}: {e}", marker.display()))
            })?;
            if parsed.format.as_u64() != Some(u64::from(FORMAT_VERSION)) {
                return Err(Error::IncompatibleStore {
                    path: self.root.clone().into_boxed_path(),
                    found: parsed.format.to_string(),
                    expected: FORMAT_VERSION,
                });
            }
            return Ok(());
        }

        let json = serde_json::to_vec(&Marker {
            format: serde_json::Value::from(FORMAT_VERSION),
        })
        .map_err(|e| Error::serialization(format!("Failed to serialize marker: {e}")))?;
        write_atomic(&marker, &json)
    }

    /// Staged entry files, sorted by name (chronological)
    pub(crate) fn staged_entry_files(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.staged_entries_dir(), STAGED_ENTRY_EXT)
    }

    /// Staged environment files, sorted by name
    pub(crate) fn staged_env_files(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.staged_env_dir(), STAGED_ENV_EXT)
    }

    /// Temp files left by interrupted writes
    ///
    /// Archive rewrites in the root, and marker or snapshot writes in the
    /// root and the staged environment directory.
    pub(crate) fn stale_temps(&self) -> Result<Vec<PathBuf>> {
        let mut stale = Vec::new();
        for (dir, prefixes) in [
            (self.root.clone(), &[ARCHIVE_TEMP_PREFIX, WRITE_TEMP_PREFIX][..]),
            (self.staged_env_dir(), &[WRITE_TEMP_PREFIX][..]),
        ] {
            for path in read_dir_paths(&dir)? {
                let is_temp = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| prefixes.iter().any(|p| n.starts_with(p)));
                if is_temp && path.is_file() {
                    stale.push(path);
                }
            }
        }
        stale.sort();
        Ok(stale)
    }
}

fn read_dir_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(e, dir, "read_dir")),
    };
    let mut paths = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| Error::io(e, dir, "read_dir_entry"))?;
        paths.push(entry.path());
    }
    Ok(paths)
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = read_dir_paths(dir)?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == extension) && p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Remove a file, treating "already gone" as success
pub(crate) fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, path, "remove_file")),
    }
}

/// Write a small file via a temp file and atomic rename
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(WRITE_TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| Error::io(e, dir, "create_temp"))?;
    tmp.write_all(data)
        .map_err(|e| Error::io(e, tmp.path(), "write"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
    tmp.persist(path)
        .map_err(|e| Error::io(e.error, path, "rename"))?;
    Ok(())
}
