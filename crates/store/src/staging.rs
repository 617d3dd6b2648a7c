//! Lock-free staging of new entries
//!
//! Each writer appends JSON lines to a file only it ever writes, named
//! `<UTC timestamp>-<pid>-<sequence>-<uuid>.data`. No shared counter, lock file or
//! advisory lock is involved, so independent processes on a network
//! filesystem can stage into the same store concurrently. Readers list the
//! directory and tolerate lines that are still being written.

use crate::config::StoreConfig;
use crate::entry::Entry;
use crate::layout::{STAGED_ENTRY_EXT, StoreLayout};
use crate::{Error, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Appends staged entries for one store handle
#[derive(Debug)]
pub(crate) struct StagingWriter {
    dir: PathBuf,
    current: PathBuf,
    max_file_bytes: u64,
    sync_writes: bool,
}

/// Orders files created by this process within the same microsecond
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn unique_file_name() -> String {
    format!(
        "{}-{}-{:06}-{}.{STAGED_ENTRY_EXT}",
        Utc::now().format("%Y%m%dT%H%M%S%6f"),
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed),
        Uuid::new_v4().simple()
    )
}

impl StagingWriter {
    pub fn new(layout: &StoreLayout, config: &StoreConfig) -> Self {
        let dir = layout.staged_entries_dir();
        let current = dir.join(unique_file_name());
        Self {
            dir,
            current,
            max_file_bytes: config.max_staged_file_bytes,
            sync_writes: config.sync_writes,
        }
    }

    /// File the next write goes to
    pub fn current_path(&self) -> &Path {
        &self.current
    }

    /// Start a new file for subsequent writes
    pub fn rotate(&mut self) {
        self.current = self.dir.join(unique_file_name());
    }

    /// Append a batch of entries as one write
    pub fn append(&mut self, entries: &[&Entry]) -> Result<PathBuf> {
        if entries.is_empty() {
            return Ok(self.current.clone());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)
                .map_err(|e| Error::serialization(format!("Failed to serialize entry: {e}")))?;
            buf.push(b'\n');
        }

        fs::create_dir_all(&self.dir).map_err(|e| Error::io(e, &self.dir, "create_dir_all"))?;
        let path = self.current.clone();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path, "open"))?;
        file.write_all(&buf)
            .map_err(|e| Error::io(e, &path, "write"))?;
        if self.sync_writes {
            file.sync_data().map_err(|e| Error::io(e, &path, "sync"))?;
        }

        let len = file
            .metadata()
            .map_err(|e| Error::io(e, &path, "metadata"))?
            .len();
        if len == 0 {
            return Err(Error::io(
                io::Error::new(io::ErrorKind::WriteZero, "staged file is empty after write"),
                &path,
                "write",
            ));
        }
        tracing::debug!(file = %path.display(), entries = entries.len(), bytes = len, "Staged entries");

        if len >= self.max_file_bytes {
            self.rotate();
            tracing::debug!(
                full = %path.display(),
                next = %self.current.display(),
                "Rotated staging file"
            );
        }
        Ok(path)
    }
}

/// Line-by-line reader over one staged file
pub(crate) struct StagedFileReader {
    path: PathBuf,
    reader: BufReader<File>,
    line_no: usize,
}

impl StagedFileReader {
    /// Open a staged file; `Ok(None)` if it vanished (compacted meanwhile)
    pub fn open(path: &Path) -> Result<Option<Self>> {
        match File::open(path) {
            Ok(file) => Ok(Some(Self {
                path: path.to_path_buf(),
                reader: BufReader::new(file),
                line_no: 0,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(file = %path.display(), "Staged file disappeared before reading");
                Ok(None)
            }
            Err(e) => Err(Error::io(e, path, "open")),
        }
    }

    /// Next non-empty line, without its terminator
    pub fn next_line(&mut self) -> Result<Option<(usize, Vec<u8>)>> {
        loop {
            let mut line = Vec::new();
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .map_err(|e| Error::io(e, &self.path, "read"))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some((self.line_no, line)));
        }
    }

    /// Next line that parses as `T`; unparseable lines are logged and skipped
    pub fn next_parsed<T: DeserializeOwned>(&mut self) -> Result<Option<(Vec<u8>, T)>> {
        while let Some((line_no, line)) = self.next_line()? {
            match serde_json::from_slice(&line) {
                Ok(parsed) => return Ok(Some((line, parsed))),
                Err(e) => {
                    // Partial write of a killed process, or a network filesystem lagging behind
                    tracing::warn!(
                        file = %self.path.display(),
                        line = line_no,
                        "Skipping unreadable staged line: {e}"
                    );
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{FingerprintProbe, Outcome, Parameters};
    use crate::environment::EnvironmentSnapshot;
    use tempfile::TempDir;

    fn entry(x: i64) -> Entry {
        let env = EnvironmentSnapshot::default().fingerprint().unwrap();
        Entry::new(Parameters::new("f").arg("x", x), Outcome::new(x), env).unwrap()
    }

    fn writer(tmp: &TempDir, max_file_bytes: u64) -> (StoreLayout, StagingWriter) {
        let layout = StoreLayout::new(tmp.path());
        let config = StoreConfig {
            max_staged_file_bytes: max_file_bytes,
            sync_writes: false,
            ..StoreConfig::default()
        };
        let writer = StagingWriter::new(&layout, &config);
        (layout, writer)
    }

    #[test]
    fn file_names_are_unique() {
        let a = unique_file_name();
        let b = unique_file_name();
        assert_ne!(a, b);
        assert!(a.ends_with(".data"));
        assert!(a.contains(&format!("-{}-", std::process::id())));
    }

    #[test]
    fn append_creates_directory_and_file() {
        let tmp = TempDir::new().unwrap();
        let (layout, mut writer) = writer(&tmp, u64::MAX);
        let path = writer.append(&[&entry(1)]).unwrap();
        assert!(path.starts_with(layout.staged_entries_dir()));
        writer.append(&[&entry(2), &entry(3)]).unwrap();

        let files = layout.staged_entry_files().unwrap();
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn rotates_when_file_is_full() {
        let tmp = TempDir::new().unwrap();
        let (layout, mut writer) = writer(&tmp, 1);
        let first = writer.append(&[&entry(1)]).unwrap();
        assert_ne!(writer.current_path(), first);
        writer.append(&[&entry(2)]).unwrap();
        assert_eq!(layout.staged_entry_files().unwrap().len(), 2);
    }

    #[test]
    fn reader_skips_partial_lines() {
        let tmp = TempDir::new().unwrap();
        let (layout, mut writer) = writer(&tmp, u64::MAX);
        let path = writer.append(&[&entry(1)]).unwrap();
        // Simulate a writer killed mid-line, followed by another complete write
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"parameters\": {\"func\"").unwrap();
        file.write_all(b"\n\n").unwrap();
        drop(file);
        writer.append(&[&entry(2)]).unwrap();

        let files = layout.staged_entry_files().unwrap();
        let mut reader = StagedFileReader::open(&files[0]).unwrap().unwrap();
        let mut xs = Vec::new();
        while let Some((_, parsed)) = reader.next_parsed::<Entry>().unwrap() {
            xs.push(parsed.parameters.args["x"].as_i64().unwrap());
        }
        assert_eq!(xs, vec![1, 2]);
    }

    #[test]
    fn fingerprint_only_parsing_matches_entries() {
        let tmp = TempDir::new().unwrap();
        let (_, mut writer) = writer(&tmp, u64::MAX);
        let e = entry(5);
        let path = writer.append(&[&e]).unwrap();
        let mut reader = StagedFileReader::open(&path).unwrap().unwrap();
        let (_, probe) = reader.next_parsed::<FingerprintProbe>().unwrap().unwrap();
        assert_eq!(probe.args_fingerprint, e.args_fingerprint);
        assert!(reader.next_line().unwrap().is_none());
    }

    #[test]
    fn vanished_file_opens_as_none() {
        let tmp = TempDir::new().unwrap();
        assert!(
            StagedFileReader::open(&tmp.path().join("gone.data"))
                .unwrap()
                .is_none()
        );
    }
}
