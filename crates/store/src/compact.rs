//! Archive rewrites: compaction and entry-level transformations
//!
//! Every rewrite streams the current archive and the staged files into a
//! fresh archive next to the old one, then renames it into place. Entries go
//! first (old archive, then staged files by name, then lines in file order),
//! the environment section follows. Only after the rename are the merged
//! staged files removed; a crash before that point leaves them to be merged
//! again, a crash after it leaves nothing behind but a stale temp file.
//!
//! All rewrites require exclusive access to the store.

use crate::archive::{ArchiveWriter, Record, RecordReader, Section};
use crate::entry::Entry;
use crate::environment::read_staged;
use crate::fingerprint::Fingerprint;
use crate::layout::{StoreLayout, remove_file_if_exists};
use crate::staging::StagedFileReader;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;

/// Summary of one archive rewrite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Entry records in the new archive
    pub entries: usize,
    /// Environment records in the new archive
    pub environments: usize,
    /// Staged entry files merged and removed
    pub staged_files_merged: usize,
    /// Staged lines that did not parse and were dropped
    pub skipped_lines: usize,
    /// Entries dropped by the transformation
    pub removed: usize,
}

type Transform<'a> = dyn FnMut(Entry) -> Option<Entry> + 'a;

/// What a rewrite does to each entry
pub(crate) struct Rewrite<'a> {
    transform: Option<&'a mut Transform<'a>>,
    collect_garbage: bool,
}

impl<'a> Rewrite<'a> {
    /// Plain compaction: every entry is kept byte for byte
    pub fn merge() -> Self {
        Self {
            transform: None,
            collect_garbage: false,
        }
    }

    /// Pass every entry through `f`; `None` drops it
    ///
    /// Environment snapshots no longer referenced afterwards are dropped too.
    pub fn transform(f: &'a mut Transform<'a>) -> Self {
        Self {
            transform: Some(f),
            collect_garbage: true,
        }
    }
}

struct Rewriter<'l, 'a> {
    layout: &'l StoreLayout,
    writer: ArchiveWriter,
    rewrite: Rewrite<'a>,
    referenced: HashSet<Fingerprint>,
    report: CompactionReport,
}

impl Rewriter<'_, '_> {
    fn emit(&mut self, entry: Entry) -> Result<()> {
        self.referenced.insert(entry.env_fingerprint.clone());
        self.writer.append_entry(&entry)
    }

    fn copy_archived_entries(&mut self) -> Result<()> {
        let archive = self.layout.archive();
        let Some(mut reader) = RecordReader::open(&archive)? else {
            return Ok(());
        };
        while let Some(raw) = reader.next_member(true)? {
            if raw.section != Section::Entries {
                continue;
            }
            let entry = match raw.decode() {
                Ok(Record::Entry(entry)) => *entry,
                Ok(Record::Environment(..)) => continue,
                Err(reason) => return Err(Error::corrupt(&archive, raw.offset, reason)),
            };
            match self.rewrite.transform.as_mut() {
                None => {
                    self.referenced.insert(entry.env_fingerprint);
                    self.writer.append_raw(&raw)?;
                }
                Some(f) => match f(entry) {
                    Some(kept) => self.emit(kept)?,
                    None => self.report.removed += 1,
                },
            }
        }
        Ok(())
    }

    fn merge_staged_entries(&mut self, files: &[std::path::PathBuf]) -> Result<()> {
        for path in files {
            let Some(mut reader) = StagedFileReader::open(path)? else {
                continue;
            };
            while let Some((line_no, line)) = reader.next_line()? {
                let entry: Entry = match serde_json::from_slice(&line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(
                            file = %path.display(),
                            line = line_no,
                            "Dropping unreadable staged line during compaction: {e}"
                        );
                        self.report.skipped_lines += 1;
                        continue;
                    }
                };
                match self.rewrite.transform.as_mut() {
                    None => {
                        self.referenced.insert(entry.env_fingerprint.clone());
                        self.writer.append_entry_json(&entry.args_fingerprint, &line)?;
                    }
                    Some(f) => match f(entry) {
                        Some(kept) => self.emit(kept)?,
                        None => self.report.removed += 1,
                    },
                }
            }
            self.report.staged_files_merged += 1;
        }
        Ok(())
    }

    fn wanted(&self, fingerprint: &Fingerprint) -> bool {
        !self.rewrite.collect_garbage || self.referenced.contains(fingerprint)
    }

    fn merge_environments(&mut self, staged: &[std::path::PathBuf]) -> Result<()> {
        let archive = self.layout.archive();
        if let Some(mut reader) = RecordReader::open(&archive)? {
            while let Some(raw) = reader.next_member(true)? {
                if raw.section != Section::Environments
                    || !self.wanted(&raw.fingerprint)
                    || self.writer.has_environment(&raw.fingerprint)
                {
                    continue;
                }
                raw.decode()
                    .map_err(|reason| Error::corrupt(&archive, raw.offset, reason))?;
                self.writer.append_raw(&raw)?;
            }
        }
        for path in staged {
            let (fingerprint, snapshot) = read_staged(path)?;
            if self.wanted(&fingerprint) {
                self.writer.append_environment(&fingerprint, &snapshot)?;
            }
        }
        Ok(())
    }
}

/// Remove temp files left by interrupted rewrites and snapshot writes
pub(crate) fn remove_stale_temps(layout: &StoreLayout) -> Result<()> {
    for path in layout.stale_temps()? {
        tracing::info!(file = %path.display(), "Removing leftover temp file");
        remove_file_if_exists(&path)?;
    }
    Ok(())
}

/// Rewrite the archive, folding in everything staged so far
pub(crate) fn rewrite(
    layout: &StoreLayout,
    compression_level: i32,
    rewrite: Rewrite<'_>,
) -> Result<CompactionReport> {
    remove_stale_temps(layout)?;

    let staged_entries = layout.staged_entry_files()?;
    let staged_envs = layout.staged_env_files()?;
    if rewrite.transform.is_none()
        && staged_entries.is_empty()
        && staged_envs.is_empty()
        && layout.archive().is_file()
    {
        tracing::debug!(root = %layout.root().display(), "Nothing staged, archive left as is");
        return Ok(CompactionReport::default());
    }

    let mut rewriter = Rewriter {
        layout,
        writer: ArchiveWriter::create(layout, compression_level)?,
        rewrite,
        referenced: HashSet::new(),
        report: CompactionReport::default(),
    };
    rewriter.copy_archived_entries()?;
    rewriter.merge_staged_entries(&staged_entries)?;
    rewriter.merge_environments(&staged_envs)?;

    let Rewriter {
        writer, mut report, ..
    } = rewriter;
    let stats = writer.commit()?;
    report.entries = stats.entries;
    report.environments = stats.environments;

    for path in staged_entries.iter().chain(&staged_envs) {
        remove_file_if_exists(path)?;
    }

    tracing::info!(
        root = %layout.root().display(),
        entries = report.entries,
        environments = report.environments,
        merged = report.staged_files_merged,
        removed = report.removed,
        skipped = report.skipped_lines,
        "Archive rewritten"
    );
    Ok(report)
}
