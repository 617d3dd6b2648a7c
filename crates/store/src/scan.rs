//! Iteration and existence checks over archive plus staging
//!
//! Nothing here keeps a persistent index: every call walks the archive and
//! the staged files present at call time. Lookups cost a scan, but there is
//! no extra durable state that could disagree with the data.

use crate::archive::{Record, RecordReader, Section};
use crate::entry::{Entry, FingerprintProbe};
use crate::fingerprint::Fingerprint;
use crate::layout::StoreLayout;
use crate::staging::StagedFileReader;
use crate::Result;
use std::fs::File;
use std::io::BufReader;
use std::ops::ControlFlow;
use std::path::PathBuf;

/// Lazy sequence of every stored entry: archive first, then staged files
///
/// Reflects the store as of the call that created it. Archive corruption
/// is yielded once as an error, after which the sequence ends.
pub struct Entries {
    archive: Option<RecordReader<BufReader<File>>>,
    staged: std::vec::IntoIter<PathBuf>,
    current: Option<StagedFileReader>,
    failed: bool,
}

impl Entries {
    pub(crate) fn new(layout: &StoreLayout) -> Result<Self> {
        let archive = RecordReader::open(&layout.archive())?;
        let staged = layout.staged_entry_files()?;
        Ok(Self {
            archive,
            staged: staged.into_iter(),
            current: None,
            failed: false,
        })
    }

    fn next_archived(&mut self) -> Option<Result<Entry>> {
        let reader = self.archive.as_mut()?;
        loop {
            match reader.next_record() {
                Ok(Some(Record::Entry(entry))) => return Some(Ok(*entry)),
                Ok(Some(Record::Environment(..))) => {}
                Ok(None) => {
                    self.archive = None;
                    return None;
                }
                Err(e) => {
                    self.archive = None;
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }

    fn next_staged(&mut self) -> Option<Result<Entry>> {
        loop {
            if self.current.is_none() {
                let path = self.staged.next()?;
                match StagedFileReader::open(&path) {
                    Ok(reader) => self.current = reader,
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }
            let reader = self.current.as_mut()?;
            match reader.next_parsed::<Entry>() {
                Ok(Some((_, entry))) => return Some(Ok(entry)),
                Ok(None) => self.current = None,
                Err(e) => {
                    self.current = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Iterator for Entries {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(item) = self.next_archived() {
            return Some(item);
        }
        if self.failed {
            return None;
        }
        self.next_staged()
    }
}

/// Visit the args fingerprint of every stored entry, in iteration order
///
/// Archive members are identified by their header alone, so no payload is
/// decompressed. Staged lines are parsed only as far as the fingerprint.
pub(crate) fn visit_fingerprints(
    layout: &StoreLayout,
    mut visit: impl FnMut(&Fingerprint) -> ControlFlow<()>,
) -> Result<ControlFlow<()>> {
    if let Some(mut reader) = RecordReader::open(&layout.archive())? {
        while let Some(raw) = reader.next_member(false)? {
            if raw.section == Section::Entries && visit(&raw.fingerprint).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }
    for path in layout.staged_entry_files()? {
        let Some(mut reader) = StagedFileReader::open(&path)? else {
            continue;
        };
        while let Some((_, probe)) = reader.next_parsed::<FingerprintProbe>()? {
            if visit(&probe.args_fingerprint).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Whether any stored entry carries `fingerprint`
pub(crate) fn contains(layout: &StoreLayout, fingerprint: &Fingerprint) -> Result<bool> {
    let flow = visit_fingerprints(layout, |fp| {
        if fp == fingerprint {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(flow.is_break())
}
