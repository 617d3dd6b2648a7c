//! Recovery of intact records from a damaged archive
//!
//! The scan walks the archive block by block instead of trusting the tar
//! stream. A block only counts as a record header when its tar checksum
//! verifies, it describes a regular file and its name lies in one of the two
//! sections. Everything else is skipped:
//!
//! * a header whose payload does not decompress or parse is one
//!   unrecoverable record; scanning resumes after its payload
//! * a run of blocks that are neither headers nor zero padding is one
//!   unrecoverable record
//! * a payload cut short by the end of the file is one unrecoverable record
//!
//! Recovered records are written to a fresh archive that replaces the old
//! one atomically. Staged files are not touched.

use crate::archive::{
    ArchiveWriter, BlockRead, BLOCK_SIZE, RawRecord, Record, is_zero_block, padded_len,
    parse_header, read_block, read_payload,
};
use crate::compact::remove_stale_temps;
use crate::layout::StoreLayout;
use crate::{Error, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader};

/// Summary of one repair pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Entry records carried over
    pub recovered_entries: usize,
    /// Environment records carried over (after deduplication)
    pub recovered_environments: usize,
    /// Damaged records that were dropped
    pub unrecoverable: usize,
}

struct Scan {
    offset: u64,
    in_damage: bool,
    report: RepairReport,
}

impl Scan {
    fn damaged_block(&mut self, offset: u64) {
        if !self.in_damage {
            self.in_damage = true;
            self.report.unrecoverable += 1;
            tracing::warn!(offset, "Skipping damaged archive region");
        }
    }
}

/// Rebuild the archive from its readable records
pub(crate) fn repair(layout: &StoreLayout, compression_level: i32) -> Result<RepairReport> {
    let path = layout.archive();
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(root = %layout.root().display(), "No archive to repair");
            return Ok(RepairReport::default());
        }
        Err(e) => return Err(Error::io(e, &path, "open")),
    };
    remove_stale_temps(layout)?;

    let mut reader = BufReader::new(file);
    let mut writer = ArchiveWriter::create(layout, compression_level)?;
    let mut scan = Scan {
        offset: 0,
        in_damage: false,
        report: RepairReport::default(),
    };
    let mut block = [0u8; BLOCK_SIZE];

    loop {
        let start = scan.offset;
        match read_block(&mut reader, &mut block).map_err(|e| Error::io(e, &path, "read"))? {
            BlockRead::Full => {}
            BlockRead::Eof => break,
            BlockRead::Partial => {
                scan.damaged_block(start);
                break;
            }
        }
        scan.offset += BLOCK_SIZE as u64;

        if is_zero_block(&block) {
            continue;
        }
        let Some(header) = parse_header(&block) else {
            scan.damaged_block(start);
            continue;
        };
        scan.in_damage = false;

        let Some(payload) = read_payload(&mut reader, header.size, true)
            .map_err(|e| Error::io(e, &path, "read"))?
        else {
            scan.report.unrecoverable += 1;
            tracing::warn!(offset = start, "Archive ends inside a record, dropping it");
            break;
        };
        scan.offset += padded_len(header.size);

        let raw = RawRecord {
            section: header.section,
            fingerprint: header.fingerprint,
            payload,
            offset: start,
        };
        match raw.decode() {
            Ok(Record::Entry(_)) => {
                writer.append_raw(&raw)?;
                scan.report.recovered_entries += 1;
            }
            Ok(Record::Environment(..)) => {
                if writer.append_raw(&raw)? {
                    scan.report.recovered_environments += 1;
                }
            }
            Err(reason) => {
                scan.report.unrecoverable += 1;
                tracing::warn!(offset = start, fingerprint = %raw.fingerprint, "Dropping unreadable record: {reason}");
            }
        }
    }

    writer.commit()?;
    let report = scan.report;
    tracing::info!(
        root = %layout.root().display(),
        entries = report.recovered_entries,
        environments = report.recovered_environments,
        unrecoverable = report.unrecoverable,
        "Archive repaired"
    );
    Ok(report)
}
