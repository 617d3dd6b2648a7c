//! Archive container: a tar stream of independently compressed records
//!
//! Every member is one JSON record compressed as its own zstd frame (with
//! a content checksum), so a damaged member never makes its siblings
//! unreadable. Members live in two sections named after their fingerprint:
//!
//! ```text
//! entries/<args fingerprint>.json.zst   one Entry (names may repeat)
//! env/<env fingerprint>.json.zst        {"<env fingerprint>": snapshot}
//! ```
//!
//! Writers always go to a temp file in the store root that is renamed over
//! `archive.tar` once complete, so a half-written archive never becomes the
//! canonical one. The reader here is strict: the first damaged block is an
//! error. Lenient scanning lives in [`crate::repair`].

use crate::entry::Entry;
use crate::environment::{EnvironmentSnapshot, decode_environment, encode_environment};
use crate::fingerprint::Fingerprint;
use crate::layout::{ARCHIVE_TEMP_PREFIX, StoreLayout};
use crate::{Error, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Tar block size
pub(crate) const BLOCK_SIZE: usize = 512;

const ENTRY_SECTION: &str = "entries/";
const ENV_SECTION: &str = "env/";
const MEMBER_SUFFIX: &str = ".json.zst";
const CKSUM_FIELD: std::ops::Range<usize> = 148..156;

/// Archive section a member belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Section {
    Entries,
    Environments,
}

/// A decoded archive record
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Record {
    /// A recorded invocation
    Entry(Box<Entry>),
    /// A deduplicated environment snapshot
    Environment(Fingerprint, EnvironmentSnapshot),
}

/// A member as stored: header fields plus the still-compressed payload
#[derive(Debug)]
pub(crate) struct RawRecord {
    pub section: Section,
    pub fingerprint: Fingerprint,
    pub payload: Vec<u8>,
    pub offset: u64,
}

impl RawRecord {
    /// Decompress and parse the payload
    pub fn decode(&self) -> std::result::Result<Record, String> {
        let json = zstd::stream::decode_all(self.payload.as_slice())
            .map_err(|e| format!("zstd decode failed: {e}"))?;
        match self.section {
            Section::Entries => {
                let entry: Entry = serde_json::from_slice(&json)
                    .map_err(|e| format!("entry does not parse: {e}"))?;
                if entry.args_fingerprint != self.fingerprint {
                    return Err(format!(
                        "member name {} does not match entry fingerprint {}",
                        self.fingerprint, entry.args_fingerprint
                    ));
                }
                Ok(Record::Entry(Box::new(entry)))
            }
            Section::Environments => {
                let (fingerprint, snapshot) = decode_environment(&json)?;
                if fingerprint != self.fingerprint {
                    return Err(format!(
                        "member name {} does not match snapshot key {fingerprint}",
                        self.fingerprint
                    ));
                }
                Ok(Record::Environment(fingerprint, snapshot))
            }
        }
    }
}

fn member_name(section: Section, fingerprint: &Fingerprint) -> String {
    let prefix = match section {
        Section::Entries => ENTRY_SECTION,
        Section::Environments => ENV_SECTION,
    };
    format!("{prefix}{fingerprint}{MEMBER_SUFFIX}")
}

fn parse_member_name(name: &str) -> Option<(Section, Fingerprint)> {
    let (section, rest) = if let Some(rest) = name.strip_prefix(ENTRY_SECTION) {
        (Section::Entries, rest)
    } else if let Some(rest) = name.strip_prefix(ENV_SECTION) {
        (Section::Environments, rest)
    } else {
        return None;
    };
    let hex = rest.strip_suffix(MEMBER_SUFFIX)?;
    Fingerprint::from_hex(hex).ok().map(|fp| (section, fp))
}

/// Header fields of a member that passed validation
#[derive(Debug)]
pub(crate) struct MemberHeader {
    pub section: Section,
    pub fingerprint: Fingerprint,
    pub size: u64,
}

/// Validate one 512-byte block as a record header
///
/// The tar checksum must verify, the member must be a regular file and its
/// name must belong to one of the two sections.
pub(crate) fn parse_header(block: &[u8; BLOCK_SIZE]) -> Option<MemberHeader> {
    let header = tar::Header::from_byte_slice(block);
    let stored = header.cksum().ok()?;
    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if CKSUM_FIELD.contains(&i) {
                u32::from(b' ')
            } else {
                u32::from(*b)
            }
        })
        .sum();
    if stored != computed || !header.entry_type().is_file() {
        return None;
    }
    let size = header.entry_size().ok()?;
    let path = header.path().ok()?;
    let (section, fingerprint) = parse_member_name(path.to_str()?)?;
    Some(MemberHeader {
        section,
        fingerprint,
        size,
    })
}

/// Outcome of reading one block
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BlockRead {
    Full,
    Partial,
    Eof,
}

/// Fill `buf` with the next block
pub(crate) fn read_block<R: Read>(reader: &mut R, buf: &mut [u8; BLOCK_SIZE]) -> io::Result<BlockRead> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 => BlockRead::Eof,
        BLOCK_SIZE => BlockRead::Full,
        _ => BlockRead::Partial,
    })
}

pub(crate) fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|b| *b == 0)
}

/// Payload size rounded up to whole blocks
pub(crate) const fn padded_len(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

/// Read a member payload and its padding; `Ok(None)` if the input ends early
pub(crate) fn read_payload<R: Read>(
    reader: &mut R,
    size: u64,
    keep: bool,
) -> io::Result<Option<Vec<u8>>> {
    let padded = padded_len(size);
    if keep {
        let mut payload = Vec::new();
        let read = reader.by_ref().take(padded).read_to_end(&mut payload)?;
        if (read as u64) < padded {
            return Ok(None);
        }
        payload.truncate(usize::try_from(size).unwrap_or(usize::MAX));
        Ok(Some(payload))
    } else {
        let skipped = io::copy(&mut reader.by_ref().take(padded), &mut io::sink())?;
        Ok((skipped == padded).then(Vec::new))
    }
}

/// zstd-compress one JSON record
pub(crate) fn compress_record(json: &[u8], level: i32) -> io::Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::with_capacity(json.len() / 2 + 64), level)?;
    encoder.include_checksum(true)?;
    encoder.write_all(json)?;
    encoder.finish()
}

/// Strict sequential reader over an archive
pub(crate) struct RecordReader<R> {
    inner: R,
    path: PathBuf,
    offset: u64,
    done: bool,
}

impl RecordReader<BufReader<File>> {
    /// Open the archive of a store; `Ok(None)` when there is none yet
    pub fn open(path: &Path) -> Result<Option<Self>> {
        match File::open(path) {
            Ok(file) => Ok(Some(Self::new(BufReader::new(file), path))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, path, "open")),
        }
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            offset: 0,
            done: false,
        }
    }

    fn fail(&mut self, offset: u64, reason: impl Into<String>) -> Error {
        self.done = true;
        Error::corrupt(&self.path, offset, reason)
    }

    /// Next member; the payload is only read into memory when `load_payload`
    pub fn next_member(&mut self, load_payload: bool) -> Result<Option<RawRecord>> {
        if self.done {
            return Ok(None);
        }
        let start = self.offset;
        let mut block = [0u8; BLOCK_SIZE];
        match read_block(&mut self.inner, &mut block) {
            Ok(BlockRead::Full) => {}
            Ok(BlockRead::Eof | BlockRead::Partial) => {
                return Err(self.fail(start, "archive ends without end-of-archive marker"));
            }
            Err(e) => {
                self.done = true;
                return Err(Error::io(e, &self.path, "read"));
            }
        }
        self.offset += BLOCK_SIZE as u64;

        if is_zero_block(&block) {
            self.done = true;
            return Ok(None);
        }
        let Some(header) = parse_header(&block) else {
            return Err(self.fail(start, "invalid record header"));
        };
        let payload = match read_payload(&mut self.inner, header.size, load_payload) {
            Ok(Some(payload)) => payload,
            Ok(None) => return Err(self.fail(start, "truncated record payload")),
            Err(e) => {
                self.done = true;
                return Err(Error::io(e, &self.path, "read"));
            }
        };
        self.offset += padded_len(header.size);
        Ok(Some(RawRecord {
            section: header.section,
            fingerprint: header.fingerprint,
            payload,
            offset: start,
        }))
    }

    /// Next member, decoded
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(raw) = self.next_member(true)? else {
            return Ok(None);
        };
        match raw.decode() {
            Ok(record) => Ok(Some(record)),
            Err(reason) => Err(self.fail(raw.offset, reason)),
        }
    }
}

/// Counts of what a rewrite put into the new archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ArchiveStats {
    /// Entry records written
    pub entries: usize,
    /// Environment records written
    pub environments: usize,
}

/// Count the members of a store's archive without decompressing them
pub(crate) fn stats(layout: &StoreLayout) -> Result<ArchiveStats> {
    let mut stats = ArchiveStats::default();
    let Some(mut reader) = RecordReader::open(&layout.archive())? else {
        return Ok(stats);
    };
    while let Some(raw) = reader.next_member(false)? {
        match raw.section {
            Section::Entries => stats.entries += 1,
            Section::Environments => stats.environments += 1,
        }
    }
    Ok(stats)
}

/// Builds a new archive next to the current one
pub(crate) struct ArchiveWriter {
    builder: tar::Builder<BufWriter<NamedTempFile>>,
    target: PathBuf,
    level: i32,
    mtime: u64,
    environments: HashSet<Fingerprint>,
    stats: ArchiveStats,
}

impl ArchiveWriter {
    pub fn create(layout: &StoreLayout, level: i32) -> Result<Self> {
        let root = layout.root();
        let tmp = tempfile::Builder::new()
            .prefix(ARCHIVE_TEMP_PREFIX)
            .suffix(".tmp")
            .tempfile_in(root)
            .map_err(|e| Error::io(e, root, "create_temp"))?;
        let mtime = chrono::Utc::now().timestamp().try_into().unwrap_or(0);
        Ok(Self {
            builder: tar::Builder::new(BufWriter::new(tmp)),
            target: layout.archive(),
            level,
            mtime,
            environments: HashSet::new(),
            stats: ArchiveStats::default(),
        })
    }

    fn append_member(&mut self, section: Section, fingerprint: &Fingerprint, payload: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(self.mtime);
        self.builder
            .append_data(&mut header, member_name(section, fingerprint), payload)
            .map_err(|e| Error::io(e, &self.target, "append"))
    }

    /// Append an entry from its JSON serialization
    pub fn append_entry_json(&mut self, fingerprint: &Fingerprint, json: &[u8]) -> Result<()> {
        let payload = compress_record(json, self.level)
            .map_err(|e| Error::io(e, &self.target, "compress"))?;
        self.append_member(Section::Entries, fingerprint, &payload)?;
        self.stats.entries += 1;
        Ok(())
    }

    /// Append an entry
    pub fn append_entry(&mut self, entry: &Entry) -> Result<()> {
        let json = serde_json::to_vec(entry)
            .map_err(|e| Error::serialization(format!("Failed to serialize entry: {e}")))?;
        self.append_entry_json(&entry.args_fingerprint, &json)
    }

    /// Copy a member without recompressing it
    pub fn append_raw(&mut self, raw: &RawRecord) -> Result<bool> {
        if raw.section == Section::Environments
            && !self.environments.insert(raw.fingerprint.clone())
        {
            return Ok(false);
        }
        self.append_member(raw.section, &raw.fingerprint, &raw.payload)?;
        match raw.section {
            Section::Entries => self.stats.entries += 1,
            Section::Environments => self.stats.environments += 1,
        }
        Ok(true)
    }

    /// Append a snapshot unless one with this fingerprint is already written
    pub fn append_environment(
        &mut self,
        fingerprint: &Fingerprint,
        snapshot: &EnvironmentSnapshot,
    ) -> Result<bool> {
        if self.environments.contains(fingerprint) {
            return Ok(false);
        }
        let json = encode_environment(fingerprint, snapshot)?;
        let payload = compress_record(&json, self.level)
            .map_err(|e| Error::io(e, &self.target, "compress"))?;
        self.append_member(Section::Environments, fingerprint, &payload)?;
        self.environments.insert(fingerprint.clone());
        self.stats.environments += 1;
        Ok(true)
    }

    /// Whether a snapshot with this fingerprint has been written
    pub fn has_environment(&self, fingerprint: &Fingerprint) -> bool {
        self.environments.contains(fingerprint)
    }

    /// Finish the tar stream, sync it and rename it over the archive
    pub fn commit(self) -> Result<ArchiveStats> {
        let target = self.target;
        let buffered = self
            .builder
            .into_inner()
            .map_err(|e| Error::io(e, &target, "finish"))?;
        let tmp = buffered
            .into_inner()
            .map_err(|e| Error::io(e.into_error(), &target, "flush"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
        tmp.persist(&target)
            .map_err(|e| Error::io(e.error, &target, "rename"))?;
        sync_parent(&target);
        Ok(self.stats)
    }
}

/// Best-effort directory sync so the rename itself is durable
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::warn!(dir = %parent.display(), "Directory sync after archive rename failed: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
