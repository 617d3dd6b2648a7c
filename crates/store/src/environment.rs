//! Environment snapshots and their deduplicating cache
//!
//! Snapshots are large and almost always identical between entries, so
//! entries only reference them by fingerprint. A snapshot is staged once as
//! `staging/env/<fingerprint>.json` (written via temp file and rename, so
//! two processes racing on the same snapshot both produce the same intact
//! file) and folded into the archive's `env/` section on compaction.

use crate::archive::{RecordReader, Section};
use crate::fingerprint::Fingerprint;
use crate::layout::{STAGED_ENV_EXT, StoreLayout, write_atomic};
use crate::value::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Host and tool metadata shared by many entries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentSnapshot(BTreeMap<String, Value>);

impl EnvironmentSnapshot {
    /// Snapshot from an existing map
    #[must_use]
    pub const fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }

    /// Add or replace one field
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a field
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// All fields
    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    /// Content fingerprint
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::serialization(format!("Failed to canonicalize environment: {e}")))?;
        Ok(Fingerprint::from_canonical_bytes(&bytes))
    }

    /// Minimal description of the current process environment
    ///
    /// Richer collection (installed packages, revision ids) belongs to the
    /// caller; extend the result with [`EnvironmentSnapshot::with`].
    #[must_use]
    pub fn capture() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok();
        let cwd = std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string());
        Self::default()
            .with("hostname", hostname)
            .with("os", std::env::consts::OS)
            .with("arch", std::env::consts::ARCH)
            .with("cwd", cwd)
            .with("benchdb_version", env!("CARGO_PKG_VERSION"))
    }
}

/// Serialize a snapshot as a record keyed by its own fingerprint
pub(crate) fn encode_environment(
    fingerprint: &Fingerprint,
    snapshot: &EnvironmentSnapshot,
) -> Result<Vec<u8>> {
    serde_json::to_vec(&BTreeMap::from([(fingerprint, snapshot)]))
        .map_err(|e| Error::serialization(format!("Failed to serialize environment: {e}")))
}

/// Parse a `{"<fingerprint>": snapshot}` record
pub(crate) fn decode_environment(
    json: &[u8],
) -> std::result::Result<(Fingerprint, EnvironmentSnapshot), String> {
    let map: BTreeMap<Fingerprint, EnvironmentSnapshot> =
        serde_json::from_slice(json).map_err(|e| format!("environment does not parse: {e}"))?;
    if map.len() != 1 {
        return Err(format!(
            "environment record must hold exactly one snapshot, found {}",
            map.len()
        ));
    }
    map.into_iter()
        .next()
        .ok_or_else(|| "empty environment record".to_string())
}

fn staged_path(layout: &StoreLayout, fingerprint: &Fingerprint) -> PathBuf {
    layout
        .staged_env_dir()
        .join(format!("{fingerprint}.{STAGED_ENV_EXT}"))
}

/// Read a staged snapshot file
pub(crate) fn read_staged(path: &std::path::Path) -> Result<(Fingerprint, EnvironmentSnapshot)> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
    decode_environment(&bytes)
        .map_err(|reason| Error::serialization(format!("{}: {reason}", path.display())))
}

/// Per-handle view of the environment section
#[derive(Debug, Default)]
pub(crate) struct EnvironmentCache {
    known: Mutex<HashSet<Fingerprint>>,
}

impl EnvironmentCache {
    fn remember(&self, fingerprint: &Fingerprint) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint.clone());
    }

    fn is_known(&self, fingerprint: &Fingerprint) -> bool {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }

    /// Drop everything this handle believes is stored
    pub fn forget_all(&self) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Store a snapshot once and return its fingerprint
    pub fn put(&self, layout: &StoreLayout, snapshot: &EnvironmentSnapshot) -> Result<Fingerprint> {
        let fingerprint = snapshot.fingerprint()?;
        if self.is_known(&fingerprint) {
            return Ok(fingerprint);
        }

        let path = staged_path(layout, &fingerprint);
        if path.is_file() || archive_has_environment(layout, &fingerprint)? {
            self.remember(&fingerprint);
            return Ok(fingerprint);
        }

        let dir = layout.staged_env_dir();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        write_atomic(&path, &encode_environment(&fingerprint, snapshot)?)?;
        tracing::debug!(fingerprint = %fingerprint, "Staged environment snapshot");
        self.remember(&fingerprint);
        Ok(fingerprint)
    }

    /// Look up a snapshot in staging, then in the archive
    pub fn get(
        &self,
        layout: &StoreLayout,
        fingerprint: &Fingerprint,
    ) -> Result<Option<EnvironmentSnapshot>> {
        let path = staged_path(layout, fingerprint);
        if path.is_file() {
            let (_, snapshot) = read_staged(&path)?;
            return Ok(Some(snapshot));
        }

        let Some(mut reader) = RecordReader::open(&layout.archive())? else {
            return Ok(None);
        };
        while let Some(raw) = reader.next_member(true)? {
            if raw.section != Section::Environments || raw.fingerprint != *fingerprint {
                continue;
            }
            return match raw.decode() {
                Ok(crate::archive::Record::Environment(_, snapshot)) => Ok(Some(snapshot)),
                Ok(crate::archive::Record::Entry(_)) => Ok(None),
                Err(reason) => Err(Error::corrupt(layout.archive(), raw.offset, reason)),
            };
        }
        Ok(None)
    }
}

/// Whether the archive's environment section holds `fingerprint`
///
/// A damaged archive is treated as "not present": the snapshot is staged
/// again and compaction or repair reconciles the copies later.
fn archive_has_environment(layout: &StoreLayout, fingerprint: &Fingerprint) -> Result<bool> {
    let Some(mut reader) = RecordReader::open(&layout.archive())? else {
        return Ok(false);
    };
    loop {
        match reader.next_member(false) {
            Ok(Some(raw)) => {
                if raw.section == Section::Environments && raw.fingerprint == *fingerprint {
                    return Ok(true);
                }
            }
            Ok(None) => return Ok(false),
            Err(e) if e.is_corruption() => {
                tracing::warn!("Archive unreadable while checking environment section: {e}");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
}
