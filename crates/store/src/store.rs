//! The store handle

use crate::archive::ArchiveStats;
use crate::compact::{self, CompactionReport, Rewrite};
use crate::config::StoreConfig;
use crate::entry::{Entry, Outcome, Parameters};
use crate::environment::{EnvironmentCache, EnvironmentSnapshot};
use crate::fingerprint::Fingerprint;
use crate::layout::{StoreLayout, remove_file_if_exists};
use crate::repair::{self, RepairReport};
use crate::scan::{self, Entries};
use crate::staging::StagingWriter;
use crate::value::Value;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Handle to one store directory
///
/// Cheap to share between threads; independent processes may open the same
/// directory at the same time. Recording, existence checks and iteration are
/// safe under that concurrency. [`compact`](Self::compact),
/// [`repair`](Self::repair) and the other rewriting operations require that
/// no other handle uses the store while they run.
#[derive(Debug)]
pub struct Store {
    layout: StoreLayout,
    config: StoreConfig,
    staging: Mutex<StagingWriter>,
    environments: EnvironmentCache,
}

impl Store {
    /// Open or create a store with configuration taken from the environment
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(root, StoreConfig::from_env()?)
    }

    /// Open or create a store with explicit configuration
    pub fn open_with(root: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        let staging = StagingWriter::new(&layout, &config);
        tracing::debug!(
            root = %layout.root().display(),
            staging = %staging.current_path().display(),
            ?config,
            "Opened store"
        );
        Ok(Self {
            layout,
            config,
            staging: Mutex::new(staging),
            environments: EnvironmentCache::default(),
        })
    }

    /// Store root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Paths of this store
    #[must_use]
    pub const fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether an entry with these parameters is stored
    ///
    /// An entry staged by another process may not be visible yet, so a
    /// `false` can be stale. Archived entries are matched by record name
    /// without decompressing them: a record whose payload is damaged still
    /// counts as present here, although [`iter`](Self::iter) fails on it
    /// until [`repair`](Self::repair) drops it.
    pub fn exists(&self, parameters: &Parameters) -> Result<bool> {
        self.contains_fingerprint(&parameters.fingerprint()?)
    }

    /// Whether an entry with this args fingerprint is stored
    ///
    /// Same visibility and corruption caveats as [`exists`](Self::exists).
    pub fn contains_fingerprint(&self, fingerprint: &Fingerprint) -> Result<bool> {
        scan::contains(&self.layout, fingerprint)
    }

    /// Store an environment snapshot once and return its fingerprint
    pub fn put_environment(&self, snapshot: &EnvironmentSnapshot) -> Result<Fingerprint> {
        self.environments.put(&self.layout, snapshot)
    }

    /// Look up a stored environment snapshot
    pub fn environment(&self, fingerprint: &Fingerprint) -> Result<Option<EnvironmentSnapshot>> {
        self.environments.get(&self.layout, fingerprint)
    }

    /// The snapshot an entry refers to
    pub fn environment_of(&self, entry: &Entry) -> Result<EnvironmentSnapshot> {
        self.environment(&entry.env_fingerprint)?
            .ok_or_else(|| Error::not_found(entry.env_fingerprint.to_string()))
    }

    fn stage(&self, entry: &Entry) -> Result<()> {
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(&[entry])?;
        Ok(())
    }

    /// Record a finished invocation
    pub fn record(
        &self,
        parameters: Parameters,
        outcome: Outcome,
        environment: &EnvironmentSnapshot,
    ) -> Result<Entry> {
        let env_fingerprint = self.put_environment(environment)?;
        let entry = Entry::new(parameters, outcome, env_fingerprint)?;
        self.stage(&entry)?;
        Ok(entry)
    }

    /// Stage an existing entry unchanged, together with its snapshot
    ///
    /// Meant for entries taken from another store, where `environment` comes
    /// from [`environment_of`](Self::environment_of) on the source. The
    /// snapshot must be the one the entry refers to.
    pub fn insert(&self, entry: &Entry, environment: &EnvironmentSnapshot) -> Result<()> {
        let env_fingerprint = environment.fingerprint()?;
        if env_fingerprint != entry.env_fingerprint {
            return Err(Error::configuration(format!(
                "Environment snapshot {env_fingerprint} does not match entry environment {}",
                entry.env_fingerprint
            )));
        }
        self.put_environment(environment)?;
        self.stage(entry)
    }

    /// Run and record `run` unless an entry for `parameters` already exists
    ///
    /// Returns the new entry, or `None` when the invocation was skipped.
    pub fn get_or_run<F, V>(
        &self,
        parameters: Parameters,
        environment: &EnvironmentSnapshot,
        run: F,
    ) -> Result<Option<Entry>>
    where
        F: FnOnce(&Parameters) -> V,
        V: Into<Value>,
    {
        if self.exists(&parameters)? {
            tracing::debug!(func = %parameters.func, "Entry exists, skipping run");
            return Ok(None);
        }
        let started = Instant::now();
        let result = run(&parameters).into();
        let outcome = Outcome::new(result).with_runtime(started.elapsed());
        self.record(parameters, outcome, environment).map(Some)
    }

    /// Lazily iterate every stored entry
    #[allow(clippy::iter_not_returning_iterator)] // opening the archive can fail
    pub fn iter(&self) -> Result<Entries> {
        Entries::new(&self.layout)
    }

    /// First stored entry, handy for looking at the shape of the data
    pub fn front(&self) -> Result<Option<Entry>> {
        self.iter()?.next().transpose()
    }

    /// Distinct args fingerprints of all stored entries
    pub fn fingerprints(&self) -> Result<BTreeSet<Fingerprint>> {
        let mut fingerprints = BTreeSet::new();
        scan::visit_fingerprints(&self.layout, |fp| {
            fingerprints.insert(fp.clone());
            ControlFlow::Continue(())
        })?;
        Ok(fingerprints)
    }

    /// Number of distinct args fingerprints stored
    pub fn len(&self) -> Result<usize> {
        Ok(self.fingerprints()?.len())
    }

    /// Whether no entry is stored
    pub fn is_empty(&self) -> Result<bool> {
        let flow = scan::visit_fingerprints(&self.layout, |_| ControlFlow::Break(()))?;
        Ok(flow.is_continue())
    }

    /// Fingerprint of the set of stored args fingerprints
    ///
    /// Stays the same across compaction and repair as long as no entry is
    /// lost, so it can tell whether two stores hold the same experiments.
    pub fn content_fingerprint(&self) -> Result<Fingerprint> {
        let set: Vec<Value> = self
            .fingerprints()?
            .into_iter()
            .map(|fp| Value::from(fp.as_hex()))
            .collect();
        Fingerprint::of(&Value::Array(set))
    }

    fn rotate_staging(&self) {
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rotate();
    }

    fn rewrite(&self, rewrite: Rewrite<'_>) -> Result<CompactionReport> {
        let report = compact::rewrite(&self.layout, self.config.compression_level, rewrite)?;
        self.rotate_staging();
        Ok(report)
    }

    /// Merge all staged entries and snapshots into the archive
    ///
    /// Requires exclusive access.
    #[tracing::instrument(name = "compact", fields(root = %self.root().display()), skip(self))]
    pub fn compact(&self) -> Result<CompactionReport> {
        self.rewrite(Rewrite::merge())
    }

    /// Rebuild the archive from its intact records
    ///
    /// Requires exclusive access.
    #[tracing::instrument(name = "repair", fields(root = %self.root().display()), skip(self))]
    pub fn repair(&self) -> Result<RepairReport> {
        let report = repair::repair(&self.layout, self.config.compression_level)?;
        self.environments.forget_all();
        Ok(report)
    }

    /// Replace every entry by `f(entry)`, dropping those mapped to `None`
    ///
    /// Also compacts. Requires exclusive access.
    pub fn apply(&self, mut f: impl FnMut(Entry) -> Option<Entry>) -> Result<CompactionReport> {
        let report = self.rewrite(Rewrite::transform(&mut f))?;
        self.environments.forget_all();
        Ok(report)
    }

    /// Remove every entry matching `predicate`; returns how many were removed
    ///
    /// Also compacts. Requires exclusive access.
    pub fn delete_if(&self, mut predicate: impl FnMut(&Entry) -> bool) -> Result<usize> {
        let report = self.apply(|entry| (!predicate(&entry)).then_some(entry))?;
        Ok(report.removed)
    }

    /// Keep only the first entry of every args fingerprint
    ///
    /// Also compacts. Requires exclusive access.
    pub fn deduplicate(&self) -> Result<CompactionReport> {
        let mut seen = HashSet::new();
        self.apply(|entry| seen.insert(entry.args_fingerprint.clone()).then_some(entry))
    }

    /// Remove every entry and snapshot but keep the store usable
    ///
    /// Requires exclusive access.
    pub fn clear(&self) -> Result<()> {
        let files = [
            vec![self.layout.archive()],
            self.layout.staged_entry_files()?,
            self.layout.staged_env_files()?,
            self.layout.stale_temps()?,
        ];
        for path in files.iter().flatten() {
            remove_file_if_exists(path)?;
        }
        self.environments.forget_all();
        self.rotate_staging();
        tracing::info!(root = %self.root().display(), "Cleared store");
        Ok(())
    }

    /// Remove the store directory entirely
    ///
    /// Requires exclusive access.
    pub fn delete(self) -> Result<()> {
        let root = self.layout.root();
        match std::fs::remove_dir_all(root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(e, root, "remove_dir_all")),
        }
        tracing::info!(root = %root.display(), "Deleted store");
        Ok(())
    }

    /// Number of staged entry files waiting for compaction
    pub fn staged_file_count(&self) -> Result<usize> {
        Ok(self.layout.staged_entry_files()?.len())
    }

    /// Counts of the records currently in the archive
    pub fn archive_stats(&self) -> Result<ArchiveStats> {
        crate::archive::stats(&self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quiet() -> StoreConfig {
        StoreConfig {
            sync_writes: false,
            ..StoreConfig::default()
        }
    }

    fn env() -> EnvironmentSnapshot {
        EnvironmentSnapshot::default().with("host", "test")
    }

    #[test]
    fn store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Store>();
    }

    #[test]
    fn open_rejects_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            compression_level: 0,
            ..StoreConfig::default()
        };
        assert!(Store::open_with(tmp.path(), config).is_err());
    }

    #[test]
    fn get_or_run_skips_known_parameters() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_with(tmp.path(), quiet()).unwrap();
        let mut runs = 0;
        for _ in 0..3 {
            store
                .get_or_run(Parameters::new("f").arg("x", 1), &env(), |p| {
                    runs += 1;
                    p.args["x"].as_i64().unwrap_or(0) * 2
                })
                .unwrap();
        }
        assert_eq!(runs, 1);
        let entry = store.front().unwrap().unwrap();
        assert_eq!(entry.result, Value::from(2));
        assert!(entry.runtime >= 0.0);
    }

    #[test]
    fn environment_of_resolves_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_with(tmp.path(), quiet()).unwrap();
        let entry = store
            .record(Parameters::new("f"), Outcome::new(1), &env())
            .unwrap();
        assert_eq!(store.environment_of(&entry).unwrap(), env());
        store.compact().unwrap();
        assert_eq!(store.environment_of(&entry).unwrap(), env());

        let mut orphan = entry;
        orphan.env_fingerprint = Fingerprint::of(&Value::from("nowhere")).unwrap();
        assert!(matches!(
            store.environment_of(&orphan),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn len_counts_distinct_fingerprints() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_with(tmp.path(), quiet()).unwrap();
        assert!(store.is_empty().unwrap());
        for x in [1, 2, 1] {
            store
                .record(Parameters::new("f").arg("x", x), Outcome::new(x), &env())
                .unwrap();
        }
        assert!(!store.is_empty().unwrap());
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.iter().unwrap().count(), 3);
    }

    #[test]
    fn insert_rejects_mismatched_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_with(tmp.path(), quiet()).unwrap();
        let entry = store
            .record(Parameters::new("f"), Outcome::new(1), &env())
            .unwrap();
        let other = EnvironmentSnapshot::default().with("host", "elsewhere");
        assert!(matches!(
            store.insert(&entry, &other),
            Err(Error::Configuration { .. })
        ));
        assert_eq!(store.iter().unwrap().count(), 1);
        assert_eq!(store.environment(&other.fingerprint().unwrap()).unwrap(), None);
    }

    #[test]
    fn staged_file_count_follows_compaction() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_with(tmp.path(), quiet()).unwrap();
        assert_eq!(store.staged_file_count().unwrap(), 0);
        store
            .record(Parameters::new("f"), Outcome::new(1), &env())
            .unwrap();
        assert_eq!(store.staged_file_count().unwrap(), 1);
        store.compact().unwrap();
        assert_eq!(store.staged_file_count().unwrap(), 0);
    }

    #[test]
    fn forgotten_environment_is_staged_again_after_gc() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_with(tmp.path(), quiet()).unwrap();
        let entry = store
            .record(Parameters::new("f").arg("x", 1), Outcome::new(1), &env())
            .unwrap();
        assert_eq!(store.delete_if(|_| true).unwrap(), 1);
        assert_eq!(store.environment(&entry.env_fingerprint).unwrap(), None);

        let again = store
            .record(Parameters::new("f").arg("x", 2), Outcome::new(2), &env())
            .unwrap();
        assert_eq!(store.environment_of(&again).unwrap(), env());
    }
}
