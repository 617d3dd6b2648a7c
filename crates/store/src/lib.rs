//! Fingerprinted result store for long-running experiments
//!
//! This crate provides the storage layer behind benchdb:
//! - Deterministic fingerprints of `(function, identity arguments)`
//! - Lock-free staging of new results by many threads and processes
//! - A compressed archive that compaction folds the staged results into
//! - Recovery of intact records from a damaged archive
//!
//! # Overview
//!
//! A store is a plain directory. Writers never coordinate: each handle
//! appends JSON lines to its own uniquely named staging file, and
//! environment snapshots are written once via temp file and rename.
//! [`Store::compact`] merges everything into `archive.tar`, whose records
//! are compressed one by one so that [`Store::repair`] can recover all
//! records but the damaged ones.
//!
//! ```no_run
//! use benchdb_store::{EnvironmentSnapshot, Parameters, Store};
//!
//! # fn main() -> benchdb_store::Result<()> {
//! let store = Store::open("./results")?;
//! let env = EnvironmentSnapshot::capture();
//! for n in [10, 100, 1000] {
//!     store.get_or_run(Parameters::new("solve").arg("n", n), &env, |_| n * 2)?;
//! }
//! store.compact()?;
//! for entry in store.iter()? {
//!     let entry = entry?;
//!     println!("{} -> {}", entry.parameters.args["n"], entry.result);
//! }
//! # Ok(())
//! # }
//! ```

#![expect(
    clippy::missing_errors_doc,
    reason = "Every fallible operation returns the crate Error; variants document themselves"
)]

mod archive;
mod compact;
mod config;
mod entry;
mod environment;
mod error;
mod fingerprint;
mod layout;
mod repair;
mod scan;
mod staging;
mod store;
mod value;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use archive::ArchiveStats;
pub use compact::CompactionReport;
pub use config::{
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_STAGED_FILE_BYTES, StoreConfig, default_root,
    existing_default_root,
};
pub use entry::{Entry, Outcome, Parameters, is_opaque_name};
pub use environment::EnvironmentSnapshot;
pub use fingerprint::{FINGERPRINT_HEX_LEN, Fingerprint, fingerprint};
pub use layout::{FORMAT_VERSION, StoreLayout};
pub use repair::RepairReport;
pub use scan::Entries;
pub use store::Store;
pub use value::Value;
