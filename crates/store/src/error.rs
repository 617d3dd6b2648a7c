//! Error types for the store crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while staging, compacting, repairing or reading
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(benchdb::store::io),
        help("Check file permissions and ensure the store path is reachable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Store configuration error: {message}")]
    #[diagnostic(code(benchdb::store::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Requested fingerprint is not stored
    #[error("Fingerprint not found: {key}")]
    #[diagnostic(
        code(benchdb::store::not_found),
        help("The entry may have been deleted or never recorded")
    )]
    NotFound {
        /// The fingerprint that was not found
        key: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(benchdb::store::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// The archive could not be read sequentially
    #[error("Corrupt archive {} at byte {offset}: {reason}", path.display())]
    #[diagnostic(
        code(benchdb::store::corrupt_archive),
        help("Run `benchdb repair` (or `Store::repair`) with exclusive access to recover the intact records")
    )]
    CorruptArchive {
        /// Archive file
        path: Box<Path>,
        /// Byte offset of the damaged block
        offset: u64,
        /// What failed to parse
        reason: String,
    },

    /// The directory holds a store written in another format
    #[error("Incompatible store at {}: found format {found}, expected {expected}", path.display())]
    #[diagnostic(
        code(benchdb::store::incompatible),
        help("Use a fresh directory or the benchdb release that created this store")
    )]
    IncompatibleStore {
        /// Store root
        path: Box<Path>,
        /// Format found in the marker file
        found: String,
        /// Format this build writes
        expected: u32,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a corrupt-archive error
    #[must_use]
    pub fn corrupt(path: impl AsRef<Path>, offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            path: path.as_ref().into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Whether this error means the archive needs a repair pass
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptArchive { .. })
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mentions_path_and_operation() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "/store/archive.tar",
            "rename",
        );
        let msg = err.to_string();
        assert!(msg.contains("rename"));
        assert!(msg.contains("/store/archive.tar"));
    }

    #[test]
    fn corruption_is_flagged() {
        let err = Error::corrupt("/store/archive.tar", 1024, "bad header checksum");
        assert!(err.is_corruption());
        assert!(err.to_string().contains("1024"));
        assert!(!Error::not_found("abc").is_corruption());
    }
}
