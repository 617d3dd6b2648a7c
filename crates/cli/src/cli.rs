//! Command-line surface: arguments, errors and exit codes

use crate::logging::{LogFormat, LogLevel};
use clap::{Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Store I/O or data error exit code
pub const EXIT_STORE: i32 = 3;
/// Archive corruption that `repair` can fix
pub const EXIT_CORRUPT: i32 = 4;

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("CLI/configuration error: {message}")]
    #[diagnostic(code(benchdb::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Error reported by the store (exit code 3, or 4 for corruption)
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] benchdb_store::Error),
    /// Failure writing command output (exit code 3)
    #[error("Failed to write output: {0}")]
    #[diagnostic(code(benchdb::cli::output))]
    Output(#[from] io::Error),
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Output(io::Error::other(err))
        } else {
            Self::Store(benchdb_store::Error::serialization(err.to_string()))
        }
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. }
        | CliError::Store(benchdb_store::Error::Configuration { .. }) => EXIT_CLI,
        CliError::Store(benchdb_store::Error::CorruptArchive { .. }) => EXIT_CORRUPT,
        CliError::Store(_) | CliError::Output(_) => EXIT_STORE,
    }
}

/// Error response envelope for JSON output
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    status: &'static str,
    code: &'static str,
    message: String,
}

/// Render error appropriately based on JSON flag
pub fn render_error(err: CliError, json_mode: bool) {
    if json_mode {
        let envelope = ErrorEnvelope {
            status: "error",
            code: match &err {
                CliError::Config { .. } => "config",
                CliError::Store(e) if e.is_corruption() => "corrupt",
                CliError::Store(_) => "store",
                CliError::Output(_) => "output",
            },
            message: err.to_string(),
        };
        match serde_json::to_string(&envelope) {
            Ok(json) => println!("{json}"),
            Err(_) => eprintln!("Error serializing error response"),
        }
    } else {
        // Use miette for human-friendly error display
        let report = Report::new(err);
        eprintln!("{report:?}");
        let _ = io::stderr().flush();
    }
}

/// Inspect and maintain a benchdb result store.
///
/// Recording happens through the library; this tool covers the
/// operations that need exclusive access and quick looks at the data.
#[derive(Parser, Debug)]
#[command(name = "benchdb")]
#[command(about = "Inspect and maintain a benchdb result store")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Store directory; defaults to BENCHDB_DIR or the user data directory.
    #[arg(long, short = 's', global = true, env = "BENCHDB_STORE")]
    pub store: Option<PathBuf>,

    /// Logging verbosity level.
    #[arg(
        short = 'L',
        long,
        global = true,
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    /// Log line format on stderr.
    #[arg(long, global = true, default_value = "compact", value_enum)]
    pub log_format: LogFormat,

    /// Emit JSON for reports and errors.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Show entry counts, staged files and the content fingerprint.
    Info,
    /// Print the first entry.
    Front {
        /// Include the referenced environment snapshot.
        #[arg(long)]
        with_env: bool,
    },
    /// Print every entry as one JSON object per line.
    List {
        /// Include the referenced environment snapshot in every line.
        #[arg(long)]
        with_env: bool,
        /// Stop after this many entries.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check whether an entry exists for a function and arguments.
    Exists {
        /// Function name.
        func: String,
        /// Identity arguments as NAME=JSON (plain strings need no quotes).
        #[arg(value_name = "NAME=VALUE")]
        args: Vec<String>,
    },
    /// Merge staged entries into the archive (exclusive access).
    Compact,
    /// Rebuild the archive from its intact records (exclusive access).
    Repair,
    /// Keep only the first entry per fingerprint (exclusive access).
    Dedup,
    /// Remove all entries but keep the store (exclusive access).
    Clear {
        /// Confirm the removal.
        #[arg(long)]
        yes: bool,
    },
    /// Remove the store directory entirely (exclusive access).
    Delete {
        /// Confirm the removal.
        #[arg(long)]
        yes: bool,
    },
}

impl Commands {
    /// Whether the command changes the store and must not run concurrently
    #[must_use]
    pub const fn needs_exclusive_access(&self) -> bool {
        matches!(
            self,
            Self::Compact | Self::Repair | Self::Dedup | Self::Clear { .. } | Self::Delete { .. }
        )
    }
}

/// Parse CLI arguments from the process
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
