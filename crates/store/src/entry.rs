//! Recorded invocations

use crate::Result;
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identity of an invocation: function name plus identity arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Function name
    pub func: String,
    /// Identity arguments, sorted by name
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
}

impl Parameters {
    /// Start describing an invocation of `func`
    #[must_use]
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add an argument
    ///
    /// Names starting with `_` are opaque: they are dropped here, so they
    /// never take part in the fingerprint and are never persisted.
    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !is_opaque_name(&name) {
            self.args.insert(name, value.into());
        }
        self
    }

    /// Fingerprint of `(func, args)`
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        fingerprint(&self.func, &self.args)
    }
}

/// Whether an argument name is excluded from identity
#[must_use]
pub fn is_opaque_name(name: &str) -> bool {
    name.starts_with('_')
}

/// What a finished invocation produced
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Returned value
    pub result: Value,
    /// Wall-clock runtime in seconds
    pub runtime: f64,
    /// When the invocation started
    pub timestamp: DateTime<Utc>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl Outcome {
    /// Outcome with the given result, stamped now, zero runtime and no output
    #[must_use]
    pub fn new(result: impl Into<Value>) -> Self {
        Self {
            result: result.into(),
            runtime: 0.0,
            timestamp: Utc::now(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Set the measured runtime
    #[must_use]
    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime.as_secs_f64();
        self
    }

    /// Set the start time
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach captured output
    #[must_use]
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }
}

/// One recorded invocation as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Function name and identity arguments
    pub parameters: Parameters,
    /// Returned value
    pub result: Value,
    /// Runtime in seconds
    pub runtime: f64,
    /// Creation instant
    pub timestamp: DateTime<Utc>,
    /// Captured standard output
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error
    #[serde(default)]
    pub stderr: String,
    /// Fingerprint of `parameters`
    pub args_fingerprint: Fingerprint,
    /// Fingerprint of the referenced environment snapshot
    pub env_fingerprint: Fingerprint,
    /// Process arguments of the recording process
    #[serde(default)]
    pub argv: Vec<String>,
    /// Source file that recorded the entry, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Any other pass-through keys, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Entry {
    /// Build an entry for a finished invocation
    pub fn new(
        parameters: Parameters,
        outcome: Outcome,
        env_fingerprint: Fingerprint,
    ) -> Result<Self> {
        let args_fingerprint = parameters.fingerprint()?;
        Ok(Self {
            parameters,
            result: outcome.result,
            runtime: outcome.runtime,
            timestamp: outcome.timestamp,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            args_fingerprint,
            env_fingerprint,
            argv: std::env::args().collect(),
            source: None,
            extra: BTreeMap::new(),
        })
    }

    /// Record the source file the entry came from
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Just the identity of a staged line, parsed without building values
#[derive(Debug, Deserialize)]
pub(crate) struct FingerprintProbe {
    pub args_fingerprint: Fingerprint,
}
