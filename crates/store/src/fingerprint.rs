//! Deterministic fingerprints over canonical JSON
//!
//! A fingerprint is the SHA-256 digest of the compact JSON serialization of
//! a [`Value`], rendered as 64 lowercase hex characters. Objects are
//! [`BTreeMap`]s, so keys are always serialized in sorted order and the
//! insertion order of arguments never changes the digest.

use crate::value::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Length of a rendered fingerprint
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// A fixed-width digest identifying an entry's or snapshot's identity content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an arbitrary value
    pub fn of(value: &Value) -> Result<Self> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::serialization(format!("Failed to canonicalize value: {e}")))?;
        Ok(Self::from_canonical_bytes(&bytes))
    }

    /// Digest already-canonical bytes
    #[must_use]
    pub fn from_canonical_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Create from hex string (validation)
    ///
    /// # Errors
    ///
    /// Returns error if the hex string is invalid or wrong length
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != FINGERPRINT_HEX_LEN {
            return Err(Error::configuration(format!(
                "Fingerprint must be {FINGERPRINT_HEX_LEN} hex characters, got {}",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::configuration(
                "Fingerprint must contain only hex digits",
            ));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Get the hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Fingerprint a function invocation by name and identity arguments
///
/// The canonical form is `{"args": {...}, "func": "<name>"}`.
pub fn fingerprint(func: &str, args: &BTreeMap<String, Value>) -> Result<Fingerprint> {
    let identity = Value::Object(BTreeMap::from([
        ("args".to_string(), Value::Object(args.clone())),
        ("func".to_string(), Value::from(func)),
    ]));
    Fingerprint::of(&identity)
}
