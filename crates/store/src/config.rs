//! Store configuration and default root resolution

use crate::{Error, Result};
use dirs::{data_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default zstd level for archive records
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Staged files rotate once they reach this size
pub const DEFAULT_MAX_STAGED_FILE_BYTES: u64 = 30 * 1024 * 1024;

/// Tunables for a store handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// zstd level used when writing archive records (1..=22)
    pub compression_level: i32,
    /// Size at which the staging writer switches to a new file
    pub max_staged_file_bytes: u64,
    /// Call `sync_data` after every staged write
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_staged_file_bytes: DEFAULT_MAX_STAGED_FILE_BYTES,
            sync_writes: true,
        }
    }
}

/// Raw environment overrides, split out so resolution is testable
#[derive(Debug, Clone, Default)]
struct ConfigOverrides {
    compression_level: Option<String>,
    max_staged_file_bytes: Option<String>,
    sync_writes: Option<String>,
}

impl StoreConfig {
    /// Defaults overridden by `BENCHDB_COMPRESSION_LEVEL`,
    /// `BENCHDB_MAX_STAGED_FILE_BYTES` and `BENCHDB_SYNC`
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|s| !s.trim().is_empty());
        Self::from_overrides(ConfigOverrides {
            compression_level: var("BENCHDB_COMPRESSION_LEVEL"),
            max_staged_file_bytes: var("BENCHDB_MAX_STAGED_FILE_BYTES"),
            sync_writes: var("BENCHDB_SYNC"),
        })
    }

    fn from_overrides(overrides: ConfigOverrides) -> Result<Self> {
        let mut config = Self::default();
        if let Some(level) = overrides.compression_level {
            config.compression_level = level.trim().parse().map_err(|_| {
                Error::configuration(format!("BENCHDB_COMPRESSION_LEVEL is not an integer: {level}"))
            })?;
        }
        if let Some(bytes) = overrides.max_staged_file_bytes {
            config.max_staged_file_bytes = bytes.trim().parse().map_err(|_| {
                Error::configuration(format!(
                    "BENCHDB_MAX_STAGED_FILE_BYTES is not a byte count: {bytes}"
                ))
            })?;
        }
        if let Some(sync) = overrides.sync_writes {
            config.sync_writes = match sync.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(Error::configuration(format!(
                        "BENCHDB_SYNC must be a boolean, got {other}"
                    )));
                }
            };
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the archive writer cannot use
    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::configuration(format!(
                "compression level must be within 1..=22, got {}",
                self.compression_level
            )));
        }
        if self.max_staged_file_bytes == 0 {
            return Err(Error::configuration(
                "max_staged_file_bytes must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Inputs for determining the default store root
#[derive(Debug, Clone)]
struct RootInputs {
    benchdb_dir: Option<PathBuf>,
    xdg_data_home: Option<PathBuf>,
    os_data_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

impl RootInputs {
    fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            benchdb_dir: var("BENCHDB_DIR"),
            xdg_data_home: var("XDG_DATA_HOME"),
            os_data_dir: data_dir(),
            home_dir: home_dir(),
            temp_dir: std::env::temp_dir(),
        }
    }

    fn explicit(&self) -> Option<&PathBuf> {
        self.benchdb_dir
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    // Resolution order:
    // 1) BENCHDB_DIR (explicit override)
    // 2) XDG_DATA_HOME/benchdb
    // 3) OS data dir/benchdb
    // 4) ~/.benchdb
    // 5) TMPDIR/benchdb (fallback)
    fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(dir) = self.explicit() {
            candidates.push(dir.clone());
        }
        if let Some(xdg) = &self.xdg_data_home {
            candidates.push(xdg.join("benchdb"));
        }
        if let Some(os_data) = &self.os_data_dir {
            candidates.push(os_data.join("benchdb"));
        }
        if let Some(home) = &self.home_dir {
            candidates.push(home.join(".benchdb"));
        }
        candidates.push(self.temp_dir.join("benchdb"));
        candidates.retain(|p| !p.starts_with("/homeless-shelter"));
        candidates
    }
}

fn root_from_inputs(inputs: &RootInputs) -> Result<PathBuf> {
    // First writable candidate wins, created if needed
    for path in inputs.candidates() {
        if path.exists() {
            let probe = path.join(".write_probe");
            match std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => continue,
            }
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable store directory",
    ))
}

fn existing_root_from_inputs(inputs: &RootInputs) -> Option<PathBuf> {
    if let Some(dir) = inputs.explicit() {
        return Some(dir.clone());
    }
    inputs.candidates().into_iter().find(|p| p.is_dir())
}

/// Resolve the store root used when no path is given explicitly
///
/// Creates the chosen directory when it does not exist yet.
pub fn default_root() -> Result<PathBuf> {
    root_from_inputs(&RootInputs::from_env())
}

/// Locate the default store root without creating anything
///
/// `BENCHDB_DIR` is returned as is when set; otherwise the first default
/// location that already exists as a directory. `None` when there is none.
#[must_use]
pub fn existing_default_root() -> Option<PathBuf> {
    existing_root_from_inputs(&RootInputs::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_staged_file_bytes, 30 * 1024 * 1024);
    }

    #[test]
    fn overrides_are_applied() {
        let config = StoreConfig::from_overrides(ConfigOverrides {
            compression_level: Some("19".into()),
            max_staged_file_bytes: Some(" 1024 ".into()),
            sync_writes: Some("off".into()),
        })
        .unwrap();
        assert_eq!(config.compression_level, 19);
        assert_eq!(config.max_staged_file_bytes, 1024);
        assert!(!config.sync_writes);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        for overrides in [
            ConfigOverrides {
                compression_level: Some("fast".into()),
                ..ConfigOverrides::default()
            },
            ConfigOverrides {
                compression_level: Some("40".into()),
                ..ConfigOverrides::default()
            },
            ConfigOverrides {
                max_staged_file_bytes: Some("0".into()),
                ..ConfigOverrides::default()
            },
            ConfigOverrides {
                sync_writes: Some("sometimes".into()),
                ..ConfigOverrides::default()
            },
        ] {
            assert!(StoreConfig::from_overrides(overrides).is_err());
        }
    }

    #[test]
    fn config_deserializes_with_missing_fields() {
        let config: StoreConfig = serde_json::from_str(r#"{"compression_level": 9}"#).unwrap();
        assert_eq!(config.compression_level, 9);
        assert!(config.sync_writes);
    }

    #[test]
    fn root_respects_override() {
        let tmp = TempDir::new().unwrap();
        let wanted = tmp.path().join("stores");
        let dir = root_from_inputs(&RootInputs {
            benchdb_dir: Some(wanted.clone()),
            xdg_data_home: None,
            os_data_dir: None,
            home_dir: None,
            temp_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(dir, wanted);
        assert!(wanted.is_dir());
    }

    #[test]
    fn root_skips_homeless_shelter() {
        let tmp = TempDir::new().unwrap();
        let dir = root_from_inputs(&RootInputs {
            benchdb_dir: None,
            xdg_data_home: Some(PathBuf::from("/homeless-shelter/.local/share")),
            os_data_dir: None,
            home_dir: Some(PathBuf::from("/homeless-shelter")),
            temp_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        assert!(!dir.starts_with("/homeless-shelter"));
        assert!(dir.starts_with(tmp.path()));
    }

    #[test]
    fn existing_root_never_creates() {
        let tmp = TempDir::new().unwrap();
        let inputs = RootInputs {
            benchdb_dir: None,
            xdg_data_home: Some(tmp.path().join("xdg")),
            os_data_dir: None,
            home_dir: Some(tmp.path().join("home")),
            temp_dir: tmp.path().join("tmp"),
        };
        assert_eq!(existing_root_from_inputs(&inputs), None);
        assert!(!tmp.path().join("xdg").exists());
        assert!(!tmp.path().join("tmp").exists());

        std::fs::create_dir_all(tmp.path().join("home/.benchdb")).unwrap();
        assert_eq!(
            existing_root_from_inputs(&inputs),
            Some(tmp.path().join("home/.benchdb"))
        );
    }

    #[test]
    fn existing_root_takes_override_as_is() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("not-yet");
        let inputs = RootInputs {
            benchdb_dir: Some(missing.clone()),
            xdg_data_home: None,
            os_data_dir: None,
            home_dir: None,
            temp_dir: tmp.path().to_path_buf(),
        };
        assert_eq!(existing_root_from_inputs(&inputs), Some(missing.clone()));
        assert!(!missing.exists());
    }
}
