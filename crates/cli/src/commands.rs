//! Command implementations

use crate::cli::{CliError, Commands};
use benchdb_store::{
    Entry, FORMAT_VERSION, Parameters, Store, StoreLayout, Value, existing_default_root,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Snapshot of a store's state printed by `info`
#[derive(Debug, Serialize)]
struct StoreInfo {
    root: PathBuf,
    format: u32,
    distinct_entries: usize,
    archived_entries: usize,
    archived_environments: usize,
    staged_files: usize,
    content_fingerprint: String,
}

/// Resolve the store root from `--store` or an existing default location
///
/// Never creates a directory.
pub fn resolve_root(store: Option<&Path>) -> Result<PathBuf, CliError> {
    resolve_root_with(store, existing_default_root)
}

fn resolve_root_with(
    store: Option<&Path>,
    default: impl FnOnce() -> Option<PathBuf>,
) -> Result<PathBuf, CliError> {
    match store {
        Some(path) => Ok(path.to_path_buf()),
        None => default().ok_or_else(|| {
            CliError::config_with_help(
                "No store given and no default store directory exists",
                "Pass --store (or set BENCHDB_STORE) with the directory your experiments record into",
            )
        }),
    }
}

/// Open a store that experiments already created; nothing is written when
/// `root` is not a store
fn open_existing(root: &Path) -> Result<Store, CliError> {
    if !StoreLayout::new(root).marker().is_file() {
        return Err(CliError::config_with_help(
            format!("No store at {}", root.display()),
            "Pass --store with the directory your experiments record into",
        ));
    }
    Ok(Store::open(root)?)
}

fn require_confirmation(yes: bool, what: &str) -> Result<(), CliError> {
    if yes {
        Ok(())
    } else {
        Err(CliError::config_with_help(
            format!("Refusing to {what} without confirmation"),
            "Pass --yes to confirm; no other process may use the store meanwhile",
        ))
    }
}

/// Parse `NAME=VALUE`; the value is JSON if it parses, a plain string otherwise
fn parse_arg(raw: &str) -> Result<(String, Value), CliError> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::config(format!("Argument `{raw}` is not NAME=VALUE")))?;
    if name.is_empty() {
        return Err(CliError::config(format!("Argument `{raw}` has no name")));
    }
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map_or_else(|_| Value::from(value), Value::from);
    Ok((name.to_string(), value))
}

fn entry_json(store: &Store, entry: Entry, with_env: bool) -> Result<serde_json::Value, CliError> {
    let env = if with_env {
        store.environment(&entry.env_fingerprint)?
    } else {
        None
    };
    let mut json = serde_json::to_value(entry)?;
    if with_env && let Some(object) = json.as_object_mut() {
        object.insert("env".to_string(), serde_json::to_value(env)?);
    }
    Ok(json)
}

fn write_report<T: Serialize>(out: &mut impl Write, json: bool, report: &T) -> Result<(), CliError> {
    if json {
        serde_json::to_writer(&mut *out, report)?;
        writeln!(out)?;
        return Ok(());
    }
    let value = serde_json::to_value(report)?;
    if let Some(fields) = value.as_object() {
        for (key, value) in fields {
            match value {
                serde_json::Value::String(s) => writeln!(out, "{key}: {s}")?,
                other => writeln!(out, "{key}: {other}")?,
            }
        }
    }
    Ok(())
}

/// Execute `command` against the store at `root`, writing results to `out`
pub fn execute(
    command: &Commands,
    root: &Path,
    json: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    if command.needs_exclusive_access() {
        tracing::info!(command = ?command, root = %root.display(), "Running exclusive store operation");
    }
    match command {
        Commands::Info => {
            let store = open_existing(root)?;
            let stats = store.archive_stats()?;
            let info = StoreInfo {
                root: store.root().to_path_buf(),
                format: FORMAT_VERSION,
                distinct_entries: store.len()?,
                archived_entries: stats.entries,
                archived_environments: stats.environments,
                staged_files: store.staged_file_count()?,
                content_fingerprint: store.content_fingerprint()?.to_string(),
            };
            write_report(out, json, &info)
        }
        Commands::Front { with_env } => {
            let store = open_existing(root)?;
            match store.front()? {
                Some(entry) => {
                    let value = entry_json(&store, entry, *with_env)?;
                    serde_json::to_writer_pretty(&mut *out, &value)?;
                    writeln!(out)?;
                }
                None => tracing::warn!(root = %root.display(), "Store holds no entries"),
            }
            Ok(())
        }
        Commands::List { with_env, limit } => {
            let store = open_existing(root)?;
            let entries = store.iter()?.take(limit.unwrap_or(usize::MAX));
            for entry in entries {
                let value = entry_json(&store, entry?, *with_env)?;
                serde_json::to_writer(&mut *out, &value)?;
                writeln!(out)?;
            }
            Ok(())
        }
        Commands::Exists { func, args } => {
            let store = open_existing(root)?;
            let mut parameters = Parameters::new(func.as_str());
            for raw in args {
                let (name, value) = parse_arg(raw)?;
                parameters = parameters.arg(name, value);
            }
            let exists = store.exists(&parameters)?;
            if json {
                let fingerprint = parameters.fingerprint()?;
                write_report(
                    out,
                    true,
                    &serde_json::json!({ "exists": exists, "fingerprint": fingerprint }),
                )
            } else {
                writeln!(out, "{exists}")?;
                Ok(())
            }
        }
        Commands::Compact => {
            let store = open_existing(root)?;
            write_report(out, json, &store.compact()?)
        }
        Commands::Repair => {
            let store = open_existing(root)?;
            write_report(out, json, &store.repair()?)
        }
        Commands::Dedup => {
            let store = open_existing(root)?;
            write_report(out, json, &store.deduplicate()?)
        }
        Commands::Clear { yes } => {
            require_confirmation(*yes, "clear the store")?;
            open_existing(root)?.clear()?;
            Ok(())
        }
        Commands::Delete { yes } => {
            require_confirmation(*yes, "delete the store")?;
            open_existing(root)?.delete()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchdb_store::{EnvironmentSnapshot, Outcome};
    use tempfile::TempDir;

    fn populated() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("db");
        let store = Store::open(&root).unwrap();
        let env = EnvironmentSnapshot::default().with("hostname", "bench-01");
        for n in [10, 20] {
            store
                .record(Parameters::new("solve").arg("n", n), Outcome::new(n * 2), &env)
                .unwrap();
        }
        (tmp, root)
    }

    fn run(command: &Commands, root: &Path, json: bool) -> Result<String, CliError> {
        let mut out = Vec::new();
        execute(command, root, json, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("n=10").unwrap(), ("n".into(), Value::from(10)));
        assert_eq!(
            parse_arg("mode=fast").unwrap(),
            ("mode".into(), Value::from("fast"))
        );
        assert_eq!(
            parse_arg("xs=[1,2]").unwrap(),
            ("xs".into(), Value::from(vec![1, 2]))
        );
        assert!(parse_arg("novalue").is_err());
        assert!(parse_arg("=1").is_err());
    }

    #[test]
    fn test_list_prints_ndjson() {
        let (_tmp, root) = populated();
        let output = run(
            &Commands::List {
                with_env: true,
                limit: None,
            },
            &root,
            false,
        )
        .unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["result"], 20);
        assert_eq!(lines[1]["env"]["hostname"], "bench-01");

        let limited = run(
            &Commands::List {
                with_env: false,
                limit: Some(1),
            },
            &root,
            false,
        )
        .unwrap();
        assert_eq!(limited.lines().count(), 1);
    }

    #[test]
    fn test_exists_command() {
        let (_tmp, root) = populated();
        let yes = Commands::Exists {
            func: "solve".into(),
            args: vec!["n=10".into()],
        };
        assert_eq!(run(&yes, &root, false).unwrap().trim(), "true");
        let no = Commands::Exists {
            func: "solve".into(),
            args: vec!["n=30".into()],
        };
        let json: serde_json::Value =
            serde_json::from_str(&run(&no, &root, true).unwrap()).unwrap();
        assert_eq!(json["exists"], false);
    }

    #[test]
    fn test_compact_then_info() {
        let (_tmp, root) = populated();
        let report: serde_json::Value =
            serde_json::from_str(&run(&Commands::Compact, &root, true).unwrap()).unwrap();
        assert_eq!(report["entries"], 2);

        let info: serde_json::Value =
            serde_json::from_str(&run(&Commands::Info, &root, true).unwrap()).unwrap();
        assert_eq!(info["distinct_entries"], 2);
        assert_eq!(info["archived_entries"], 2);
        assert_eq!(info["staged_files"], 0);

        let text = run(&Commands::Info, &root, false).unwrap();
        assert!(text.contains("distinct_entries: 2"));
    }

    #[test]
    fn test_front_on_empty_store_prints_nothing() {
        let tmp = TempDir::new().unwrap();
        Store::open(tmp.path()).unwrap();
        let output = run(&Commands::Front { with_env: false }, tmp.path(), false).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_destructive_commands_need_confirmation() {
        let (_tmp, root) = populated();
        let err = run(&Commands::Clear { yes: false }, &root, false).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
        run(&Commands::Clear { yes: true }, &root, false).unwrap();
        assert!(Store::open(&root).unwrap().is_empty().unwrap());

        assert!(run(&Commands::Delete { yes: false }, &root, false).is_err());
        run(&Commands::Delete { yes: true }, &root, false).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_store_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        let err = run(&Commands::Info, &tmp.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
        assert!(!tmp.path().join("nope").exists());
    }

    #[test]
    fn test_no_default_store_is_a_config_error() {
        let err = resolve_root_with(None, || None).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));

        let explicit = resolve_root_with(Some(Path::new("/data/db")), || None).unwrap();
        assert_eq!(explicit, PathBuf::from("/data/db"));
    }

    #[test]
    fn test_default_directory_without_store_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let default = tmp.path().join("default_store");
        let root = resolve_root_with(None, || Some(default.clone())).unwrap();
        for command in [Commands::Info, Commands::Compact] {
            let err = run(&command, &root, false).unwrap_err();
            assert!(matches!(err, CliError::Config { .. }));
        }
        assert!(!default.exists());

        // A plain directory is not a store and gets no marker
        std::fs::create_dir_all(&default).unwrap();
        std::fs::write(default.join("notes.txt"), b"keep").unwrap();
        assert!(run(&Commands::Info, &default, false).is_err());
        assert!(!default.join("benchdb.json").exists());
        assert!(!default.join("staging").exists());
    }
}
