//! Crash-safe file writes and tolerant JSON loading for state files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Atomically replace `path` with `contents` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("state path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Serialize `value` as pretty JSON with a trailing newline and write atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load JSON state, treating a missing or unparseable file as absent.
///
/// Corruption is logged and never fatal; callers fall back to defaults.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path, label: &str) -> T {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable {label}, using defaults");
            return T::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "corrupted {label}, using defaults");
            T::default()
        }
    }
}

/// Remove a file, succeeding when it is already gone.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    #[test]
    fn write_creates_parent_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("counter.json");
        write_json_atomic(&path, &Counter { count: 7 }).expect("write");

        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "{\n  \"count\": 7\n}\n"
        );
        assert!(!temp.path().join("state").join("counter.json.tmp").exists());
    }

    #[test]
    fn corrupted_file_loads_as_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("counter.json");
        fs::write(&path, "{\"count\": 3").expect("write");
        let loaded: Counter = load_json_or_default(&path, "counter");
        assert_eq!(loaded, Counter::default());
    }

    #[test]
    fn missing_file_loads_as_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded: Counter = load_json_or_default(&temp.path().join("nope.json"), "counter");
        assert_eq!(loaded, Counter::default());
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("x");
        fs::write(&path, "x").expect("write");
        assert!(remove_if_exists(&path).expect("remove"));
        assert!(!remove_if_exists(&path).expect("remove again"));
    }
}
