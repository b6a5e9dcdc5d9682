//! Atomic file persistence.
//!
//! State files (soil KV, consumer offsets) are written via tmp + rename with
//! an fsync, so readers never observe a torn file.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    atomic_write_bytes(path, json.as_bytes())
}

/// Atomically replace `path` with `data`.
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create dir {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp file {}", tmp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync tmp file {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/// Load a JSON file, returning `None` when it does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse JSON from {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn write_then_load_roundtrips() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("nested").join("state.json");

        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u64);
        atomic_write_json(&path, &value).expect("write");

        let back: BTreeMap<String, u64> = load_json(&path).expect("load").expect("present");
        assert_eq!(back, value);
    }

    #[test]
    fn load_missing_returns_none() {
        let td = tempdir().expect("tempdir");
        let loaded: Option<BTreeMap<String, u64>> =
            load_json(&td.path().join("absent.json")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn overwrite_leaves_no_tmp_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("state.json");
        atomic_write_json(&path, &1u64).expect("first write");
        atomic_write_json(&path, &2u64).expect("second write");

        assert!(!path.with_extension("tmp").exists());
        let back: u64 = load_json(&path).expect("load").expect("present");
        assert_eq!(back, 2);
    }
}
