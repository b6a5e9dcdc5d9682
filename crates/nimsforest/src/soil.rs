//! Soil: revisioned key/value store with compare-and-set writes.
//!
//! Every key carries a monotonic revision. `bury` succeeds only when the
//! caller's expected revision matches the current one (0 = create-only), so
//! at most one of any set of concurrent writers wins; the rest get a
//! revision-conflict sentinel. The map persists as a single JSON file written
//! atomically on every mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use nimsforest_types::ForestError;
use serde::{Deserialize, Serialize};

const SOIL_FILE: &str = "soil.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvEntry {
    revision: u64,
    data: String,
    updated_at: DateTime<Utc>,
}

/// Handle to the revisioned KV layer.
#[derive(Clone, Debug)]
pub struct Soil {
    inner: Arc<SoilInner>,
}

#[derive(Debug)]
struct SoilInner {
    path: PathBuf,
    map: Mutex<BTreeMap<String, KvEntry>>,
}

impl Soil {
    /// Open (or create) the store under the given directory.
    pub fn open(dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create soil dir {}", dir.display()))?;
        let path = dir.join(SOIL_FILE);
        let map: BTreeMap<String, KvEntry> =
            crate::fsutil::load_json(&path)?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(SoilInner {
                path,
                map: Mutex::new(map),
            }),
        })
    }

    /// Read a key, returning its bytes and current revision.
    pub fn dig(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let map = self.inner.map.lock().unwrap();
        match map.get(key) {
            None => Ok(None),
            Some(entry) => {
                let data = BASE64
                    .decode(&entry.data)
                    .with_context(|| format!("corrupt soil entry for {}", key))?;
                Ok(Some((data, entry.revision)))
            }
        }
    }

    /// Write a key iff the current revision equals `expected_rev`.
    ///
    /// `expected_rev == 0` is create-only. Returns the new revision on
    /// success, or the revision-conflict sentinel.
    pub fn bury(&self, key: &str, data: &[u8], expected_rev: u64) -> Result<u64> {
        if key.is_empty() {
            anyhow::bail!("soil key must not be empty");
        }
        let mut map = self.inner.map.lock().unwrap();
        let current = map.get(key).map(|e| e.revision).unwrap_or(0);
        if current != expected_rev {
            return Err(ForestError::RevisionConflict {
                key: key.to_string(),
                expected: expected_rev,
                current,
            }
            .into());
        }
        let new_rev = current + 1;
        map.insert(
            key.to_string(),
            KvEntry {
                revision: new_rev,
                data: BASE64.encode(data),
                updated_at: Utc::now(),
            },
        );
        crate::fsutil::atomic_write_json(&self.inner.path, &*map)?;
        Ok(new_rev)
    }

    /// Delete a key iff the current revision equals `expected_rev`.
    pub fn delete(&self, key: &str, expected_rev: u64) -> Result<()> {
        let mut map = self.inner.map.lock().unwrap();
        let current = match map.get(key) {
            Some(e) => e.revision,
            None => return Err(ForestError::NotFound(format!("soil key {}", key)).into()),
        };
        if current != expected_rev {
            return Err(ForestError::RevisionConflict {
                key: key.to_string(),
                expected: expected_rev,
                current,
            }
            .into());
        }
        map.remove(key);
        crate::fsutil::atomic_write_json(&self.inner.path, &*map)?;
        Ok(())
    }

    /// List keys with the given prefix (cache inspection, tests).
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let map = self.inner.map.lock().unwrap();
        map.keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn dig_missing_key_returns_none() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");
        assert!(soil.dig("absent").expect("dig").is_none());
    }

    #[test]
    fn bury_then_dig_roundtrips() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");

        let rev = soil.bury("k", b"value", 0).expect("bury");
        assert_eq!(rev, 1);
        let (data, rev) = soil.dig("k").expect("dig").expect("present");
        assert_eq!(data, b"value");
        assert_eq!(rev, 1);
    }

    #[test]
    fn create_only_conflicts_when_present() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");
        soil.bury("k", b"v1", 0).expect("bury");

        let err = soil.bury("k", b"v2", 0).unwrap_err();
        match err.downcast_ref::<ForestError>() {
            Some(ForestError::RevisionConflict {
                expected, current, ..
            }) => {
                assert_eq!(*expected, 0);
                assert_eq!(*current, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn stale_revision_conflicts() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");
        soil.bury("k", b"v1", 0).expect("bury");
        soil.bury("k", b"v2", 1).expect("bury");

        assert!(soil.bury("k", b"v3", 1).is_err());
        assert_eq!(soil.bury("k", b"v3", 2).expect("bury"), 3);
    }

    #[test]
    fn delete_requires_matching_revision() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");
        soil.bury("k", b"v", 0).expect("bury");

        assert!(soil.delete("k", 9).is_err());
        soil.delete("k", 1).expect("delete");
        assert!(soil.dig("k").expect("dig").is_none());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");
        let err = soil.delete("absent", 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForestError>(),
            Some(ForestError::NotFound(_))
        ));
    }

    #[test]
    fn state_survives_reopen() {
        let td = tempdir().expect("tempdir");
        {
            let soil = Soil::open(td.path()).expect("open");
            soil.bury("persist", b"stored", 0).expect("bury");
        }
        let soil = Soil::open(td.path()).expect("reopen");
        let (data, rev) = soil.dig("persist").expect("dig").expect("present");
        assert_eq!(data, b"stored");
        assert_eq!(rev, 1);
    }

    #[test]
    fn keys_with_prefix_filters() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");
        soil.bury("bedrock:docs:lock:a", b"1", 0).expect("bury");
        soil.bury("bedrock:docs:lock:b", b"1", 0).expect("bury");
        soil.bury("cache:docs:a", b"1", 0).expect("bury");

        let keys = soil.keys_with_prefix("bedrock:docs:lock:");
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn concurrent_cas_has_single_winner() {
        let td = tempdir().expect("tempdir");
        let soil = Soil::open(td.path()).expect("open");
        soil.bury("contested", b"base", 0).expect("bury");

        let mut handles = Vec::new();
        for i in 0..8 {
            let soil = soil.clone();
            handles.push(std::thread::spawn(move || {
                soil.bury("contested", format!("writer-{}", i).as_bytes(), 1)
                    .is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }
}
