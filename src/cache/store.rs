//! Persisted store for feed snapshots
//!
//! Each feed is mirrored to one JSON file `{ "data": ..., "last_updated": <epoch secs> }`
//! in an XDG-compliant cache directory. The file is read once when a feed is
//! created and overwritten after every successful fetch.

use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when writing a snapshot
#[derive(Debug, Error)]
pub enum StoreError {
    /// Directory creation or file write failed
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be serialized
    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-disk layout of one feed snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot<T> {
    /// The cached payload
    pub data: T,
    /// Unix epoch seconds of the last successful fetch, 0 when never fetched
    #[serde(deserialize_with = "epoch_seconds")]
    pub last_updated: i64,
}

/// Accepts integral or fractional epoch seconds, truncating fractions.
fn epoch_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(serde::de::Error::custom("last_updated must be a non-negative number"));
    }
    Ok(value.trunc() as i64)
}

/// Reads and writes feed snapshots as JSON files
#[derive(Debug, Clone)]
pub struct Store {
    /// Directory where snapshot files are stored
    dir: PathBuf,
}

impl Store {
    /// Creates a store in the XDG cache directory (`~/.cache/nepse-feed/` on Linux)
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "nepse-feed")?;
        Some(Self {
            dir: project_dirs.cache_dir().to_path_buf(),
        })
    }

    /// Creates a store rooted at a specific directory
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the snapshot files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the snapshot file for the given key
    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Overwrites the snapshot for `key`
    ///
    /// Writes to a sibling temp file first and renames it into place, so a
    /// crash mid-write leaves the previous snapshot intact.
    pub fn save<T: Serialize>(&self, key: &str, data: &T, last_updated: i64) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let snapshot = Snapshot { data, last_updated };
        let json = serde_json::to_vec(&snapshot)?;

        let path = self.path(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Loads the snapshot for `key`
    ///
    /// Returns `None` if the file doesn't exist or cannot be parsed; a corrupt
    /// snapshot is treated as if nothing had been persisted.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<Snapshot<T>> {
        let content = fs::read_to_string(self.path(key)).ok()?;
        match serde_json::from_str::<Snapshot<T>>(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(feed = key, error = %e, "Ignoring unreadable snapshot");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestRow {
        symbol: String,
        ltp: f64,
    }

    fn create_test_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Store::with_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn rows() -> Vec<TestRow> {
        vec![
            TestRow {
                symbol: "NABIL".to_string(),
                ltp: 512.0,
            },
            TestRow {
                symbol: "NICA".to_string(),
                ltp: 401.5,
            },
        ]
    }

    #[test]
    fn test_save_creates_file_with_data_and_last_updated() {
        let (store, temp_dir) = create_test_store();

        store
            .save("todays_prices", &rows(), 1_700_000_000)
            .expect("Save should succeed");

        let path = temp_dir.path().join("todays_prices.json");
        assert!(path.exists(), "Snapshot file should exist");

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["last_updated"], 1_700_000_000);
        assert_eq!(value["data"][0]["symbol"], "NABIL");
        assert!(!temp_dir.path().join("todays_prices.json.tmp").exists());
    }

    #[test]
    fn test_load_returns_none_for_missing_key() {
        let (store, _temp_dir) = create_test_store();

        let result: Option<Snapshot<Vec<TestRow>>> = store.load("missing");

        assert!(result.is_none());
    }

    #[test]
    fn test_load_returns_saved_snapshot() {
        let (store, _temp_dir) = create_test_store();
        store.save("todays_prices", &rows(), 1_700_000_123).unwrap();

        let snapshot: Snapshot<Vec<TestRow>> = store.load("todays_prices").expect("Should load");

        assert_eq!(snapshot.data, rows());
        assert_eq!(snapshot.last_updated, 1_700_000_123);
    }

    #[test]
    fn test_load_accepts_fractional_timestamp() {
        let (store, temp_dir) = create_test_store();
        fs::write(
            temp_dir.path().join("company_list.json"),
            r#"{"data": [], "last_updated": 1700000000.734}"#,
        )
        .unwrap();

        let snapshot: Snapshot<Vec<TestRow>> = store.load("company_list").expect("Should load");

        assert!(snapshot.data.is_empty());
        assert_eq!(snapshot.last_updated, 1_700_000_000);
    }

    #[test]
    fn test_load_ignores_corrupt_file() {
        let (store, temp_dir) = create_test_store();
        fs::write(temp_dir.path().join("market_summary.json"), "{not json").unwrap();

        let result: Option<Snapshot<Vec<TestRow>>> = store.load("market_summary");

        assert!(result.is_none());
    }

    #[test]
    fn test_save_creates_directory_if_missing() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested").join("cache");
        let store = Store::with_dir(&nested);

        store.save("todays_prices", &rows(), 1).unwrap();

        assert!(nested.join("todays_prices.json").exists());
    }

    #[test]
    fn test_overwrite_existing_snapshot() {
        let (store, _temp_dir) = create_test_store();
        store.save("todays_prices", &rows(), 10).unwrap();
        store.save("todays_prices", &Vec::<TestRow>::new(), 20).unwrap();

        let snapshot: Snapshot<Vec<TestRow>> = store.load("todays_prices").unwrap();

        assert!(snapshot.data.is_empty());
        assert_eq!(snapshot.last_updated, 20);
    }

    #[test]
    fn test_new_creates_xdg_compliant_path() {
        if let Some(store) = Store::new() {
            let path_str = store.dir().to_string_lossy();
            assert!(path_str.contains("nepse-feed"), "Store path should contain project name");
        }
        // Passes if new() returns None (e.g., no home directory in CI)
    }
}
