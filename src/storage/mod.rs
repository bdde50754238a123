//! Pluggable record persistence for the durable stores.
//!
//! Epistemic foundation:
//! - K_i: One JSON document per record, written atomically (write-then-rename)
//! - B_i: A record file may be corrupt → surfaced as a parse error, not a panic
//! - I^B: Crash during write → backup file preserves the previous version
//!
//! The checkpoint store and the dead letter queue are constructed over a
//! backend rather than reaching for global state, so tests run against
//! [`MemoryBackend`] and production runs against [`FileBackend`].

use crate::models::{EngineError, Result};
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Raw persistence for one collection of JSON records keyed by id.
pub trait StoreBackend: Send + Sync {
    /// Persist a record synchronously. Returns only after the record is
    /// durable.
    fn put(&self, id: &str, record: &serde_json::Value) -> Result<()>;

    /// Fetch a record by id.
    fn get(&self, id: &str) -> Result<Option<serde_json::Value>>;

    /// Remove a record. Removing a missing record is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// All record ids in the collection, in no particular order.
    fn ids(&self) -> Result<Vec<String>>;
}

/// Filesystem backend: one `<id>.json` per record under a directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| EngineError::io("creating store dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        // Record ids become file names; reject separators outright.
        self.dir.join(format!("{}.json", id.replace(['/', '\\'], "_")))
    }
}

impl StoreBackend for FileBackend {
    fn put(&self, id: &str, record: &serde_json::Value) -> Result<()> {
        let path = self.record_path(id);

        // Keep the previous version around in case the write is interrupted.
        if path.exists() {
            let backup = path.with_extension("backup.json");
            fs::copy(&path, &backup).map_err(|e| EngineError::io("backing up record", e))?;
        }

        let temp_path = path.with_extension("tmp.json");
        {
            let file =
                File::create(&temp_path).map_err(|e| EngineError::io("creating temp record", e))?;
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, record)
                .map_err(|e| EngineError::Internal(format!("Serializing record: {e}")))?;
        }

        fs::rename(&temp_path, &path).map_err(|e| EngineError::io("renaming record", e))?;
        debug!(id = %id, path = %path.display(), "Record persisted");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| EngineError::io("opening record", e))?;
        let reader = BufReader::new(file);
        let value = serde_json::from_reader(reader)
            .map_err(|e| EngineError::ParseError(format!("Invalid record {id}: {e}")))?;
        Ok(Some(value))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| EngineError::io("removing record", e))?;
        }
        let backup = path.with_extension("backup.json");
        if backup.exists() {
            fs::remove_file(&backup).map_err(|e| EngineError::io("removing record backup", e))?;
        }
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>> {
        let pattern = self.dir.join("*.json");
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| EngineError::Internal(format!("Invalid glob pattern: {e}")))?;

        let mut ids = Vec::new();
        for entry in entries.filter_map(|r| r.ok()) {
            let name = match entry.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => {
                    warn!(path = %entry.display(), "Skipping record with non-utf8 name");
                    continue;
                }
            };
            // Skip temp and backup artifacts from interrupted writes.
            if name.ends_with(".tmp.json") || name.ends_with(".backup.json") {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryBackend {
    records: DashMap<String, serde_json::Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn put(&self, id: &str, record: &serde_json::Value) -> Result<()> {
        self.records.insert(id.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>> {
        Ok(self.records.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_backend_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        let record = serde_json::json!({"job_id": "j1", "n": 1});
        backend.put("j1", &record).unwrap();
        assert_eq!(backend.get("j1").unwrap(), Some(record));

        backend.put("j1", &serde_json::json!({"n": 2})).unwrap();
        assert_eq!(
            backend.get("j1").unwrap().unwrap()["n"],
            serde_json::json!(2)
        );

        backend.delete("j1").unwrap();
        assert_eq!(backend.get("j1").unwrap(), None);
    }

    #[test]
    fn file_backend_lists_only_live_records() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        backend.put("a", &serde_json::json!({})).unwrap();
        backend.put("b", &serde_json::json!({})).unwrap();
        // Overwrite so a backup file exists alongside the live record.
        backend.put("a", &serde_json::json!({"v": 2})).unwrap();

        let mut ids = backend.ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn corrupt_record_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();

        match backend.get("bad") {
            Err(EngineError::ParseError(_)) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        backend.put("x", &serde_json::json!({"k": true})).unwrap();
        assert!(backend.get("x").unwrap().is_some());
        backend.delete("x").unwrap();
        assert!(backend.get("x").unwrap().is_none());
        assert!(backend.ids().unwrap().is_empty());
    }
}
