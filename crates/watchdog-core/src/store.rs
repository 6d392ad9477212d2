//! Durable persistence for the baseline document.
//!
//! The document is written to a staging file in the target's own directory,
//! fsynced, then renamed over the previous version, so readers only ever see
//! the old document or the complete new one.

use crate::error::{Result, WatchdogError};
use crate::models::BaselineDocument;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STAGING_PREFIX: &str = ".watchdog_stage_";

/// Outcome of reading the store without falling back.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(BaselineDocument),
    Missing,
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, distinguishing a missing file from a corrupt one.
    pub fn try_load(&self) -> Result<LoadOutcome> {
        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadOutcome::Missing),
            Err(e) => return Err(WatchdogError::file(&self.path, e)),
        };
        match serde_json::from_slice::<BaselineDocument>(&data) {
            Ok(doc) => Ok(LoadOutcome::Loaded(doc)),
            Err(e) => Ok(LoadOutcome::Corrupt(e.to_string())),
        }
    }

    /// Read the document; a missing or unparsable store yields an empty one.
    pub fn load(&self) -> BaselineDocument {
        match self.try_load() {
            Ok(LoadOutcome::Loaded(doc)) => {
                debug!(path = %self.path.display(), files = doc.files.len(), "baseline loaded");
                doc
            }
            Ok(LoadOutcome::Missing) => {
                debug!(path = %self.path.display(), "no baseline store yet");
                BaselineDocument::default()
            }
            Ok(LoadOutcome::Corrupt(reason)) => {
                warn!(path = %self.path.display(), %reason, "baseline store is corrupt; starting empty");
                BaselineDocument::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "baseline store unreadable; starting empty");
                BaselineDocument::default()
            }
        }
    }

    /// Replace the stored document atomically.
    pub fn save(&self, doc: &BaselineDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.path, &json)
    }
}

/// Write `bytes` to `target` through a staging file in the same directory,
/// fsync it, rename it into place, then fsync the directory.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| WatchdogError::file(&parent, e))?;

    let mut staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(&parent)
        .map_err(|e| WatchdogError::file(&parent, e))?;
    staging
        .write_all(bytes)
        .map_err(|e| WatchdogError::file(staging.path(), e))?;
    staging
        .as_file()
        .sync_all()
        .map_err(|e| WatchdogError::file(staging.path(), e))?;
    staging
        .persist(target)
        .map_err(|e| WatchdogError::Persistence(format!("rename into {}: {}", target.display(), e.error)))?;

    #[cfg(unix)]
    {
        if let Ok(dir) = fs::OpenOptions::new().read(true).open(&parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileMetadata, FileRecord, FileStatus, HashAlgorithm};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn doc_with(path: &str) -> BaselineDocument {
        let mut doc = BaselineDocument::default();
        let now = Utc::now();
        doc.files.insert(
            path.to_string(),
            FileRecord {
                path: path.to_string(),
                hashes: BTreeMap::from([(HashAlgorithm::Sha256, "ab".repeat(32))]),
                metadata: FileMetadata {
                    size: 1,
                    mtime: now,
                    atime: now,
                    ctime: now,
                    mode: 0o100644,
                    file_id: 9,
                },
                timestamp: now,
                algorithm: HashAlgorithm::Sha256,
                signature: None,
                status: FileStatus::New,
            },
        );
        doc.statistics.total_scans = 1;
        doc
    }

    #[test]
    fn test_missing_store_loads_empty() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        assert!(matches!(store.try_load().unwrap(), LoadOutcome::Missing));
        assert_eq!(store.load(), BaselineDocument::default());
    }

    #[test]
    fn test_corrupt_store_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        fs::write(&path, b"{\"files\": [1, 2").unwrap();
        let store = BaselineStore::new(&path);
        assert!(matches!(store.try_load().unwrap(), LoadOutcome::Corrupt(_)));
        assert_eq!(store.load(), BaselineDocument::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("state").join("baseline.json"));
        let doc = doc_with("/etc/a.conf");
        store.save(&doc).unwrap();
        assert_eq!(store.load(), doc);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        for key in ["files", "alerts", "scanHistory", "statistics"] {
            assert!(raw.get(key).is_some(), "missing top-level key {key}");
        }
        assert_eq!(raw["files"]["/etc/a.conf"]["status"], "NEW");
    }

    #[test]
    fn test_save_replaces_and_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        store.save(&doc_with("/a")).unwrap();
        let second = doc_with("/b");
        store.save(&second).unwrap();
        assert_eq!(store.load(), second);

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["baseline.json".to_string()]);
    }

    #[test]
    fn test_interrupted_save_keeps_previous_document() {
        let dir = tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("baseline.json"));
        let committed = doc_with("/etc/a.conf");
        store.save(&committed).unwrap();

        // A save killed before its rename leaves only a partial staging file.
        let next = serde_json::to_vec_pretty(&doc_with("/etc/b.conf")).unwrap();
        let staged = dir.path().join(format!("{STAGING_PREFIX}interrupted"));
        fs::write(&staged, &next[..next.len() / 2]).unwrap();

        assert!(matches!(store.try_load().unwrap(), LoadOutcome::Loaded(d) if d == committed));
        assert_eq!(store.load(), committed);

        let replacement = doc_with("/etc/c.conf");
        store.save(&replacement).unwrap();
        assert_eq!(store.load(), replacement);
        assert_eq!(fs::read(&staged).unwrap(), &next[..next.len() / 2]);
    }

    #[test]
    fn test_empty_object_is_valid_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        fs::write(&path, b"{}").unwrap();
        let store = BaselineStore::new(&path);
        assert!(matches!(store.try_load().unwrap(), LoadOutcome::Loaded(_)));
    }
}
