//! Baseline scanner.
//!
//! Walks the monitored roots, keeps regular files matching the extension
//! filters, and fingerprints them on the hashing pool. Unreachable roots are
//! skipped; per-file failures are collected and never abort the scan.

use chrono::Utc;
use ed25519_dalek::SigningKey;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use watchdog_core::hashing;
use watchdog_core::models::{FileRecord, FileStatus, HashAlgorithm};
use watchdog_core::signing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    pub path: String,
    pub error: String,
}

/// Everything one baseline scan produced, before it is committed.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub records: BTreeMap<String, FileRecord>,
    pub directories_scanned: u64,
    pub skipped_directories: Vec<PathBuf>,
    pub errors: Vec<ScanError>,
    pub signature_error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone)]
pub struct IntegrityScanner {
    default_algorithm: HashAlgorithm,
    algorithms: Vec<HashAlgorithm>,
    pool: Arc<ThreadPool>,
}

/// An empty filter list admits every file.
pub fn matches_filter(file_name: &str, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|ext| file_name.ends_with(ext.as_str()))
}

impl IntegrityScanner {
    pub fn new(
        default_algorithm: HashAlgorithm,
        algorithms: Vec<HashAlgorithm>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        let mut algorithms = algorithms;
        if !algorithms.contains(&default_algorithm) {
            algorithms.push(default_algorithm);
        }
        Self {
            default_algorithm,
            algorithms,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Walk the roots and collect candidate files.
    fn collect_paths(
        &self,
        roots: &[PathBuf],
        filters: &[String],
    ) -> (Vec<PathBuf>, u64, Vec<PathBuf>, Vec<ScanError>) {
        let mut files = Vec::new();
        let mut scanned = 0u64;
        let mut skipped = Vec::new();
        let mut errors = Vec::new();

        for root in roots {
            if let Err(e) = fs::read_dir(root) {
                warn!(path = %root.display(), error = %e, "skipping unreadable directory");
                skipped.push(root.clone());
                continue;
            }
            scanned += 1;

            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| root.display().to_string());
                        errors.push(ScanError {
                            path,
                            error: e.to_string(),
                        });
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if !matches_filter(&name, filters) {
                    continue;
                }
                match entry.path().canonicalize() {
                    Ok(canonical) => files.push(canonical),
                    Err(e) => errors.push(ScanError {
                        path: entry.path().display().to_string(),
                        error: e.to_string(),
                    }),
                }
            }
        }

        files.sort();
        files.dedup();
        (files, scanned, skipped, errors)
    }

    fn build_record(&self, path: &Path) -> watchdog_core::Result<FileRecord> {
        let fp = hashing::fingerprint(path, &self.algorithms)?;
        Ok(FileRecord {
            path: path.display().to_string(),
            hashes: fp.hashes,
            metadata: fp.metadata,
            timestamp: Utc::now(),
            algorithm: self.default_algorithm,
            signature: None,
            status: FileStatus::New,
        })
    }

    /// Scan `roots` and build NEW records, signing each one when a key is
    /// supplied. A signing failure leaves that record unsigned and is kept
    /// as the outcome's `signature_error`.
    pub fn scan(
        &self,
        roots: &[PathBuf],
        filters: &[String],
        signer: Option<&SigningKey>,
    ) -> ScanOutcome {
        let started = Instant::now();
        info!(roots = roots.len(), filters = ?filters, "starting baseline scan");

        let (paths, directories_scanned, skipped_directories, mut errors) =
            self.collect_paths(roots, filters);
        debug!(candidates = paths.len(), "collected scan candidates");

        let results: Vec<(PathBuf, watchdog_core::Result<FileRecord>)> = self.pool.install(|| {
            paths
                .par_iter()
                .map(|p| (p.clone(), self.build_record(p)))
                .collect()
        });

        let mut records = BTreeMap::new();
        let mut signature_error = None;
        for (path, result) in results {
            let mut record = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to fingerprint file");
                    errors.push(ScanError {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if let Some(key) = signer {
                match signing::sign(&record, key) {
                    Ok(sig) => record.signature = Some(sig),
                    Err(e) => {
                        warn!(path = %record.path, error = %e, "record left unsigned");
                        signature_error.get_or_insert_with(|| e.to_string());
                    }
                }
            }
            records.insert(record.path.clone(), record);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            files = records.len(),
            directories = directories_scanned,
            skipped = skipped_directories.len(),
            errors = errors.len(),
            duration_ms,
            "baseline scan finished"
        );

        ScanOutcome {
            records,
            directories_scanned,
            skipped_directories,
            errors,
            signature_error,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scanner() -> IntegrityScanner {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        IntegrityScanner::new(
            HashAlgorithm::Sha256,
            vec![HashAlgorithm::Sha256, HashAlgorithm::Blake3],
            Arc::new(pool),
        )
    }

    #[test]
    fn test_filter_matching() {
        let conf = vec![".conf".to_string()];
        assert!(matches_filter("a.conf", &conf));
        assert!(!matches_filter("a.conf.bak", &conf));
        assert!(matches_filter("anything", &[]));
    }

    #[test]
    fn test_scan_filters_and_recurses() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        fs::write(dir.path().join("a.conf"), b"X").unwrap();
        fs::write(dir.path().join("nested/deeper/b.conf"), b"Y").unwrap();
        fs::write(dir.path().join("notes.txt"), b"Z").unwrap();

        let outcome = scanner().scan(&[dir.path().to_path_buf()], &[".conf".into()], None);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.directories_scanned, 1);
        assert!(outcome.errors.is_empty());
        for record in outcome.records.values() {
            assert_eq!(record.status, FileStatus::New);
            assert_eq!(record.hashes.len(), 2);
            assert!(record.signature.is_none());
            assert!(Path::new(&record.path).is_absolute());
        }
    }

    #[test]
    fn test_missing_root_is_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.conf"), b"X").unwrap();
        let missing = dir.path().join("does-not-exist");

        let outcome = scanner().scan(
            &[missing.clone(), dir.path().to_path_buf()],
            &[],
            None,
        );
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.skipped_directories, vec![missing]);
    }

    #[test]
    fn test_scan_signs_records() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.conf"), b"X").unwrap();
        let (sk, vk) = signing::generate_keypair();

        let outcome = scanner().scan(&[dir.path().to_path_buf()], &[], Some(&sk));
        let record = outcome.records.values().next().unwrap();
        assert!(signing::check_record(record, &vk).is_ok());
        assert!(outcome.signature_error.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_followed() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.conf"), b"S").unwrap();
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let outcome = scanner().scan(&[dir.path().to_path_buf()], &[], None);
        assert!(outcome.records.is_empty());
    }
}
