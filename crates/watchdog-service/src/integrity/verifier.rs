//! Verification pass over baseline records.
//!
//! Each record is observed and classified independently on the hashing
//! pool; the caller merges the results into the document in one commit.

use ed25519_dalek::VerifyingKey;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::path::Path;
use tracing::debug;
use watchdog_core::detector::{classify, Classification, Observation};
use watchdog_core::hashing;
use watchdog_core::models::{FileRecord, FileStatus};
use watchdog_core::Result;

#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Classified(Classification),
    /// Record was already DELETED and is not re-examined.
    StillDeleted,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FileCheck {
    pub path: String,
    pub outcome: CheckOutcome,
}

/// Observe `path` now, hashing only the record's own algorithm.
pub fn observe(record: &FileRecord) -> Result<Observation> {
    let path = Path::new(&record.path);
    match hashing::fingerprint(path, &[record.algorithm]) {
        Ok(fp) => Ok(Observation::Present {
            hashes: fp.hashes,
            metadata: fp.metadata,
        }),
        Err(e) if e.is_not_found() => Ok(Observation::Missing),
        Err(e) => Err(e),
    }
}

fn classify_observed(
    record: &FileRecord,
    observation: &Observation,
    key: Option<&VerifyingKey>,
) -> Classification {
    let classification = classify(record, observation, key);
    if classification.status == FileStatus::Unchanged {
        if let Observation::Present { metadata, .. } = observation {
            if metadata.size != record.metadata.size
                || metadata.mtime != record.metadata.mtime
                || metadata.mode != record.metadata.mode
            {
                debug!(path = %record.path, "metadata changed with identical content");
            }
        }
    }
    classification
}

/// Observe and classify one record.
pub fn check_record(record: &FileRecord, key: Option<&VerifyingKey>) -> FileCheck {
    let outcome = if record.status == FileStatus::Deleted {
        CheckOutcome::StillDeleted
    } else {
        match observe(record) {
            Ok(observation) => {
                CheckOutcome::Classified(classify_observed(record, &observation, key))
            }
            Err(e) => CheckOutcome::Failed(e.to_string()),
        }
    };
    FileCheck {
        path: record.path.clone(),
        outcome,
    }
}

/// Check every record on `pool`.
pub fn check_all(
    pool: &ThreadPool,
    records: &[FileRecord],
    key: Option<&VerifyingKey>,
) -> Vec<FileCheck> {
    pool.install(|| records.par_iter().map(|r| check_record(r, key)).collect())
}

/// Check one record, surfacing a hashing failure as an error.
pub fn check_one(record: &FileRecord, key: Option<&VerifyingKey>) -> Result<FileCheck> {
    let outcome = if record.status == FileStatus::Deleted {
        CheckOutcome::StillDeleted
    } else {
        let observation = observe(record)?;
        CheckOutcome::Classified(classify_observed(record, &observation, key))
    };
    Ok(FileCheck {
        path: record.path.clone(),
        outcome,
    })
}
