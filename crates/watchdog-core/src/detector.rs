//! Classification of a baseline record against a fresh observation.

use crate::models::{Alert, AlertDetails, AlertType, FileMetadata, FileRecord, FileStatus, HashAlgorithm, Severity};
use crate::signing;
use ed25519_dalek::VerifyingKey;
use std::collections::BTreeMap;

/// What the filesystem shows for a tracked path right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Present {
        hashes: BTreeMap<HashAlgorithm, String>,
        metadata: FileMetadata,
    },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: FileStatus,
    pub alert: Option<Alert>,
}

impl Classification {
    fn quiet(status: FileStatus) -> Self {
        Self {
            status,
            alert: None,
        }
    }
}

/// Classify `record` against `observation`.
///
/// Deletion outranks modification, which outranks a bad record signature.
/// The signature is only checked when `key` is given and the record carries
/// one; a signature failure leaves the status UNCHANGED but raises a critical
/// alert of its own.
pub fn classify(
    record: &FileRecord,
    observation: &Observation,
    key: Option<&VerifyingKey>,
) -> Classification {
    let algorithm = record.algorithm;
    let expected = record.primary_hash().unwrap_or_default().to_string();

    let current_hashes = match observation {
        Observation::Missing => {
            let alert = Alert::new(
                AlertType::FileDeleted,
                Severity::Critical,
                &record.path,
                format!("Monitored file deleted: {}", record.path),
                AlertDetails::Missing {
                    algorithm,
                    expected,
                },
            );
            return Classification {
                status: FileStatus::Deleted,
                alert: Some(alert),
            };
        }
        Observation::Present { hashes, .. } => hashes,
    };

    let current = current_hashes.get(&algorithm);
    if expected.is_empty() || current.map(String::as_str) != Some(expected.as_str()) {
        let alert = Alert::new(
            AlertType::FileModified,
            Severity::High,
            &record.path,
            format!("Monitored file modified: {}", record.path),
            AlertDetails::HashMismatch {
                algorithm,
                expected,
                current: current.cloned().unwrap_or_default(),
            },
        );
        return Classification {
            status: FileStatus::Modified,
            alert: Some(alert),
        };
    }

    if let (Some(key), Some(_)) = (key, record.signature.as_ref()) {
        if let Err(reason) = signing::check_record(record, key) {
            let alert = Alert::new(
                AlertType::SignatureInvalid,
                Severity::Critical,
                &record.path,
                format!("Baseline record signature invalid: {}", record.path),
                AlertDetails::Signature {
                    reason: reason.to_string(),
                },
            );
            return Classification {
                status: FileStatus::Unchanged,
                alert: Some(alert),
            };
        }
    }

    Classification::quiet(FileStatus::Unchanged)
}
