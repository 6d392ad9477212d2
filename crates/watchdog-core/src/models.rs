//! Data models for the integrity baseline.
//!
//! Everything here is serialized into the single persisted baseline document,
//! so field names are camelCase to match what dashboard callers consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Digest algorithms the hash engine can compute.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] = [Self::Sha256, Self::Sha512, Self::Blake3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification status of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    /// Admitted by the last scanner pass, not yet verified
    #[default]
    New,
    /// Content matches the baseline
    Unchanged,
    /// Content differs from the baseline
    Modified,
    /// File no longer exists; terminal until the next full scan
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Unchanged => "UNCHANGED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    FileModified,
    FileDeleted,
    SignatureInvalid,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileModified => "FileModified",
            Self::FileDeleted => "FileDeleted",
            Self::SignatureInvalid => "SignatureInvalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Filesystem metadata captured alongside the content hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
    /// Inode change time on Unix, creation time elsewhere
    pub ctime: DateTime<Utc>,
    pub mode: u32,
    /// Inode number on Unix, 0 where the platform exposes none
    pub file_id: u64,
}

/// One file's baseline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub hashes: BTreeMap<HashAlgorithm, String>,
    pub metadata: FileMetadata,
    pub timestamp: DateTime<Utc>,
    pub algorithm: HashAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub status: FileStatus,
}

impl FileRecord {
    /// Digest for the record's own default algorithm.
    pub fn primary_hash(&self) -> Option<&str> {
        self.hashes.get(&self.algorithm).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AlertDetails {
    #[serde(rename_all = "camelCase")]
    HashMismatch {
        algorithm: HashAlgorithm,
        expected: String,
        current: String,
    },
    #[serde(rename_all = "camelCase")]
    Missing {
        algorithm: HashAlgorithm,
        expected: String,
    },
    #[serde(rename_all = "camelCase")]
    Signature { reason: String },
}

impl AlertDetails {
    /// Digest observed when the alert was raised, for hash mismatches.
    pub fn current_digest(&self) -> Option<&str> {
        match self {
            Self::HashMismatch { current, .. } => Some(current),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub file_path: String,
    pub message: String,
    pub details: AlertDetails,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        file_path: &str,
        message: String,
        details: AlertDetails,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            alert_type,
            severity,
            file_path: file_path.to_string(),
            message,
            details,
        }
    }

    /// Subject line used by the delivery channels.
    pub fn subject(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.severity.as_str().to_uppercase(),
            self.alert_type.as_str(),
            self.file_path
        )
    }

    /// Plain-text body used by the delivery channels.
    pub fn body(&self) -> String {
        let detail = match &self.details {
            AlertDetails::HashMismatch {
                algorithm,
                expected,
                current,
            } => format!("{algorithm} expected {expected}\n{algorithm} current  {current}"),
            AlertDetails::Missing {
                algorithm,
                expected,
            } => format!("{algorithm} expected {expected}\nfile is missing"),
            AlertDetails::Signature { reason } => format!("signature check: {reason}"),
        };
        format!(
            "{}\npath: {}\ntime: {}\n{}",
            self.message,
            self.file_path,
            self.timestamp.to_rfc3339(),
            detail
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub directories: Vec<PathBuf>,
    pub extensions: Vec<String>,
    pub files_scanned: u64,
    #[serde(default)]
    pub errors: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_scans: u64,
    pub total_files_monitored: u64,
    pub total_alerts_generated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verification: Option<DateTime<Utc>>,
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub new: u64,
    pub unchanged: u64,
    pub modified: u64,
    pub deleted: u64,
}

// ============================================================================
// Persisted document
// ============================================================================

/// The whole persisted state: baseline records plus alerts, scan history and
/// statistics. Saved and replaced as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineDocument {
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub scan_history: Vec<ScanHistoryEntry>,
    #[serde(default)]
    pub statistics: Statistics,
}

impl BaselineDocument {
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.files.values() {
            match record.status {
                FileStatus::New => counts.new += 1,
                FileStatus::Unchanged => counts.unchanged += 1,
                FileStatus::Modified => counts.modified += 1,
                FileStatus::Deleted => counts.deleted += 1,
            }
        }
        counts
    }

    /// Whether an alert of `alert_type` for `path` was already raised at or
    /// after `since`.
    pub fn has_alert_since(&self, path: &str, alert_type: AlertType, since: DateTime<Utc>) -> bool {
        self.alerts
            .iter()
            .rev()
            .take_while(|a| a.timestamp >= since)
            .any(|a| a.file_path == path && a.alert_type == alert_type)
    }

    /// Most recent alert of `alert_type` for `path` raised at or after `since`.
    pub fn last_alert_since(
        &self,
        path: &str,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Option<&Alert> {
        self.alerts
            .iter()
            .rev()
            .take_while(|a| a.timestamp >= since)
            .find(|a| a.file_path == path && a.alert_type == alert_type)
    }

    /// Drop the oldest alerts and history entries beyond the given limits.
    pub fn enforce_retention(&mut self, max_alerts: usize, max_scan_history: usize) {
        if self.alerts.len() > max_alerts {
            let excess = self.alerts.len() - max_alerts;
            self.alerts.drain(..excess);
        }
        if self.scan_history.len() > max_scan_history {
            let excess = self.scan_history.len() - max_scan_history;
            self.scan_history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert_at(path: &str, alert_type: AlertType, ts: DateTime<Utc>) -> Alert {
        let mut a = Alert::new(
            alert_type,
            Severity::High,
            path,
            "test".into(),
            AlertDetails::Signature {
                reason: "x".into(),
            },
        );
        a.timestamp = ts;
        a
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&FileStatus::Unchanged).unwrap();
        assert_eq!(json, "\"UNCHANGED\"");
        let back: FileStatus = serde_json::from_str("\"DELETED\"").unwrap();
        assert_eq!(back, FileStatus::Deleted);
    }

    #[test]
    fn hash_map_keys_are_algorithm_names() {
        let mut hashes = BTreeMap::new();
        hashes.insert(HashAlgorithm::Sha256, "aa".to_string());
        hashes.insert(HashAlgorithm::Blake3, "bb".to_string());
        let json = serde_json::to_value(&hashes).unwrap();
        assert_eq!(json["sha256"], "aa");
        assert_eq!(json["blake3"], "bb");
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn alert_lookup_respects_since() {
        let t0 = Utc::now();
        let mut doc = BaselineDocument::default();
        doc.alerts
            .push(alert_at("/a", AlertType::FileModified, t0 - chrono::Duration::hours(1)));
        assert!(!doc.has_alert_since("/a", AlertType::FileModified, t0));
        doc.alerts.push(alert_at("/a", AlertType::FileModified, t0));
        assert!(doc.has_alert_since("/a", AlertType::FileModified, t0));
        assert!(!doc.has_alert_since("/a", AlertType::FileDeleted, t0));
        assert!(!doc.has_alert_since("/b", AlertType::FileModified, t0));
    }

    #[test]
    fn last_alert_is_most_recent_match() {
        let t0 = Utc::now();
        let mut doc = BaselineDocument::default();
        let mismatch = |current: &str, ts| {
            let mut a = alert_at("/a", AlertType::FileModified, ts);
            a.details = AlertDetails::HashMismatch {
                algorithm: HashAlgorithm::Sha256,
                expected: "00".into(),
                current: current.into(),
            };
            a
        };
        doc.alerts.push(mismatch("11", t0));
        doc.alerts.push(alert_at("/b", AlertType::FileModified, t0));
        doc.alerts.push(mismatch("22", t0));

        let last = doc
            .last_alert_since("/a", AlertType::FileModified, t0)
            .unwrap();
        assert_eq!(last.details.current_digest(), Some("22"));
        assert!(doc
            .last_alert_since("/a", AlertType::FileModified, t0 + chrono::Duration::seconds(1))
            .is_none());
        assert!(alert_at("/a", AlertType::SignatureInvalid, t0)
            .details
            .current_digest()
            .is_none());
    }

    #[test]
    fn retention_drops_oldest() {
        let mut doc = BaselineDocument::default();
        for i in 0..5 {
            doc.alerts
                .push(alert_at(&format!("/f{i}"), AlertType::FileDeleted, Utc::now()));
        }
        doc.enforce_retention(2, 10);
        assert_eq!(doc.alerts.len(), 2);
        assert_eq!(doc.alerts[0].file_path, "/f3");
        assert_eq!(doc.alerts[1].file_path, "/f4");
    }
}
